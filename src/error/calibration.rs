// Calibration error types and constants

use crate::error::{ErrorCode, LinkError, ProfileError};
use log::error;
use std::fmt;

/// Calibration error code constants
///
/// Error code range: 2001-2008
pub struct CalibrationErrorCodes {}

impl CalibrationErrorCodes {
    /// Computed thresholds violate the ordering invariant
    pub const INVALID_CALIBRATION: i32 = 2001;

    /// Device link dropped while collecting or computing
    pub const LINK_LOST: i32 = 2002;

    /// Session cancelled by the caller
    pub const CANCELLED: i32 = 2003;

    /// Connect or subscribe failed before collection started
    pub const DEVICE_UNAVAILABLE: i32 = 2004;

    /// A collection stage received no samples within its wall-clock bound
    pub const TIMEOUT: i32 = 2005;

    /// Calibration already in progress
    pub const ALREADY_IN_PROGRESS: i32 = 2006;

    /// Commit requested outside the Ready phase
    pub const NOT_READY: i32 = 2007;

    /// Profile store refused the committed profile
    pub const PROFILE_REJECTED: i32 = 2008;
}

/// Log a calibration error with structured context
///
/// The logging is non-blocking and will not panic on failure.
pub fn log_calibration_error(err: &CalibrationError, context: &str) {
    error!(
        "Calibration error in {}: code={}, component=CalibrationController, message={}",
        context,
        err.code(),
        err.message()
    );
}

/// Calibration-related errors
///
/// Session failures surface as the reason inside `CalibrationPhase::Failed`;
/// only caller preconditions (`start` while busy, `commit` outside Ready)
/// are returned directly.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CalibrationError {
    /// Thresholds failed validation
    InvalidCalibration { reason: String },

    /// Link dropped mid-session
    LinkLost,

    /// Cancelled by the caller
    Cancelled,

    /// Device could not be connected or subscribed
    DeviceUnavailable { reason: String, code: i32 },

    /// A stage saw no progress before its deadline
    Timeout { stage: String },

    /// A session is already running
    AlreadyInProgress,

    /// No provisional profile to commit
    NotReady,

    /// Store refused the profile
    ProfileRejected { reason: String, code: i32 },
}

impl CalibrationError {
    /// Wrap a link failure that happened before collection started
    pub fn device_unavailable(err: &LinkError) -> Self {
        CalibrationError::DeviceUnavailable {
            reason: err.message(),
            code: err.code(),
        }
    }

    /// Wrap a store rejection raised by `commit`
    pub fn profile_rejected(err: &ProfileError) -> Self {
        CalibrationError::ProfileRejected {
            reason: err.message(),
            code: err.code(),
        }
    }
}

impl ErrorCode for CalibrationError {
    fn code(&self) -> i32 {
        match self {
            CalibrationError::InvalidCalibration { .. } => {
                CalibrationErrorCodes::INVALID_CALIBRATION
            }
            CalibrationError::LinkLost => CalibrationErrorCodes::LINK_LOST,
            CalibrationError::Cancelled => CalibrationErrorCodes::CANCELLED,
            CalibrationError::DeviceUnavailable { .. } => CalibrationErrorCodes::DEVICE_UNAVAILABLE,
            CalibrationError::Timeout { .. } => CalibrationErrorCodes::TIMEOUT,
            CalibrationError::AlreadyInProgress => CalibrationErrorCodes::ALREADY_IN_PROGRESS,
            CalibrationError::NotReady => CalibrationErrorCodes::NOT_READY,
            CalibrationError::ProfileRejected { .. } => CalibrationErrorCodes::PROFILE_REJECTED,
        }
    }

    fn message(&self) -> String {
        match self {
            CalibrationError::InvalidCalibration { reason } => {
                format!("Invalid calibration: {}", reason)
            }
            CalibrationError::LinkLost => {
                "Device link lost during calibration. Start a new session.".to_string()
            }
            CalibrationError::Cancelled => "Calibration cancelled".to_string(),
            CalibrationError::DeviceUnavailable { reason, code } => {
                format!("Device unavailable (link code {}): {}", code, reason)
            }
            CalibrationError::Timeout { stage } => {
                format!("Calibration timed out waiting for samples in {}", stage)
            }
            CalibrationError::AlreadyInProgress => "Calibration already in progress".to_string(),
            CalibrationError::NotReady => "No calibration result ready to commit".to_string(),
            CalibrationError::ProfileRejected { reason, .. } => {
                format!("Profile rejected: {}", reason)
            }
        }
    }
}

impl fmt::Display for CalibrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CalibrationError::{:?} (code {}): {}",
            self,
            self.code(),
            self.message()
        )
    }
}

impl std::error::Error for CalibrationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calibration_error_codes() {
        assert_eq!(
            CalibrationError::InvalidCalibration {
                reason: "test".to_string()
            }
            .code(),
            CalibrationErrorCodes::INVALID_CALIBRATION
        );
        assert_eq!(
            CalibrationError::LinkLost.code(),
            CalibrationErrorCodes::LINK_LOST
        );
        assert_eq!(
            CalibrationError::Cancelled.code(),
            CalibrationErrorCodes::CANCELLED
        );
        assert_eq!(
            CalibrationError::AlreadyInProgress.code(),
            CalibrationErrorCodes::ALREADY_IN_PROGRESS
        );
        assert_eq!(CalibrationError::NotReady.code(), 2007);
    }

    #[test]
    fn test_wrapped_errors_keep_origin_code() {
        let err = CalibrationError::device_unavailable(&LinkError::Timeout { timeout_ms: 5 });
        match &err {
            CalibrationError::DeviceUnavailable { code, .. } => assert_eq!(*code, 3002),
            other => panic!("Expected DeviceUnavailable, got {:?}", other),
        }
        assert!(err.message().contains("3002"));

        let err = CalibrationError::profile_rejected(&ProfileError::EmptyName);
        assert!(err.message().contains("empty"));
    }

    #[test]
    fn test_calibration_error_display() {
        let err = CalibrationError::NotReady;
        let display = format!("{}", err);
        assert!(display.contains("CalibrationError"));
        assert!(display.contains(&err.code().to_string()));
    }
}
