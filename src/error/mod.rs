// Error types for the eyedrops core
//
// This module defines custom error types for the device link, the profile
// store and the calibration controller, each carrying a stable numeric code
// so collaborators outside the core can react without string matching.

mod calibration;
mod link;
mod profile;

use std::fmt;

pub use calibration::{log_calibration_error, CalibrationError, CalibrationErrorCodes};
pub use link::{log_link_error, LinkError, LinkErrorCodes};
pub use profile::{log_profile_error, ProfileError, ProfileErrorCodes};

/// Error codes for structured error reporting
///
/// This trait provides a standard way to get error codes and messages
/// from custom error types, enabling consistent error handling across
/// component boundaries.
pub trait ErrorCode {
    /// Get the numeric error code
    fn code(&self) -> i32;

    /// Get the human-readable error message
    fn message(&self) -> String;
}

/// Errors returned by engine-level operations that span components.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    Link(LinkError),
    Profile(ProfileError),
    Calibration(CalibrationError),
}

impl ErrorCode for EngineError {
    fn code(&self) -> i32 {
        match self {
            EngineError::Link(err) => err.code(),
            EngineError::Profile(err) => err.code(),
            EngineError::Calibration(err) => err.code(),
        }
    }

    fn message(&self) -> String {
        match self {
            EngineError::Link(err) => err.message(),
            EngineError::Profile(err) => err.message(),
            EngineError::Calibration(err) => err.message(),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Link(err) => err.fmt(f),
            EngineError::Profile(err) => err.fmt(f),
            EngineError::Calibration(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<LinkError> for EngineError {
    fn from(err: LinkError) -> Self {
        EngineError::Link(err)
    }
}

impl From<ProfileError> for EngineError {
    fn from(err: ProfileError) -> Self {
        EngineError::Profile(err)
    }
}

impl From<CalibrationError> for EngineError {
    fn from(err: CalibrationError) -> Self {
        EngineError::Calibration(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_error_delegates_code_and_message() {
        let err: EngineError = LinkError::NotConnected.into();
        assert_eq!(err.code(), LinkErrorCodes::NOT_CONNECTED);
        assert_eq!(err.message(), LinkError::NotConnected.message());

        let err: EngineError = ProfileError::NotFound {
            name: "alice".to_string(),
        }
        .into();
        assert_eq!(err.code(), ProfileErrorCodes::NOT_FOUND);
        assert!(err.to_string().contains("alice"));
    }
}
