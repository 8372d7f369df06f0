// Device link error types and constants

use crate::error::ErrorCode;
use log::error;
use std::fmt;

/// Device link error code constants
///
/// Error code range: 3001-3010
pub struct LinkErrorCodes {}

impl LinkErrorCodes {
    /// Device vanished before the connection was established
    pub const NOT_FOUND: i32 = 3001;

    /// Handshake did not complete within the connect window
    pub const TIMEOUT: i32 = 3002;

    /// Operation requires a connected device
    pub const NOT_CONNECTED: i32 = 3003;

    /// A sample subscriber is already active
    pub const ALREADY_STREAMING: i32 = 3004;

    /// Device refused a characteristic write
    pub const WRITE_REJECTED: i32 = 3005;

    /// Connection lost and reconnect attempts exhausted
    pub const LINK_LOST: i32 = 3006;

    /// A connection is already established or pending
    pub const ALREADY_CONNECTED: i32 = 3007;

    /// Pending operation was cancelled
    pub const CANCELLED: i32 = 3008;

    /// Radio backend failure
    pub const TRANSPORT: i32 = 3009;

    /// Link state lock was poisoned
    pub const STATE_POISONED: i32 = 3010;
}

/// Log a link error with structured context
pub fn log_link_error(err: &LinkError, context: &str) {
    error!(
        "Link error in {}: code={}, component=DeviceLink, message={}",
        context,
        err.code(),
        err.message()
    );
}

/// Device link errors
///
/// Error code range: 3001-3010
#[derive(Debug, Clone, PartialEq)]
pub enum LinkError {
    /// Device is no longer advertising
    NotFound { device_id: String },

    /// No handshake within the connect window
    Timeout { timeout_ms: u64 },

    /// Operation requires Connected or Streaming
    NotConnected,

    /// Exactly one subscriber may be active at a time
    AlreadyStreaming,

    /// Device NAK'd the write
    WriteRejected { reason: String },

    /// Reconnect attempts exhausted
    LinkLost,

    /// Connect requested while already connected or connecting
    AlreadyConnected,

    /// Pending scan or connect was cancelled
    Cancelled,

    /// Backend failure not covered by the other variants
    Transport { reason: String },

    /// Link state lock was poisoned
    StatePoisoned,
}

impl ErrorCode for LinkError {
    fn code(&self) -> i32 {
        match self {
            LinkError::NotFound { .. } => LinkErrorCodes::NOT_FOUND,
            LinkError::Timeout { .. } => LinkErrorCodes::TIMEOUT,
            LinkError::NotConnected => LinkErrorCodes::NOT_CONNECTED,
            LinkError::AlreadyStreaming => LinkErrorCodes::ALREADY_STREAMING,
            LinkError::WriteRejected { .. } => LinkErrorCodes::WRITE_REJECTED,
            LinkError::LinkLost => LinkErrorCodes::LINK_LOST,
            LinkError::AlreadyConnected => LinkErrorCodes::ALREADY_CONNECTED,
            LinkError::Cancelled => LinkErrorCodes::CANCELLED,
            LinkError::Transport { .. } => LinkErrorCodes::TRANSPORT,
            LinkError::StatePoisoned => LinkErrorCodes::STATE_POISONED,
        }
    }

    fn message(&self) -> String {
        match self {
            LinkError::NotFound { device_id } => format!("Device not found: {}", device_id),
            LinkError::Timeout { timeout_ms } => {
                format!("Connection handshake timed out after {} ms", timeout_ms)
            }
            LinkError::NotConnected => "No device connected".to_string(),
            LinkError::AlreadyStreaming => {
                "A sample subscriber is already active. Cancel it first.".to_string()
            }
            LinkError::WriteRejected { reason } => format!("Write rejected: {}", reason),
            LinkError::LinkLost => "Link lost after exhausting reconnect attempts".to_string(),
            LinkError::AlreadyConnected => "Device link already connected".to_string(),
            LinkError::Cancelled => "Link operation cancelled".to_string(),
            LinkError::Transport { reason } => format!("Transport failure: {}", reason),
            LinkError::StatePoisoned => "Link state lock poisoned".to_string(),
        }
    }
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LinkError::{:?} (code {}): {}",
            self,
            self.code(),
            self.message()
        )
    }
}

impl std::error::Error for LinkError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_error_codes() {
        assert_eq!(
            LinkError::NotFound {
                device_id: "x".to_string()
            }
            .code(),
            LinkErrorCodes::NOT_FOUND
        );
        assert_eq!(
            LinkError::Timeout { timeout_ms: 10 }.code(),
            LinkErrorCodes::TIMEOUT
        );
        assert_eq!(LinkError::NotConnected.code(), 3003);
        assert_eq!(LinkError::AlreadyStreaming.code(), 3004);
        assert_eq!(
            LinkError::WriteRejected {
                reason: "nak".to_string()
            }
            .code(),
            3005
        );
        assert_eq!(LinkError::LinkLost.code(), 3006);
        assert_eq!(LinkError::AlreadyConnected.code(), 3007);
        assert_eq!(LinkError::Cancelled.code(), 3008);
        assert_eq!(LinkError::StatePoisoned.code(), 3010);
    }

    #[test]
    fn test_link_error_messages() {
        let err = LinkError::Timeout { timeout_ms: 10_000 };
        assert_eq!(
            err.message(),
            "Connection handshake timed out after 10000 ms"
        );

        let err = LinkError::NotFound {
            device_id: "AA:BB".to_string(),
        };
        assert!(err.message().contains("AA:BB"));

        let display = format!("{}", LinkError::LinkLost);
        assert!(display.contains("LinkError"));
        assert!(display.contains("3006"));
    }
}
