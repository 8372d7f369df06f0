// Profile store error types and constants

use crate::error::ErrorCode;
use log::error;
use std::fmt;

/// Profile store error code constants
///
/// Error code range: 4001-4004
pub struct ProfileErrorCodes {}

impl ProfileErrorCodes {
    /// Thresholds violate positive > baseline > negative
    pub const INVALID_THRESHOLDS: i32 = 4001;

    /// No profile with the requested name
    pub const NOT_FOUND: i32 = 4002;

    /// Profile name is empty
    pub const EMPTY_NAME: i32 = 4003;

    /// Profile table lock was poisoned
    pub const STATE_POISONED: i32 = 4004;
}

/// Log a profile error with structured context
pub fn log_profile_error(err: &ProfileError, context: &str) {
    error!(
        "Profile error in {}: code={}, component=ProfileStore, message={}",
        context,
        err.code(),
        err.message()
    );
}

/// Profile store errors
#[derive(Debug, Clone, PartialEq)]
pub enum ProfileError {
    /// Thresholds are not strictly ordered around the baseline
    InvalidThresholds {
        positive: i32,
        baseline: i32,
        negative: i32,
    },

    /// Lookup by name failed
    NotFound { name: String },

    /// Profiles are keyed by name; an empty key is refused
    EmptyName,

    /// Profile table lock was poisoned
    StatePoisoned,
}

impl ErrorCode for ProfileError {
    fn code(&self) -> i32 {
        match self {
            ProfileError::InvalidThresholds { .. } => ProfileErrorCodes::INVALID_THRESHOLDS,
            ProfileError::NotFound { .. } => ProfileErrorCodes::NOT_FOUND,
            ProfileError::EmptyName => ProfileErrorCodes::EMPTY_NAME,
            ProfileError::StatePoisoned => ProfileErrorCodes::STATE_POISONED,
        }
    }

    fn message(&self) -> String {
        match self {
            ProfileError::InvalidThresholds {
                positive,
                baseline,
                negative,
            } => format!(
                "Invalid thresholds: need positive > baseline > negative (got {} / {} / {})",
                positive, baseline, negative
            ),
            ProfileError::NotFound { name } => format!("Profile not found: {}", name),
            ProfileError::EmptyName => "Profile name must not be empty".to_string(),
            ProfileError::StatePoisoned => "Profile store lock poisoned".to_string(),
        }
    }
}

impl fmt::Display for ProfileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ProfileError::{:?} (code {}): {}",
            self,
            self.code(),
            self.message()
        )
    }
}

impl std::error::Error for ProfileError {}
