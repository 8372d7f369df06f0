// Profile: named threshold pair produced by calibration

use serde::{Deserialize, Serialize};

use crate::error::ProfileError;
use crate::link::Command;

/// Per-user detection thresholds in raw sensor units.
///
/// Any profile held by the store satisfies
/// `positive_threshold > baseline > negative_threshold`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub positive_threshold: i32,
    pub negative_threshold: i32,
    pub baseline: i32,
    /// Unix epoch milliseconds
    pub created_at_ms: u64,
}

impl Profile {
    /// Build a profile stamped with the current time.
    pub fn new(
        name: impl Into<String>,
        positive_threshold: i32,
        negative_threshold: i32,
        baseline: i32,
    ) -> Self {
        Self {
            name: name.into(),
            positive_threshold,
            negative_threshold,
            baseline,
            created_at_ms: crate::telemetry::now_timestamp_ms(),
        }
    }

    /// Check the threshold ordering and the name key.
    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.name.trim().is_empty() {
            return Err(ProfileError::EmptyName);
        }
        if self.positive_threshold > self.baseline && self.baseline > self.negative_threshold {
            Ok(())
        } else {
            Err(ProfileError::InvalidThresholds {
                positive: self.positive_threshold,
                baseline: self.baseline,
                negative: self.negative_threshold,
            })
        }
    }

    pub fn positive_span(&self) -> i32 {
        self.positive_threshold - self.baseline
    }

    pub fn negative_span(&self) -> i32 {
        self.baseline - self.negative_threshold
    }

    /// Copy under a new name, keeping thresholds and timestamp.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    /// Configuration write that loads these thresholds on-device
    pub fn apply_command(&self) -> Command {
        Command::ApplyProfile {
            positive_threshold: self.positive_threshold,
            negative_threshold: self.negative_threshold,
            baseline: self.baseline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_baseline_above_positive() {
        let profile = Profile::new("p", 10, 5, 20);
        assert_eq!(
            profile.validate(),
            Err(ProfileError::InvalidThresholds {
                positive: 10,
                baseline: 20,
                negative: 5,
            })
        );
    }

    #[test]
    fn rejects_equal_thresholds_and_blank_names() {
        assert!(Profile::new("p", 0, -5, 0).validate().is_err());
        assert!(Profile::new("p", 5, 0, 0).validate().is_err());
        assert_eq!(
            Profile::new("  ", 10, -10, 0).validate(),
            Err(ProfileError::EmptyName)
        );
        assert!(Profile::new("p", 10, -10, 0).validate().is_ok());
    }

    #[test]
    fn spans_and_command() {
        let profile = Profile::new("p", 100, -60, 20);
        assert_eq!(profile.positive_span(), 80);
        assert_eq!(profile.negative_span(), 80);
        assert_eq!(
            profile.apply_command(),
            Command::ApplyProfile {
                positive_threshold: 100,
                negative_threshold: -60,
                baseline: 20,
            }
        );
    }
}
