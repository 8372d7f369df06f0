// CalibrationPhase - observable state of the calibration controller

use serde::{Deserialize, Serialize};

use crate::error::CalibrationError;
use crate::profile::Profile;

/// Controller state.
///
/// ```text
/// Idle → AwaitingDevice → CollectingBaseline → CollectingPositive{1..n}
///      → CollectingNegative{1..n} → Computing → Ready(Profile)
///      → Committed | Cancelled | Failed(reason)
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", content = "detail", rename_all = "snake_case")]
pub enum CalibrationPhase {
    Idle,
    /// Connecting and subscribing to the sensor
    AwaitingDevice,
    CollectingBaseline,
    /// Waiting for an upward blink; `trial` counts from 1
    CollectingPositive { trial: u8 },
    /// Waiting for a downward blink; `trial` counts from 1
    CollectingNegative { trial: u8 },
    Computing,
    /// Provisional profile awaiting `commit`
    Ready(Profile),
    Committed(Profile),
    Cancelled,
    Failed(CalibrationError),
}

impl CalibrationPhase {
    /// Committed, Cancelled or Failed
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CalibrationPhase::Committed(_) | CalibrationPhase::Cancelled | CalibrationPhase::Failed(_)
        )
    }

    /// Phases in which a link disconnect fails the session
    pub fn is_collecting(&self) -> bool {
        matches!(
            self,
            CalibrationPhase::CollectingBaseline
                | CalibrationPhase::CollectingPositive { .. }
                | CalibrationPhase::CollectingNegative { .. }
                | CalibrationPhase::Computing
        )
    }

    /// A session task owns the controller
    pub fn is_running(&self) -> bool {
        matches!(self, CalibrationPhase::AwaitingDevice) || self.is_collecting()
    }

    pub fn name(&self) -> &'static str {
        match self {
            CalibrationPhase::Idle => "idle",
            CalibrationPhase::AwaitingDevice => "awaiting_device",
            CalibrationPhase::CollectingBaseline => "collecting_baseline",
            CalibrationPhase::CollectingPositive { .. } => "collecting_positive",
            CalibrationPhase::CollectingNegative { .. } => "collecting_negative",
            CalibrationPhase::Computing => "computing",
            CalibrationPhase::Ready(_) => "ready",
            CalibrationPhase::Committed(_) => "committed",
            CalibrationPhase::Cancelled => "cancelled",
            CalibrationPhase::Failed(_) => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_predicates() {
        assert!(CalibrationPhase::Cancelled.is_terminal());
        assert!(CalibrationPhase::Failed(CalibrationError::LinkLost).is_terminal());
        assert!(!CalibrationPhase::Idle.is_terminal());

        assert!(CalibrationPhase::Computing.is_collecting());
        assert!(!CalibrationPhase::AwaitingDevice.is_collecting());
        assert!(CalibrationPhase::AwaitingDevice.is_running());
        assert!(!CalibrationPhase::Ready(Profile::new("p", 10, -10, 0)).is_running());
    }

    #[test]
    fn test_phase_serialization() {
        let json = serde_json::to_value(CalibrationPhase::CollectingPositive { trial: 2 }).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"phase": "collecting_positive", "detail": {"trial": 2}})
        );

        let json = serde_json::to_value(CalibrationPhase::Failed(CalibrationError::LinkLost)).unwrap();
        assert_eq!(json["phase"], "failed");
        assert_eq!(json["detail"]["kind"], "link_lost");
    }
}
