// Calibration module - per-user threshold calibration
//
// This module provides three components:
// 1. CalibrationPhase: observable controller state
// 2. CalibrationSession: baseline and trial-peak math over collected samples
// 3. CalibrationController: async state machine driving a session against
//    the device link and committing the result to the profile store
//
// The calibration workflow:
// 1. start(device) connects and subscribes
// 2. Collect baseline, then N upward and N downward blink trials
// 3. Compute thresholds, then commit(name) stores the profile

pub mod controller;
pub mod phase;
pub mod session;

pub use controller::CalibrationController;
pub use phase::CalibrationPhase;
pub use session::{CalibrationSession, ProvisionalThresholds};
