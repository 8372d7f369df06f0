//! Engine module housing the `EngineHandle` orchestration layer.
//!
//! The handle owns the device link, profile store, calibration controller
//! and event bus, and runs the live classifier task.

pub mod core;

pub use core::EngineHandle;
