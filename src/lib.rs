// eyedrops Core - blink sensor link, calibration and classification
// Async device plumbing with a per-user threshold profile store

// Module declarations
pub mod analysis;
pub mod calibration;
pub mod config;
pub mod engine;
pub mod error;
pub mod link;
pub mod managers;
pub mod profile;
pub mod telemetry;

// Re-exports for convenience
pub use analysis::{BlinkClassifier, BlinkEvent, Polarity};
pub use calibration::{CalibrationController, CalibrationPhase};
pub use config::AppConfig;
pub use engine::EngineHandle;
pub use error::{CalibrationError, EngineError, ErrorCode, LinkError, ProfileError};
pub use link::{Device, DeviceId, DeviceLink, LinkState, Sample, SensorTransport};
pub use managers::{CoreEvent, EventBus};
pub use profile::{Profile, ProfileStore};
