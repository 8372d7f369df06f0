// Analysis module - blink detection on the live sample stream
//
// Pipeline per sample: MovingAverage → LevelCrossingDetector (hysteresis
// gate) → confidence scoring, wrapped by BlinkClassifier. `blink_events`
// lifts the classifier over a sample stream; BlinkWatchdog flags long
// stretches without a blink.

pub mod classifier;
pub mod level_crossing;
pub mod smoothing;
pub mod watchdog;

pub use classifier::{blink_events, BlinkClassifier, BlinkEvent};
pub use level_crossing::{GateLevels, LevelCrossingDetector, Polarity};
pub use smoothing::MovingAverage;
pub use watchdog::BlinkWatchdog;
