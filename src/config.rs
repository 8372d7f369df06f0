//! Configuration management for runtime parameter tuning
//!
//! This module provides runtime configuration loading from JSON files so
//! link timing, calibration windows, and classifier constants can be tuned
//! against real sensor traces without recompilation. Durations are stored
//! as milliseconds; accessor methods convert them to `Duration`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Complete application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub link: LinkConfig,
    pub queue: QueueConfig,
    pub calibration: CalibrationConfig,
    pub classifier: ClassifierConfig,
    pub telemetry: TelemetryConfig,
}

/// Device link timing and reconnect policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Bound on the connect handshake
    pub connect_timeout_ms: u64,
    /// Default scan duration when the caller passes none
    pub scan_timeout_ms: u64,
    /// First reconnect delay
    pub reconnect_base_ms: u64,
    /// Upper bound on a single reconnect delay
    pub reconnect_cap_ms: u64,
    /// Attempts before the link is declared lost
    pub max_reconnect_attempts: u32,
    /// Randomize reconnect delays to avoid lockstep retries
    pub jitter: bool,
    /// Collaborators may reconnect to the last known device on startup
    pub auto_connect: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            scan_timeout_ms: 5_000,
            reconnect_base_ms: 500,
            reconnect_cap_ms: 8_000,
            max_reconnect_attempts: 5,
            jitter: true,
            auto_connect: false,
        }
    }
}

impl LinkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }
}

/// Sample queue between the link and its consumer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue length at which the oldest samples start being dropped
    pub high_water_mark: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            high_water_mark: 1_000,
        }
    }
}

/// Calibration procedure configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Sample-time length of the baseline stage
    pub baseline_duration_ms: u64,
    /// Sample-time length of one excursion trial
    pub trial_window_ms: u64,
    /// Trials per polarity
    pub trials: u8,
    /// Fraction of the weakest trial peak used as threshold offset
    pub safety_margin: f64,
    /// Capacity of the session's raw sample ring
    pub buffer_capacity: usize,
    /// Channel index used for calibration
    pub channel: usize,
    /// Wall-clock bound on any stage that stops receiving samples
    pub stage_timeout_ms: u64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            baseline_duration_ms: 2_000,
            trial_window_ms: 1_000,
            trials: 3,
            safety_margin: 0.7,
            buffer_capacity: 512,
            channel: 0,
            stage_timeout_ms: 10_000,
        }
    }
}

impl CalibrationConfig {
    pub fn baseline_duration_us(&self) -> u64 {
        self.baseline_duration_ms * 1_000
    }

    pub fn trial_window_us(&self) -> u64 {
        self.trial_window_ms * 1_000
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }
}

/// Blink classifier constants
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Moving-average length in samples (1 disables smoothing)
    pub smoothing_window: usize,
    /// Fraction of the threshold span around baseline that re-arms a polarity
    pub dead_zone_ratio: f64,
    /// Confidence scaling; None uses half the threshold-to-baseline span
    pub confidence_margin: Option<f64>,
    /// Channel index classified
    pub channel: usize,
    /// Sample-time interval without blinks before an overdue notice
    pub no_blink_interval_ms: Option<u64>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            smoothing_window: 5,
            dead_zone_ratio: 0.5,
            confidence_margin: None,
            channel: 0,
            no_blink_interval_ms: Some(10_000),
        }
    }
}

/// Diagnostics telemetry sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub channel_capacity: usize,
    pub history_capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            history_capacity: 64,
        }
    }
}

impl AppConfig {
    /// Load configuration from JSON file
    ///
    /// Missing files and invalid JSON fall back to defaults with a warning.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Self {
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    log::info!("[Config] Loaded configuration from {:?}", path.as_ref());
                    config
                }
                Err(err) => {
                    log::warn!(
                        "[Config] Failed to parse JSON from {:?}: {}. Using defaults.",
                        path.as_ref(),
                        err
                    );
                    Self::default()
                }
            },
            Err(err) => {
                log::warn!(
                    "[Config] Failed to read config file {:?}: {}. Using defaults.",
                    path.as_ref(),
                    err
                );
                Self::default()
            }
        }
    }
}
