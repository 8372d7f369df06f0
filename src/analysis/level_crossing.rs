// Level crossing - threshold gate with per-polarity hysteresis
//
// A polarity fires when the smoothed value reaches its threshold and is
// then disarmed. It re-arms only once the value falls back inside the
// dead zone around baseline, so noise hovering at a threshold produces
// one event per excursion.

use crate::profile::Profile;

/// Direction of a threshold crossing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    /// Excursion above the positive threshold
    Positive,
    /// Excursion below the negative threshold
    Negative,
}

/// Threshold and re-arm levels derived from a profile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateLevels {
    pub positive_threshold: f64,
    pub negative_threshold: f64,
    /// Positive re-arms at or below this level
    pub positive_rearm: f64,
    /// Negative re-arms at or above this level
    pub negative_rearm: f64,
}

impl GateLevels {
    /// Dead zone is `baseline ± (threshold - baseline) * dead_zone_ratio`
    pub fn from_profile(profile: &Profile, dead_zone_ratio: f64) -> Self {
        let baseline = profile.baseline as f64;
        let ratio = dead_zone_ratio.clamp(0.0, 1.0);
        Self {
            positive_threshold: profile.positive_threshold as f64,
            negative_threshold: profile.negative_threshold as f64,
            positive_rearm: baseline + profile.positive_span() as f64 * ratio,
            negative_rearm: baseline - profile.negative_span() as f64 * ratio,
        }
    }
}

#[derive(Debug)]
pub struct LevelCrossingDetector {
    levels: GateLevels,
    positive_armed: bool,
    negative_armed: bool,
}

impl LevelCrossingDetector {
    pub fn new(levels: GateLevels) -> Self {
        Self {
            levels,
            positive_armed: true,
            negative_armed: true,
        }
    }

    /// Re-arm both polarities (e.g. after a profile switch)
    pub fn reset(&mut self) {
        self.positive_armed = true;
        self.negative_armed = true;
    }

    pub fn levels(&self) -> &GateLevels {
        &self.levels
    }

    pub fn set_levels(&mut self, levels: GateLevels) {
        self.levels = levels;
        self.reset();
    }

    pub fn is_armed(&self, polarity: Polarity) -> bool {
        match polarity {
            Polarity::Positive => self.positive_armed,
            Polarity::Negative => self.negative_armed,
        }
    }

    /// Feed one smoothed value; returns the polarity that fired, if any.
    pub fn process(&mut self, value: f64) -> Option<Polarity> {
        if value <= self.levels.positive_rearm {
            self.positive_armed = true;
        }
        if value >= self.levels.negative_rearm {
            self.negative_armed = true;
        }

        if self.positive_armed && value >= self.levels.positive_threshold {
            self.positive_armed = false;
            return Some(Polarity::Positive);
        }
        if self.negative_armed && value <= self.levels.negative_threshold {
            self.negative_armed = false;
            return Some(Polarity::Negative);
        }
        None
    }
}
