// Classifier - threshold-based blink detection on the live sample stream
//
// Each sample is smoothed with a short moving average, passed through the
// hysteresis gate, and scored by how far it overshoots the threshold:
//
//   confidence = min(1, (smoothed - threshold) / margin)
//
// where margin defaults to half the threshold-to-baseline span of the
// active profile. The classifier holds no history beyond the smoothing
// window; a new subscription starts from a clean state.

use futures::{Stream, StreamExt};

use crate::analysis::level_crossing::{GateLevels, LevelCrossingDetector, Polarity};
use crate::analysis::smoothing::MovingAverage;
use crate::config::ClassifierConfig;
use crate::link::Sample;
use crate::profile::Profile;

/// A detected blink.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BlinkEvent {
    /// Sample timestamp in microseconds since link start
    pub timestamp_us: u64,
    pub polarity: Polarity,
    /// Overshoot score in [0.0, 1.0]
    pub confidence: f64,
}

/// Streaming blink classifier bound to one profile.
pub struct BlinkClassifier {
    profile: Profile,
    smoothing: MovingAverage,
    gate: LevelCrossingDetector,
    dead_zone_ratio: f64,
    confidence_margin: Option<f64>,
    channel: usize,
}

impl BlinkClassifier {
    /// Create a classifier for `profile`
    ///
    /// # Arguments
    /// * `profile` - Thresholds to classify against (copied, not shared)
    /// * `config` - Smoothing window, dead zone, confidence margin, channel
    pub fn new(profile: Profile, config: &ClassifierConfig) -> Self {
        let gate = LevelCrossingDetector::new(GateLevels::from_profile(
            &profile,
            config.dead_zone_ratio,
        ));
        Self {
            profile,
            smoothing: MovingAverage::new(config.smoothing_window),
            gate,
            dead_zone_ratio: config.dead_zone_ratio,
            confidence_margin: config.confidence_margin,
            channel: config.channel,
        }
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Swap thresholds; smoothing history and gate state are cleared.
    pub fn set_profile(&mut self, profile: Profile) {
        self.gate
            .set_levels(GateLevels::from_profile(&profile, self.dead_zone_ratio));
        self.profile = profile;
        self.smoothing.reset();
    }

    pub fn reset(&mut self) {
        self.smoothing.reset();
        self.gate.reset();
    }

    /// Classify one sample.
    ///
    /// Samples that do not carry the configured channel are ignored.
    pub fn process(&mut self, sample: &Sample) -> Option<BlinkEvent> {
        let Some(value) = sample.channel(self.channel) else {
            tracing::trace!(
                channel = self.channel,
                timestamp_us = sample.timestamp_us,
                "sample missing classifier channel"
            );
            return None;
        };

        let smoothed = self.smoothing.push(value);
        let polarity = self.gate.process(smoothed)?;
        Some(BlinkEvent {
            timestamp_us: sample.timestamp_us,
            polarity,
            confidence: self.confidence(smoothed, polarity),
        })
    }

    /// Overshoot score, clamped to [0.0, 1.0]
    pub fn confidence(&self, smoothed: f64, polarity: Polarity) -> f64 {
        let (overshoot, span) = match polarity {
            Polarity::Positive => (
                smoothed - self.profile.positive_threshold as f64,
                self.profile.positive_span() as f64,
            ),
            Polarity::Negative => (
                self.profile.negative_threshold as f64 - smoothed,
                self.profile.negative_span() as f64,
            ),
        };
        let margin = self.confidence_margin.unwrap_or(span / 2.0);
        if margin <= 0.0 {
            return 1.0;
        }
        (overshoot / margin).clamp(0.0, 1.0)
    }
}

/// Lazy, unbounded blink sequence over a sample stream.
///
/// Ends when `samples` ends (unsubscribe, disconnect, link lost).
pub fn blink_events<S>(samples: S, mut classifier: BlinkClassifier) -> impl Stream<Item = BlinkEvent>
where
    S: Stream<Item = Sample>,
{
    samples.filter_map(move |sample| futures::future::ready(classifier.process(&sample)))
}

#[cfg(test)]
#[path = "classifier_tests.rs"]
mod tests;
