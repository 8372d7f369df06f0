// CalibrationSession - threshold computation from collected samples
//
// Pure bookkeeping, no I/O. Stage lengths are measured in sample time:
// a stage covers [first sample, first sample + duration) and the sample
// that crosses the boundary opens the next stage.
//
// Threshold rule per polarity:
//   threshold = baseline ± min(trial peaks) × safety_margin
// Taking the weakest trial keeps one unusually strong blink from pushing
// the threshold out of reach.

use std::collections::VecDeque;

use crate::calibration::phase::CalibrationPhase;
use crate::config::CalibrationConfig;
use crate::error::{CalibrationError, ErrorCode};
use crate::link::{DeviceId, Sample};
use crate::profile::Profile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Baseline,
    Positive(u8),
    Negative(u8),
    Done,
}

/// Thresholds known so far
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProvisionalThresholds {
    pub baseline: Option<f64>,
    pub positive: Option<f64>,
    pub negative: Option<f64>,
}

pub struct CalibrationSession {
    device_id: DeviceId,
    config: CalibrationConfig,
    stage: Stage,
    stage_started_us: Option<u64>,
    recent: VecDeque<i32>,
    baseline_sum: i64,
    baseline_count: u64,
    /// Largest excursion from baseline in the running trial
    trial_peak: Option<f64>,
    positive_peaks: Vec<f64>,
    negative_peaks: Vec<f64>,
    provisional: ProvisionalThresholds,
}

impl CalibrationSession {
    pub fn new(device_id: DeviceId, config: CalibrationConfig) -> Self {
        let capacity = config.buffer_capacity.max(1);
        Self {
            device_id,
            config,
            stage: Stage::Baseline,
            stage_started_us: None,
            recent: VecDeque::with_capacity(capacity),
            baseline_sum: 0,
            baseline_count: 0,
            trial_peak: None,
            positive_peaks: Vec::new(),
            negative_peaks: Vec::new(),
            provisional: ProvisionalThresholds::default(),
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn phase(&self) -> CalibrationPhase {
        match self.stage {
            Stage::Baseline => CalibrationPhase::CollectingBaseline,
            Stage::Positive(trial) => CalibrationPhase::CollectingPositive { trial },
            Stage::Negative(trial) => CalibrationPhase::CollectingNegative { trial },
            Stage::Done => CalibrationPhase::Computing,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.stage == Stage::Done
    }

    pub fn provisional(&self) -> ProvisionalThresholds {
        self.provisional
    }

    /// Most recent raw readings, oldest first (bounded ring)
    pub fn recent_samples(&self) -> Vec<i32> {
        self.recent.iter().copied().collect()
    }

    /// Feed one sample; returns the new phase when a stage boundary passed.
    pub fn ingest(&mut self, sample: &Sample) -> Option<CalibrationPhase> {
        if self.stage == Stage::Done {
            return None;
        }
        let value = sample.channel(self.config.channel)?;

        if self.recent.len() == self.config.buffer_capacity.max(1) {
            self.recent.pop_front();
        }
        self.recent.push_back(value);

        let started = *self.stage_started_us.get_or_insert(sample.timestamp_us);
        let mut changed = None;
        if sample.timestamp_us.saturating_sub(started) >= self.stage_length_us() {
            changed = Some(self.finish_stage());
            if self.stage == Stage::Done {
                return changed;
            }
            self.stage_started_us = Some(sample.timestamp_us);
        }

        self.accumulate(value);
        changed
    }

    /// End the current stage now
    pub fn advance(&mut self) -> CalibrationPhase {
        if self.stage != Stage::Done {
            self.finish_stage();
            self.stage_started_us = None;
        }
        self.phase()
    }

    /// Build the provisional profile, validating the threshold ordering.
    pub fn compute(&self, name: &str) -> Result<Profile, CalibrationError> {
        let invalid = |reason: &str| CalibrationError::InvalidCalibration {
            reason: reason.to_string(),
        };

        let baseline = self
            .provisional
            .baseline
            .ok_or_else(|| invalid("no baseline samples collected"))?;
        let positive = self
            .provisional
            .positive
            .ok_or_else(|| invalid("positive trials incomplete"))?;
        let negative = self
            .provisional
            .negative
            .ok_or_else(|| invalid("negative trials incomplete"))?;

        let profile = Profile::new(
            name,
            positive.round() as i32,
            negative.round() as i32,
            baseline.round() as i32,
        );
        profile.validate().map_err(|err| CalibrationError::InvalidCalibration {
            reason: err.message(),
        })?;
        Ok(profile)
    }

    fn trials(&self) -> u8 {
        self.config.trials.max(1)
    }

    fn stage_length_us(&self) -> u64 {
        match self.stage {
            Stage::Baseline => self.config.baseline_duration_us(),
            _ => self.config.trial_window_us(),
        }
    }

    fn accumulate(&mut self, value: i32) {
        let baseline = self.provisional.baseline.unwrap_or(0.0);
        let excursion = match self.stage {
            Stage::Baseline => {
                self.baseline_sum += value as i64;
                self.baseline_count += 1;
                self.provisional.baseline =
                    Some(self.baseline_sum as f64 / self.baseline_count as f64);
                return;
            }
            Stage::Positive(_) => value as f64 - baseline,
            Stage::Negative(_) => baseline - value as f64,
            Stage::Done => return,
        };
        self.trial_peak = Some(self.trial_peak.map_or(excursion, |peak| peak.max(excursion)));
    }

    fn finish_stage(&mut self) -> CalibrationPhase {
        let trials = self.trials();
        let margin = self.config.safety_margin;
        let baseline = self.provisional.baseline.unwrap_or(0.0);
        let peak = self.trial_peak.take().unwrap_or(0.0);

        self.stage = match self.stage {
            Stage::Baseline => {
                log::debug!(
                    "[Calibration] Baseline {:?} from {} samples",
                    self.provisional.baseline,
                    self.baseline_count
                );
                Stage::Positive(1)
            }
            Stage::Positive(trial) => {
                self.positive_peaks.push(peak);
                if trial < trials {
                    Stage::Positive(trial + 1)
                } else {
                    self.provisional.positive =
                        Some(baseline + weakest(&self.positive_peaks) * margin);
                    Stage::Negative(1)
                }
            }
            Stage::Negative(trial) => {
                self.negative_peaks.push(peak);
                if trial < trials {
                    Stage::Negative(trial + 1)
                } else {
                    self.provisional.negative =
                        Some(baseline - weakest(&self.negative_peaks) * margin);
                    Stage::Done
                }
            }
            Stage::Done => Stage::Done,
        };
        self.phase()
    }
}

fn weakest(peaks: &[f64]) -> f64 {
    peaks.iter().copied().fold(f64::INFINITY, f64::min)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CalibrationConfig {
        CalibrationConfig {
            baseline_duration_ms: 10,
            trial_window_ms: 5,
            trials: 2,
            safety_margin: 0.7,
            buffer_capacity: 8,
            ..CalibrationConfig::default()
        }
    }

    /// Feed `count` samples of `value`, one per millisecond
    fn feed(
        session: &mut CalibrationSession,
        clock_us: &mut u64,
        value: i32,
        count: usize,
    ) -> Vec<CalibrationPhase> {
        let mut phases = Vec::new();
        for _ in 0..count {
            if let Some(phase) = session.ingest(&Sample::single(*clock_us, value)) {
                phases.push(phase);
            }
            *clock_us += 1_000;
        }
        phases
    }

    fn run_full(positive: [i32; 2], negative: [i32; 2]) -> CalibrationSession {
        let mut session = CalibrationSession::new(DeviceId::new("dev"), config());
        let mut clock = 0;
        feed(&mut session, &mut clock, 10, 10);
        for value in positive {
            feed(&mut session, &mut clock, value, 5);
        }
        for value in negative {
            feed(&mut session, &mut clock, value, 5);
        }
        feed(&mut session, &mut clock, 10, 1);
        session
    }

    #[test]
    fn test_stage_progression() {
        let mut session = CalibrationSession::new(DeviceId::new("dev"), config());
        let mut clock = 0;
        assert!(feed(&mut session, &mut clock, 10, 10).is_empty());
        assert_eq!(session.phase(), CalibrationPhase::CollectingBaseline);

        let phases = feed(&mut session, &mut clock, 50, 10);
        assert_eq!(
            phases,
            vec![
                CalibrationPhase::CollectingPositive { trial: 1 },
                CalibrationPhase::CollectingPositive { trial: 2 },
            ]
        );
        let phases = feed(&mut session, &mut clock, -50, 11);
        assert_eq!(
            phases,
            vec![
                CalibrationPhase::CollectingNegative { trial: 1 },
                CalibrationPhase::CollectingNegative { trial: 2 },
                CalibrationPhase::Computing,
            ]
        );
        assert!(session.is_complete());
    }

    #[test]
    fn test_thresholds_use_weakest_trial() {
        let session = run_full([110, 90], [-90, -70]);
        let profile = session.compute("alice").unwrap();

        // baseline 10; positive peaks 100, 80; negative peaks 100, 80
        assert_eq!(profile.baseline, 10);
        assert_eq!(profile.positive_threshold, 66);
        assert_eq!(profile.negative_threshold, -46);
        assert_eq!(profile.name, "alice");
        assert!(profile.validate().is_ok());
    }

    #[test]
    fn test_flat_signal_is_invalid() {
        let session = run_full([10, 10], [10, 10]);
        match session.compute("flat") {
            Err(CalibrationError::InvalidCalibration { .. }) => {}
            other => panic!("Expected InvalidCalibration, got {:?}", other),
        }
    }

    #[test]
    fn test_incomplete_session_is_invalid() {
        let mut session = CalibrationSession::new(DeviceId::new("dev"), config());
        let mut clock = 0;
        feed(&mut session, &mut clock, 10, 3);
        assert!(matches!(
            session.compute("partial"),
            Err(CalibrationError::InvalidCalibration { .. })
        ));
    }

    #[test]
    fn test_explicit_advance() {
        let mut session = CalibrationSession::new(DeviceId::new("dev"), config());
        let mut clock = 0;
        feed(&mut session, &mut clock, 20, 2);
        assert_eq!(session.advance(), CalibrationPhase::CollectingPositive { trial: 1 });
        assert_eq!(session.provisional().baseline, Some(20.0));

        // The next sample opens the trial window
        feed(&mut session, &mut clock, 80, 1);
        assert_eq!(session.phase(), CalibrationPhase::CollectingPositive { trial: 1 });
    }

    #[test]
    fn test_ring_buffer_is_bounded() {
        let mut session = CalibrationSession::new(DeviceId::new("dev"), config());
        let mut clock = 0;
        feed(&mut session, &mut clock, 1, 6);
        feed(&mut session, &mut clock, 2, 6);
        let recent = session.recent_samples();
        assert_eq!(recent.len(), 8);
        assert_eq!(recent[..2], [1, 1]);
        assert_eq!(recent[2..], [2, 2, 2, 2, 2, 2]);
    }

    #[test]
    fn test_other_channels_ignored() {
        let config = CalibrationConfig {
            channel: 1,
            ..config()
        };
        let mut session = CalibrationSession::new(DeviceId::new("dev"), config);
        assert_eq!(session.ingest(&Sample::single(0, 5)), None);
        assert!(session.recent_samples().is_empty());
        session.ingest(&Sample::new(0, vec![5, 7]));
        assert_eq!(session.recent_samples(), vec![7]);
    }
}
