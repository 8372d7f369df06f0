//! Diagnostics telemetry collector and helpers.
//!
//! The collector multiplexes queue occupancy, sample drops, reconnect
//! attempts, and link lifecycle events into a bounded history plus an
//! async broadcast stream.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::OnceCell;
use tokio::sync::broadcast;

use crate::config::TelemetryConfig;
use crate::link::LinkState;

pub mod events;

pub use events::{DiagnosticError, MetricEvent};

/// Global telemetry hub shared across the crate.
static HUB: OnceCell<TelemetryHub> = OnceCell::new();

/// Access the global telemetry hub, creating it with default sizing on
/// first use.
pub fn hub() -> &'static TelemetryHub {
    HUB.get_or_init(TelemetryHub::default)
}

/// Size the global hub from configuration.
///
/// Returns false when the hub already exists; the first sizing wins.
pub fn init(config: &TelemetryConfig) -> bool {
    HUB.set(TelemetryHub::new(
        config.channel_capacity,
        config.history_capacity,
    ))
    .is_ok()
}

/// Snapshot of collector state for CLI reporting.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TelemetrySnapshot {
    pub recent: Vec<MetricEvent>,
    pub total_events: u64,
    pub dropped_events: u64,
}

/// Broadcast-based collector retaining a bounded history of metrics.
pub struct TelemetryCollector {
    tx: broadcast::Sender<MetricEvent>,
    history: Mutex<VecDeque<MetricEvent>>,
    history_capacity: usize,
    total_events: AtomicU64,
    dropped_history: AtomicU64,
}

impl TelemetryCollector {
    pub fn new(buffer: usize, history_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self {
            tx,
            history: Mutex::new(VecDeque::with_capacity(history_capacity)),
            history_capacity,
            total_events: AtomicU64::new(0),
            dropped_history: AtomicU64::new(0),
        }
    }

    pub fn publish(&self, event: MetricEvent) {
        self.total_events.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut history) = self.history.lock() {
            if history.len() == self.history_capacity {
                history.pop_front();
                self.dropped_history.fetch_add(1, Ordering::Relaxed);
            }
            if self.history_capacity > 0 {
                history.push_back(event.clone());
            }
        }

        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MetricEvent> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let recent = self
            .history
            .lock()
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default();
        TelemetrySnapshot {
            recent,
            total_events: self.total_events.load(Ordering::Relaxed),
            dropped_events: self.dropped_history.load(Ordering::Relaxed),
        }
    }
}

impl Default for TelemetryCollector {
    fn default() -> Self {
        Self::new(256, 64)
    }
}

/// Top-level hub wrapping collector state plus the occupancy gauge.
pub struct TelemetryHub {
    collector: TelemetryCollector,
    occupancy_gauge: Mutex<Option<f32>>,
}

impl TelemetryHub {
    pub fn new(channel_capacity: usize, history_capacity: usize) -> Self {
        Self {
            collector: TelemetryCollector::new(channel_capacity, history_capacity),
            occupancy_gauge: Mutex::new(None),
        }
    }

    /// Live metric stream; slow receivers skip ahead rather than block
    /// the recording side.
    pub fn subscribe(&self) -> broadcast::Receiver<MetricEvent> {
        self.collector.subscribe()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.collector.snapshot()
    }

    /// Publish queue fill level; changes under 2.5 points are debounced.
    pub fn record_queue_occupancy(&self, percent: f32) {
        let normalized = percent.clamp(0.0, 100.0);
        let should_emit = match self.occupancy_gauge.lock() {
            Ok(mut gauge) => {
                let changed = gauge
                    .map(|last| (last - normalized).abs() >= 2.5)
                    .unwrap_or(true);
                if changed {
                    *gauge = Some(normalized);
                }
                changed
            }
            Err(_) => false,
        };

        if should_emit {
            self.collector.publish(MetricEvent::QueueOccupancy {
                percent: normalized,
            });
        }
    }

    pub fn record_samples_dropped(&self, total: u64) {
        self.collector.publish(MetricEvent::SamplesDropped { total });
    }

    pub fn record_reconnect_attempt(&self, attempt: u32, delay_ms: u64) {
        self.collector
            .publish(MetricEvent::ReconnectAttempt { attempt, delay_ms });
    }

    pub fn record_link_state(&self, state: LinkState) {
        self.collector.publish(MetricEvent::LinkStateChanged {
            state,
            timestamp_ms: now_timestamp_ms(),
        });
    }

    pub fn record_error(&self, code: DiagnosticError, context: impl Into<String>) {
        self.collector.publish(MetricEvent::Error {
            code,
            context: context.into(),
        });
    }
}

impl Default for TelemetryHub {
    fn default() -> Self {
        Self::new(256, 64)
    }
}

pub(crate) fn now_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::DisconnectReason;

    #[test]
    fn collector_preserves_order_within_history() {
        let collector = TelemetryCollector::new(8, 3);
        collector.publish(MetricEvent::SamplesDropped { total: 1 });
        collector.publish(MetricEvent::ReconnectAttempt {
            attempt: 1,
            delay_ms: 500,
        });
        collector.publish(MetricEvent::QueueOccupancy { percent: 50.0 });

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.recent.len(), 3);
        assert!(matches!(
            snapshot.recent[0],
            MetricEvent::SamplesDropped { total: 1 }
        ));
        assert!(matches!(
            snapshot.recent[2],
            MetricEvent::QueueOccupancy { .. }
        ));
    }

    #[test]
    fn collector_drops_history_when_full() {
        let collector = TelemetryCollector::new(8, 2);
        for total in 1..=3 {
            collector.publish(MetricEvent::SamplesDropped { total });
        }

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.recent.len(), 2);
        assert_eq!(snapshot.dropped_events, 1);
        assert!(matches!(
            snapshot.recent[0],
            MetricEvent::SamplesDropped { total: 2 }
        ));
    }

    #[test]
    fn hub_records_link_state_and_errors() {
        let hub = TelemetryHub::new(8, 8);
        hub.record_link_state(LinkState::Disconnected(DisconnectReason::LinkLost));
        hub.record_error(DiagnosticError::MalformedFrame, "frame 0x42");

        let snapshot = hub.snapshot();
        assert_eq!(snapshot.total_events, 2);
        assert!(snapshot.recent.iter().any(|event| matches!(
            event,
            MetricEvent::LinkStateChanged {
                state: LinkState::Disconnected(DisconnectReason::LinkLost),
                ..
            }
        )));
    }

    #[tokio::test]
    async fn hub_streams_live_metrics() {
        let hub = TelemetryHub::new(8, 0);
        let mut rx = hub.subscribe();
        hub.record_reconnect_attempt(2, 1_000);

        assert!(matches!(
            rx.recv().await,
            Ok(MetricEvent::ReconnectAttempt {
                attempt: 2,
                delay_ms: 1_000
            })
        ));
        assert!(hub.snapshot().recent.is_empty());
    }

    #[test]
    fn occupancy_gauge_debounces_small_changes() {
        let hub = TelemetryHub::new(8, 8);
        hub.record_queue_occupancy(10.0);
        hub.record_queue_occupancy(10.5);
        hub.record_queue_occupancy(25.0);

        let count = hub
            .snapshot()
            .recent
            .iter()
            .filter(|event| matches!(event, MetricEvent::QueueOccupancy { .. }))
            .count();
        assert_eq!(count, 2);
    }
}
