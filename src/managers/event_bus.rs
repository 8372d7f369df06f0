// EventBus: publish/subscribe channel for core notifications
// Single Responsibility: fan-out of read-only events to UI collaborators

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::analysis::BlinkEvent;
use crate::calibration::CalibrationPhase;
use crate::link::{DeviceId, LinkState};

/// Notifications emitted by the core.
///
/// Events are fire-and-forget: a subscriber that falls more than the
/// channel capacity behind observes a lag and skips ahead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum CoreEvent {
    DeviceStateChanged {
        state: LinkState,
        device_id: Option<DeviceId>,
    },
    CalibrationStateChanged(CalibrationPhase),
    BlinkDetected(BlinkEvent),
    /// Sorted profile names after a store mutation
    ProfileListChanged(Vec<String>),
    /// No blink within the configured interval of sample time
    BlinkOverdue {
        since_last_us: u64,
    },
    BatteryLevel(u8),
}

/// Broadcast hub shared by the link, store, controller and classifier.
///
/// Cloning yields another handle onto the same channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to all current subscribers; events with no subscriber are
    /// discarded.
    pub fn publish(&self, event: CoreEvent) {
        log::trace!("[EventBus] {:?}", event);
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    /// Subscribe through an unbounded relay so slow consumers never lag.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe_unbounded(&self) -> mpsc::UnboundedReceiver<CoreEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut broadcast_rx = self.tx.subscribe();

        tokio::spawn(async move {
            loop {
                match broadcast_rx.recv().await {
                    Ok(event) => {
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("[EventBus] Relay lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
