// Sample queue between the link pump and its single consumer
//
// The producer never blocks: once the queue holds `high_water_mark`
// samples, each push evicts the oldest one.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use crossbeam::queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::error::LinkError;
use crate::link::types::Sample;
use crate::telemetry;

/// Counters describing queue health
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total_pushed: u64,
    pub total_popped: u64,
    pub total_dropped: u64,
    pub current_size: usize,
    pub peak_size: usize,
    pub capacity: usize,
}

/// Bounded drop-oldest queue with async receive
pub struct SampleQueue {
    buffer: ArrayQueue<Sample>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    close_reason: Mutex<Option<LinkError>>,

    total_pushed: AtomicU64,
    total_popped: AtomicU64,
    total_dropped: AtomicU64,
    peak_size: AtomicUsize,
}

impl SampleQueue {
    pub fn new(high_water_mark: usize) -> Self {
        let capacity = high_water_mark.max(1);
        Self {
            buffer: ArrayQueue::new(capacity),
            capacity,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            total_pushed: AtomicU64::new(0),
            total_popped: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
            peak_size: AtomicUsize::new(0),
        }
    }

    /// Enqueue a sample, evicting the oldest entries while full.
    ///
    /// Samples pushed after `close` are discarded.
    pub fn push(&self, sample: Sample) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let mut pending = sample;
        while let Err(rejected) = self.buffer.push(pending) {
            if self.buffer.pop().is_some() {
                let dropped = self.total_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 100 == 0 {
                    log::warn!(
                        "[SampleQueue] Consumer behind; {} samples dropped so far",
                        dropped
                    );
                    telemetry::hub().record_samples_dropped(dropped);
                }
            }
            pending = rejected;
        }

        self.total_pushed.fetch_add(1, Ordering::Relaxed);
        let size = self.buffer.len();
        self.peak_size.fetch_max(size, Ordering::Relaxed);
        telemetry::hub().record_queue_occupancy(size as f32 * 100.0 / self.capacity as f32);

        self.notify.notify_one();
    }

    /// Wait for the next sample. Returns None once the queue is closed
    /// and drained.
    pub async fn recv(&self) -> Option<Sample> {
        loop {
            if let Some(sample) = self.pop() {
                return Some(sample);
            }
            if self.closed.load(Ordering::Acquire) {
                return self.pop();
            }
            self.notify.notified().await;
        }
    }

    pub fn try_recv(&self) -> Option<Sample> {
        self.pop()
    }

    /// Stop accepting samples and wake the consumer. The first close
    /// reason wins.
    pub fn close(&self, reason: Option<LinkError>) {
        if let Ok(mut guard) = self.close_reason.lock() {
            if guard.is_none() && !self.closed.load(Ordering::Acquire) {
                *guard = reason;
            }
        }
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Why the producer stopped, if it stopped abnormally
    pub fn close_reason(&self) -> Option<LinkError> {
        self.close_reason
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            total_pushed: self.total_pushed.load(Ordering::Relaxed),
            total_popped: self.total_popped.load(Ordering::Relaxed),
            total_dropped: self.total_dropped.load(Ordering::Relaxed),
            current_size: self.buffer.len(),
            peak_size: self.peak_size.load(Ordering::Relaxed),
            capacity: self.capacity,
        }
    }

    fn pop(&self) -> Option<Sample> {
        self.buffer.pop().inspect(|_| {
            self.total_popped.fetch_add(1, Ordering::Relaxed);
        })
    }
}
