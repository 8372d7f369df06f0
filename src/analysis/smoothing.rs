// Smoothing - simple moving average over the last N readings

use std::collections::VecDeque;

/// Fixed-length moving average.
///
/// Until the window fills, the average covers the readings seen so far.
/// A window of 1 passes readings through unchanged.
#[derive(Debug, Clone)]
pub struct MovingAverage {
    window: VecDeque<i32>,
    capacity: usize,
    sum: i64,
}

impl MovingAverage {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            sum: 0,
        }
    }

    /// Add a reading and return the current average
    pub fn push(&mut self, value: i32) -> f64 {
        if self.window.len() == self.capacity {
            if let Some(oldest) = self.window.pop_front() {
                self.sum -= oldest as i64;
            }
        }
        self.window.push_back(value);
        self.sum += value as i64;
        self.sum as f64 / self.window.len() as f64
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.sum = 0;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.window.len() == self.capacity
    }
}
