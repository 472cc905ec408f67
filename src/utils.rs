use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

/// Sliding mean over the most recent `window` sample-rate estimates.
///
/// Driver callbacks feed one estimate per buffer; the watchdog compares
/// the mean against the configured rate. Priming the full window with
/// the expected rate on arm keeps the watchdog quiet until enough real
/// callbacks have arrived to say otherwise.
#[derive(Debug)]
pub struct MovingAverage {
    window: usize,
    values: VecDeque<f32>,
    sum: f64,
}

impl MovingAverage {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            values: VecDeque::with_capacity(window),
            sum: 0.0,
        }
    }

    /// Record one estimate, evicting the oldest once the window is full.
    pub fn add(&mut self, value: f32) {
        self.values.push_back(value);
        self.sum += f64::from(value);
        while self.values.len() > self.window {
            if let Some(evicted) = self.values.pop_front() {
                self.sum -= f64::from(evicted);
            }
        }
    }

    /// Mean of the current window, or 0.0 when nothing was recorded yet.
    pub fn average(&self) -> f32 {
        if self.values.is_empty() {
            0.0
        } else {
            (self.sum / self.values.len() as f64) as f32
        }
    }

    /// Fill the whole window with `value`, discarding previous history.
    pub fn prime(&mut self, value: f32) {
        self.values.clear();
        self.values.resize(self.window, value);
        self.sum = f64::from(value) * self.window as f64;
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Nanoseconds since the UNIX epoch.
pub fn timestamp_utc_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
