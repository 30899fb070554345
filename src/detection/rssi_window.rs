//! Per-device RSSI smoothing
//!
//! Keeps a trailing window of raw samples per device and reports their
//! arithmetic mean. A single faded sample moves the mean by at most a
//! fifth of its drop, without the lag of a longer window.

use std::collections::{HashMap, VecDeque};

pub const DEFAULT_WINDOW_SIZE: usize = 5;

/// Bounded sample queue for one device
#[derive(Debug, Clone)]
struct SampleWindow {
    samples: VecDeque<i16>,
}

impl SampleWindow {
    fn new(capacity: usize) -> Self {
        SampleWindow {
            samples: VecDeque::with_capacity(capacity),
        }
    }

    /// Add a sample, dropping the oldest ones beyond `capacity`
    fn push(&mut self, rssi: i16, capacity: usize) {
        while self.samples.len() >= capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(rssi);
    }

    fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: i64 = self.samples.iter().map(|&s| i64::from(s)).sum();
        Some(sum as f64 / self.samples.len() as f64)
    }
}

/// Smoothing windows for every device seen during one scan
#[derive(Debug)]
pub struct RssiWindows {
    windows: HashMap<String, SampleWindow>,
    capacity: usize,
}

impl RssiWindows {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_WINDOW_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        RssiWindows {
            windows: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record a raw sample and return the device's smoothed value
    pub fn push(&mut self, device_id: &str, rssi: i16) -> f64 {
        let capacity = self.capacity;
        let window = self
            .windows
            .entry(device_id.to_string())
            .or_insert_with(|| SampleWindow::new(capacity));
        window.push(rssi, capacity);
        window.mean().unwrap_or(f64::from(rssi))
    }

    pub fn smoothed(&self, device_id: &str) -> Option<f64> {
        self.windows.get(device_id).and_then(|w| w.mean())
    }

    pub fn sample_count(&self, device_id: &str) -> usize {
        self.windows
            .get(device_id)
            .map(|w| w.samples.len())
            .unwrap_or(0)
    }

    pub fn device_count(&self) -> usize {
        self.windows.len()
    }

    pub fn clear(&mut self) {
        self.windows.clear();
    }
}

impl Default for RssiWindows {
    fn default() -> Self {
        Self::new()
    }
}
