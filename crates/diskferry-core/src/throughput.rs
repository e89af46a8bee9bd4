//! Sliding-window throughput estimation.
//!
//! The bulk copier prints its cumulative byte counter roughly every five
//! seconds when nudged. A [`ThroughputWindow`] keeps the last
//! [`WINDOW_SAMPLES`] such samples, covering a one-minute horizon, and
//! derives the instantaneous rate from the window ends:
//! `(last.bytes - first.bytes) / (last.time - first.time)`.

use std::collections::VecDeque;
use std::time::Instant;

/// Samples retained: a 60-second horizon sampled every 5 seconds.
pub const WINDOW_SAMPLES: usize = 12;

#[derive(Clone, Copy, Debug)]
struct Sample {
    at: Instant,
    bytes: u64,
}

/// Bounded window of `(time, cumulative bytes)` samples.
#[derive(Clone, Debug, Default)]
pub struct ThroughputWindow {
    samples: VecDeque<Sample>,
}

impl ThroughputWindow {
    /// Creates an empty window.
    #[must_use]
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(WINDOW_SAMPLES),
        }
    }

    /// Records a cumulative byte count observed at `at`, dropping samples
    /// that fall out of the window.
    pub fn record(&mut self, at: Instant, bytes: u64) {
        self.samples.push_back(Sample { at, bytes });
        while self.samples.len() > WINDOW_SAMPLES {
            self.samples.pop_front();
        }
    }

    /// The most recent cumulative byte count, if any.
    #[must_use]
    pub fn last_bytes(&self) -> Option<u64> {
        self.samples.back().map(|sample| sample.bytes)
    }

    /// Number of retained samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the window is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Windowed transfer rate in bytes per second.
    ///
    /// Returns `None` before two samples exist or when the window spans no
    /// measurable time.
    #[must_use]
    pub fn rate(&self) -> Option<f64> {
        let first = self.samples.front()?;
        let last = self.samples.back()?;
        if self.samples.len() < 2 {
            return None;
        }
        let elapsed = last.at.saturating_duration_since(first.at).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        let delta = last.bytes.saturating_sub(first.bytes) as f64;
        Some(delta / elapsed)
    }

    /// Estimated seconds until `expected_bytes` have been transferred.
    ///
    /// Clamped to zero once the expected size has been reached. Returns
    /// `None` while no positive rate is available.
    #[must_use]
    pub fn eta(&self, expected_bytes: u64) -> Option<u64> {
        let rate = self.rate()?;
        if rate <= 0.0 {
            return None;
        }
        let transferred = self.last_bytes()?;
        let remaining = expected_bytes.saturating_sub(transferred) as f64;
        Some((remaining / rate).round() as u64)
    }
}
