use crate::{Sample, Timestamp};
use chrono::{Duration, Timelike};

/// Dual-density retention: every sample for the recent past,
/// one sample per minute up to the horizon, nothing older.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Retention {
    pub full_resolution: Duration,
    pub horizon: Duration,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            full_resolution: Duration::hours(1),
            horizon: Duration::days(8),
        }
    }
}

impl Retention {
    pub fn keeps(&self, ts: Timestamp, now: Timestamp) -> bool {
        let age = now - ts;
        age < self.full_resolution || (age < self.horizon && ts.second() == 0)
    }
}

/// In-memory sliding window, strictly in insertion (= time) order.
#[derive(Debug)]
pub struct Window {
    samples: Vec<Sample>,
    retention: Retention,
}

impl Window {
    pub fn new(retention: Retention) -> Self {
        Self {
            samples: Vec::new(),
            retention,
        }
    }

    /// Builds the window from persisted samples, which may come in any day order.
    pub fn from_samples(mut samples: Vec<Sample>, retention: Retention, now: Timestamp) -> Self {
        samples.sort_by_key(|s| s.timestamp);
        samples.retain(|s| retention.keeps(s.timestamp, now));
        Self { samples, retention }
    }

    /// Appends a sample and trims everything the retention policy no longer
    /// keeps, measured from the new sample. Returns how many were dropped.
    pub fn insert(&mut self, sample: Sample) -> usize {
        let now = sample.timestamp;
        self.samples.push(sample);
        let before = self.samples.len();
        let retention = self.retention;
        self.samples.retain(|s| retention.keeps(s.timestamp, now));
        before - self.samples.len()
    }

    pub fn query(&self, now: Timestamp, period: Duration, include_all: bool) -> Vec<Sample> {
        self.samples
            .iter()
            .filter(|s| now - s.timestamp < period && (include_all || s.on_the_minute()))
            .copied()
            .collect()
    }

    pub fn latest(&self) -> Option<&Sample> {
        self.samples.last()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Consumers treat a gap longer than this between two points as a break.
pub const SERIES_GAP_SECS: i64 = 120;

/// Splits an ordered query result into continuous runs.
pub fn split_series(samples: &[Sample], gap: Duration) -> Vec<&[Sample]> {
    samples
        .chunk_by(|a, b| b.timestamp - a.timestamp <= gap)
        .collect()
}
