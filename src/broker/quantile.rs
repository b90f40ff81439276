//! Windowed end-to-end latency sketch.
//!
//! Keeps raw samples from the last `window` (capped at `MAX_SAMPLES`) and
//! answers percentile queries by sorting a copy. Channels record one sample
//! per finished message; a topic merges its channels' samples on demand.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use super::message::{duration_nanos, now_nanos};

const MAX_SAMPLES: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PercentileValue {
    pub quantile: f64,
    /// Nanoseconds.
    pub value: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QuantileResult {
    pub count: usize,
    pub percentiles: Vec<PercentileValue>,
}

#[derive(Debug)]
pub struct LatencySketch {
    window: i64,
    percentiles: Vec<f64>,
    // (recorded_at, latency)
    samples: Mutex<VecDeque<(i64, i64)>>,
}

impl LatencySketch {
    pub fn new(window: Duration, percentiles: Vec<f64>) -> Self {
        Self {
            window: duration_nanos(window),
            percentiles,
            samples: Mutex::new(VecDeque::new()),
        }
    }

    /// Record the latency of a message created at `msg_timestamp`.
    pub fn insert(&self, msg_timestamp: i64) {
        let now = now_nanos();
        let mut samples = self.samples.lock();
        samples.push_back((now, now.saturating_sub(msg_timestamp).max(0)));
        if samples.len() > MAX_SAMPLES {
            samples.pop_front();
        }
        Self::evict(&mut samples, now - self.window);
    }

    pub fn merge(&self, other: &LatencySketch) {
        let theirs: Vec<(i64, i64)> = other.samples.lock().iter().copied().collect();
        let mut samples = self.samples.lock();
        samples.extend(theirs);
        samples.make_contiguous().sort_unstable_by_key(|(at, _)| *at);
        while samples.len() > MAX_SAMPLES {
            samples.pop_front();
        }
    }

    pub fn result(&self) -> QuantileResult {
        let mut values: Vec<i64> = {
            let mut samples = self.samples.lock();
            Self::evict(&mut samples, now_nanos() - self.window);
            samples.iter().map(|(_, v)| *v).collect()
        };
        if values.is_empty() {
            return QuantileResult::default();
        }
        values.sort_unstable();

        let percentiles = self
            .percentiles
            .iter()
            .map(|&q| {
                let rank = ((values.len() as f64) * q).ceil() as usize;
                let idx = rank.clamp(1, values.len()) - 1;
                PercentileValue {
                    quantile: q,
                    value: values[idx],
                }
            })
            .collect();

        QuantileResult {
            count: values.len(),
            percentiles,
        }
    }

    fn evict(samples: &mut VecDeque<(i64, i64)>, cutoff: i64) {
        while samples.front().is_some_and(|(at, _)| *at < cutoff) {
            samples.pop_front();
        }
    }
}
