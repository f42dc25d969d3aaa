use serde::{Deserialize, Serialize};

use super::StatsConfig;

/// One fixed-width histogram cell.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Bucket {
    pub lower_bound_ms: f64,
    pub count: u64,
}

/// A histogram cell normalized by the number of successful samples.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct DistributionPoint {
    pub t: f64,
    pub frequency: f64,
}

/// Everything recorded for a single path prefix.
///
/// Keeps a fixed-width histogram over `[0, max_time_ms)`, the request and
/// error counters, and every successful latency for exact quantiles.
///
/// Invariant: `requests == errors + successes()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathStats {
    delta_ms: f64,
    buckets: Vec<Bucket>,
    pub errors: u64,
    pub requests: u64,
    /// Raw latencies in arrival order. Grows for the lifetime of the run.
    ping: Vec<f64>,
}

impl PathStats {
    pub fn new(config: &StatsConfig) -> Self {
        let delta_ms = config.delta_ms;
        let buckets = (0..config.bucket_count())
            .map(|i| Bucket {
                lower_bound_ms: i as f64 * delta_ms,
                count: 0,
            })
            .collect();

        Self {
            delta_ms,
            buckets,
            errors: 0,
            requests: 0,
            ping: Vec::new(),
        }
    }

    /// Count a successful request that took `elapsed_ms`.
    pub fn observe(&mut self, elapsed_ms: f64) {
        let idx = self.bucket_index(elapsed_ms);
        self.buckets[idx].count += 1;
        self.requests += 1;
        self.ping.push(elapsed_ms);
    }

    /// Count a failed request. Errors carry no latency.
    pub fn observe_error(&mut self) {
        self.requests += 1;
        self.errors += 1;
    }

    /// Fold another set of observations for the same prefix into this one.
    /// Both sides must share the bucket layout.
    pub fn merge(&mut self, other: &PathStats) {
        debug_assert_eq!(self.buckets.len(), other.buckets.len());
        for (mine, theirs) in self.buckets.iter_mut().zip(&other.buckets) {
            mine.count += theirs.count;
        }
        self.errors += other.errors;
        self.requests += other.requests;
        self.ping.extend_from_slice(&other.ping);
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub fn samples(&self) -> &[f64] {
        &self.ping
    }

    pub fn successes(&self) -> u64 {
        self.requests - self.errors
    }

    /// `None` until something is recorded.
    pub fn error_rate(&self) -> Option<f64> {
        (self.requests > 0).then(|| self.errors as f64 / self.requests as f64 * 100.0)
    }

    /// `None` until a success is recorded.
    pub fn distribution(&self) -> Option<Vec<DistributionPoint>> {
        let total: u64 = self.buckets.iter().map(|b| b.count).sum();
        if total == 0 {
            return None;
        }
        Some(
            self.buckets
                .iter()
                .map(|b| DistributionPoint {
                    t: b.lower_bound_ms,
                    frequency: b.count as f64 / total as f64,
                })
                .collect(),
        )
    }

    pub fn mean_ms(&self) -> Option<f64> {
        (!self.ping.is_empty()).then(|| self.ping.iter().sum::<f64>() / self.ping.len() as f64)
    }

    /// Last bucket whose lower bound is <= `elapsed_ms`, clamped to the ends.
    fn bucket_index(&self, elapsed_ms: f64) -> usize {
        let last = self.buckets.len() - 1;
        let idx = (elapsed_ms / self.delta_ms).floor();
        if idx.is_nan() || idx < 0.0 {
            0
        } else {
            (idx as usize).min(last)
        }
    }
}

/// `p`-th percentile (0..=100) of `samples`, interpolating linearly between
/// the closest ranks. Sorts a copy; O(n log n).
pub fn quantile(samples: &[f64], p: f64) -> Option<f64> {
    if samples.is_empty() || !(0.0..=100.0).contains(&p) {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);

    let rank = (sorted.len() - 1) as f64 * p / 100.0;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let weight = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * weight)
}
