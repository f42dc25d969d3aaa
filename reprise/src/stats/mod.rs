//! Statistics aggregated per URL path prefix.
//!
//! Every observation for `http://host/a/b` is recorded under `host`,
//! `host/a` and `host/a/b`, so a whole path family can be queried as easily
//! as a single endpoint. Entries are created on first use and live as long as
//! the [`StatsTree`].
//!
//! The tree is shared by every in-flight replay. Each [`PathStats`] entry is
//! guarded by its own shard lock inside a [`DashMap`]; the concurrency tracker
//! keeps the live id set behind a mutex and the counters in atomics.

mod path;

pub use path::{Bucket, DistributionPoint, PathStats, quantile};

use std::{
    collections::HashSet,
    fmt,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use typed_builder::TypedBuilder;

/// Errors raised when querying a prefix that cannot answer the question.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StatsError {
    #[error("no statistics recorded for path {0:?}")]
    UnknownPath(String),
    #[error("path {0:?} has no samples for this query")]
    NoData(String),
    #[error("percentile must be within 0..=100, got {0}")]
    InvalidPercentile(f64),
}

/// Upper bound on histogram buckets per path prefix.
pub const MAX_BUCKETS: usize = 100_000;

/// Histogram layout shared by every [`PathStats`] of a tree.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(default, rename_all = "camelCase")]
pub struct StatsConfig {
    /// Bucket width in milliseconds.
    #[builder(default = 50.0)]
    pub delta_ms: f64,
    /// Upper end of the histogram. Slower samples land in the last bucket.
    #[builder(default = 5_000.0)]
    pub max_time_ms: f64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl StatsConfig {
    /// `ceil(max_time / delta)`, clamped to `1..=MAX_BUCKETS`.
    pub fn bucket_count(&self) -> usize {
        let valid = self.delta_ms.is_finite()
            && self.delta_ms > 0.0
            && self.max_time_ms.is_finite()
            && self.max_time_ms > 0.0;
        if !valid {
            return 1;
        }
        ((self.max_time_ms / self.delta_ms).ceil() as usize).clamp(1, MAX_BUCKETS)
    }
}

/// Handle returned by [`StatsTree::start_request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(u64);

impl RequestId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Path prefixes a URL is recorded under.
///
/// The scheme is stripped, then every prefix ending right before a `/` is
/// taken, followed by the whole remainder:
/// `http://host/a/b` gives `host`, `host/a`, `host/a/b`.
pub fn path_prefixes(url: &str) -> Vec<String> {
    let rest = url.find("://").map_or(url, |i| &url[i + 3..]);
    rest.match_indices('/')
        .map(|(i, _)| i)
        .filter(|&i| i > 0)
        .map(|i| rest[..i].to_string())
        .chain(std::iter::once(rest.to_string()))
        .collect()
}

/// Per-prefix statistics plus the concurrent request tracker.
#[derive(Debug)]
pub struct StatsTree {
    config: StatsConfig,
    paths: DashMap<String, PathStats>,
    live: Mutex<HashSet<u64>>,
    next_request_id: AtomicU64,
    max_concurrent_requests: AtomicUsize,
}

impl Default for StatsTree {
    fn default() -> Self {
        Self::new(StatsConfig::default())
    }
}

impl StatsTree {
    pub fn new(config: StatsConfig) -> Self {
        Self {
            config,
            paths: DashMap::new(),
            live: Mutex::new(HashSet::new()),
            next_request_id: AtomicU64::new(0),
            max_concurrent_requests: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &StatsConfig {
        &self.config
    }

    /// Record a successful request to `url` that took `elapsed_ms`.
    pub fn record_success(&self, url: &str, elapsed_ms: f64) {
        self.record_success_at(&path_prefixes(url), elapsed_ms);
    }

    /// Record a failed request to `url`.
    pub fn record_error(&self, url: &str) {
        self.record_error_at(&path_prefixes(url));
    }

    /// Same as [`record_success`](Self::record_success) with the prefixes
    /// already computed.
    pub fn record_success_at(&self, prefixes: &[String], elapsed_ms: f64) {
        let elapsed_ms = elapsed_ms.max(0.0);
        for prefix in prefixes {
            self.entry(prefix).observe(elapsed_ms);
        }
    }

    pub fn record_error_at(&self, prefixes: &[String]) {
        for prefix in prefixes {
            self.entry(prefix).observe_error();
        }
    }

    /// Histogram of `prefix` normalized to frequencies summing to one.
    pub fn distribution(&self, prefix: &str) -> Result<Vec<DistributionPoint>, StatsError> {
        self.with_path(prefix, PathStats::distribution)?
            .ok_or_else(|| StatsError::NoData(prefix.to_string()))
    }

    /// `p`-th percentile (0..=100) of the latencies recorded for `prefix`.
    pub fn quantile(&self, prefix: &str, p: f64) -> Result<f64, StatsError> {
        if !(0.0..=100.0).contains(&p) {
            return Err(StatsError::InvalidPercentile(p));
        }
        // Copy the samples out so sorting happens without holding the shard lock.
        let samples = self.with_path(prefix, |stats| stats.samples().to_vec())?;
        quantile(&samples, p).ok_or_else(|| StatsError::NoData(prefix.to_string()))
    }

    /// Percentage of requests to `prefix` that failed.
    pub fn error_rate(&self, prefix: &str) -> Result<f64, StatsError> {
        self.with_path(prefix, PathStats::error_rate)?
            .ok_or_else(|| StatsError::NoData(prefix.to_string()))
    }

    /// Snapshot of one prefix.
    pub fn path_stats(&self, prefix: &str) -> Option<PathStats> {
        self.paths.get(prefix).map(|stats| stats.value().clone())
    }

    /// Every prefix seen so far, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.paths.iter().map(|e| e.key().clone()).collect();
        paths.sort();
        paths
    }

    /// Mark a new request as in flight and update the high-water mark.
    pub fn start_request(&self) -> RequestId {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let mut live = self.live.lock();
        live.insert(id);
        self.max_concurrent_requests
            .fetch_max(live.len(), Ordering::Relaxed);
        RequestId(id)
    }

    /// Mark a request as done. Unknown or already finished ids are ignored.
    pub fn finish_request(&self, id: RequestId) {
        self.live.lock().remove(&id.0);
    }

    pub fn concurrent_requests(&self) -> usize {
        self.live.lock().len()
    }

    pub fn max_concurrent_requests(&self) -> usize {
        self.max_concurrent_requests.load(Ordering::Relaxed)
    }

    /// Total number of ids handed out by [`start_request`](Self::start_request).
    pub fn started_requests(&self) -> u64 {
        self.next_request_id.load(Ordering::Relaxed)
    }

    fn entry(&self, prefix: &str) -> dashmap::mapref::one::RefMut<'_, String, PathStats> {
        if let Some(stats) = self.paths.get_mut(prefix) {
            return stats;
        }
        self.paths
            .entry(prefix.to_string())
            .or_insert_with(|| PathStats::new(&self.config))
    }

    fn with_path<T>(&self, prefix: &str, f: impl FnOnce(&PathStats) -> T) -> Result<T, StatsError> {
        self.paths
            .get(prefix)
            .map(|stats| f(&stats))
            .ok_or_else(|| StatsError::UnknownPath(prefix.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn prefixes_follow_path_segments() {
        assert_eq!(
            path_prefixes("http://host/a/b/c"),
            vec!["host", "host/a", "host/a/b", "host/a/b/c"]
        );
        assert_eq!(path_prefixes("https://host:8443"), vec!["host:8443"]);
        assert_eq!(path_prefixes("http://x/"), vec!["x", "x/"]);
        assert_eq!(path_prefixes("x/a?q=1"), vec!["x", "x/a?q=1"]);
    }

    #[test]
    fn every_prefix_is_updated() {
        let tree = StatsTree::default();
        tree.record_success("http://host/a/b", 12.0);
        tree.record_error("http://host/a/c");

        assert_eq!(tree.paths(), vec!["host", "host/a", "host/a/b", "host/a/c"]);
        let family = tree.path_stats("host/a").unwrap();
        assert_eq!((family.requests, family.errors), (2, 1));
        let leaf = tree.path_stats("host/a/b").unwrap();
        assert_eq!((leaf.requests, leaf.errors), (1, 0));
    }

    #[test]
    fn quantile_of_three_samples() {
        let tree = StatsTree::default();
        for t in [30.0, 10.0, 20.0] {
            tree.record_success("http://h/p", t);
        }
        assert_eq!(tree.quantile("h/p", 50.0), Ok(20.0));
        assert_eq!(tree.quantile("h", 50.0), Ok(20.0));
    }

    #[test]
    fn error_rate_after_three_successes_and_one_error() {
        let tree = StatsTree::default();
        for t in [1.0, 2.0, 3.0] {
            tree.record_success("http://h/p", t);
        }
        tree.record_error("http://h/p");
        assert_eq!(tree.error_rate("h/p"), Ok(25.0));
    }

    #[test]
    fn queries_without_data_fail_explicitly() {
        let tree = StatsTree::default();
        assert_eq!(
            tree.distribution("nowhere"),
            Err(StatsError::UnknownPath("nowhere".into()))
        );
        assert_eq!(
            tree.error_rate("nowhere"),
            Err(StatsError::UnknownPath("nowhere".into()))
        );

        tree.record_error("http://h/only-errors");
        assert_eq!(
            tree.distribution("h/only-errors"),
            Err(StatsError::NoData("h/only-errors".into()))
        );
        assert_eq!(
            tree.quantile("h/only-errors", 90.0),
            Err(StatsError::NoData("h/only-errors".into()))
        );
        assert_eq!(
            tree.quantile("h/only-errors", 101.0),
            Err(StatsError::InvalidPercentile(101.0))
        );
    }

    #[test]
    fn distribution_spans_configured_range() {
        let tree = StatsTree::new(StatsConfig::builder().delta_ms(100.0).max_time_ms(300.0).build());
        tree.record_success("http://h", 50.0);
        tree.record_success("http://h", 150.0);
        tree.record_success("http://h", 900.0);
        tree.record_success("http://h", 250.0);

        let dist = tree.distribution("h").unwrap();
        let points: Vec<(f64, f64)> = dist.iter().map(|p| (p.t, p.frequency)).collect();
        assert_eq!(points, vec![(0.0, 0.25), (100.0, 0.25), (200.0, 0.5)]);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let tree = Arc::new(StatsTree::default());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let tree = Arc::clone(&tree);
                thread::spawn(move || {
                    for i in 0..500 {
                        if (worker + i) % 4 == 0 {
                            tree.record_error("http://h/api/v1");
                        } else {
                            tree.record_success("http://h/api/v1", i as f64);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = tree.path_stats("h/api").unwrap();
        assert_eq!(stats.requests, 4000);
        assert_eq!(stats.errors, 1000);
        assert_eq!(stats.samples().len(), 3000);
        let dist: f64 = tree.distribution("h/api/v1").unwrap().iter().map(|p| p.frequency).sum();
        assert!((dist - 1.0).abs() < 1e-9);
    }

    #[test]
    fn high_water_mark_never_drops() {
        let tree = StatsTree::default();
        let ids: Vec<RequestId> = (0..5).map(|_| tree.start_request()).collect();
        assert_eq!(tree.max_concurrent_requests(), 5);
        assert_eq!(tree.concurrent_requests(), 5);

        for id in &ids[..3] {
            tree.finish_request(*id);
        }
        assert_eq!(tree.concurrent_requests(), 2);
        assert_eq!(tree.max_concurrent_requests(), 5);

        tree.start_request();
        assert_eq!(tree.max_concurrent_requests(), 5);
    }

    #[test]
    fn request_ids_increase_and_finish_is_idempotent() {
        let tree = StatsTree::default();
        let a = tree.start_request();
        let b = tree.start_request();
        assert!(b > a);

        tree.finish_request(a);
        tree.finish_request(a);
        tree.finish_request(RequestId(999));
        assert_eq!(tree.concurrent_requests(), 1);
        assert_eq!(tree.started_requests(), 2);
    }

    #[test]
    fn bucket_count_is_guarded() {
        let cfg = |delta_ms, max_time_ms| StatsConfig { delta_ms, max_time_ms };
        assert_eq!(cfg(10.0, 100.0).bucket_count(), 10);
        assert_eq!(cfg(30.0, 100.0).bucket_count(), 4);
        assert_eq!(cfg(0.0, 100.0).bucket_count(), 1);
        assert_eq!(cfg(-1.0, 100.0).bucket_count(), 1);
        assert_eq!(cfg(10.0, f64::INFINITY).bucket_count(), 1);
        assert_eq!(cfg(1e-9, 5_000.0).bucket_count(), MAX_BUCKETS);
    }

    #[test]
    fn tiny_bucket_width_stays_bounded() {
        let tree = StatsTree::new(StatsConfig { delta_ms: 1e-12, max_time_ms: 5_000.0 });
        tree.record_success("http://h/a", 10.0);
        let stats = tree.path_stats("h/a").unwrap();
        assert_eq!(stats.buckets().len(), MAX_BUCKETS);
        assert_eq!(stats.buckets().last().unwrap().count, 1);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let cfg: StatsConfig = serde_json::from_str(r#"{ "deltaMs": 20 }"#).unwrap();
        assert_eq!(cfg.delta_ms, 20.0);
        assert_eq!(cfg.max_time_ms, 5_000.0);
    }
}
