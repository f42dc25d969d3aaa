use std::{future::Future, io::Write};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{RateWindow, StatsTree, stats::quantile};

/// Percentiles included in every [`PathReport`].
pub const REPORTED_PERCENTILES: [f64; 3] = [50.0, 90.0, 99.0];

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write report: {0}")]
    Io(#[from] std::io::Error),
}

/// Summary of one path prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathReport {
    pub path: String,
    pub requests: u64,
    pub errors: u64,
    /// `None` when nothing was recorded.
    pub error_rate: Option<f64>,
    pub mean_ms: Option<f64>,
    pub p50_ms: Option<f64>,
    pub p90_ms: Option<f64>,
    pub p99_ms: Option<f64>,
}

/// Point-in-time view of a run, ready to be serialized.
///
/// A report is plain data: building it does no I/O and printing it is left to
/// a [`Reporter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsReport {
    pub paths: Vec<PathReport>,
    pub requests_per_second: f64,
    pub concurrent_requests: usize,
    pub max_concurrent_requests: usize,
}

impl StatsReport {
    pub fn capture(stats: &StatsTree, rate: &RateWindow) -> Self {
        let paths = stats
            .paths()
            .into_iter()
            .filter_map(|path| {
                let snapshot = stats.path_stats(&path)?;
                let [p50, p90, p99] =
                    REPORTED_PERCENTILES.map(|p| quantile(snapshot.samples(), p));
                Some(PathReport {
                    requests: snapshot.requests,
                    errors: snapshot.errors,
                    error_rate: snapshot.error_rate(),
                    mean_ms: snapshot.mean_ms(),
                    p50_ms: p50,
                    p90_ms: p90,
                    p99_ms: p99,
                    path,
                })
            })
            .collect();

        Self {
            paths,
            requests_per_second: rate.rate_per_second(),
            concurrent_requests: stats.concurrent_requests(),
            max_concurrent_requests: stats.max_concurrent_requests(),
        }
    }

    pub fn path(&self, path: &str) -> Option<&PathReport> {
        self.paths.iter().find(|p| p.path == path)
    }
}

/// Sends a report somewhere: a terminal, a file, a metrics backend.
pub trait Reporter<R: Serialize + Sync> {
    fn report(&self, report: &R) -> impl Future<Output = Result<(), ReportError>> + Send;
}

/// Prints reports to stdout as pretty JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutReporter;

impl<R: Serialize + Sync> Reporter<R> for StdoutReporter {
    async fn report(&self, report: &R) -> Result<(), ReportError> {
        let json = serde_json::to_string_pretty(report)?;
        let mut out = std::io::stdout().lock();
        writeln!(out, "{json}")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn capture_summarizes_every_prefix() {
        let stats = StatsTree::default();
        let rate = RateWindow::from_secs(10);
        for t in [10.0, 20.0, 30.0] {
            stats.record_success("http://h/a", t);
            rate.tick();
        }
        stats.record_error("http://h/b");
        let id = stats.start_request();

        let report = StatsReport::capture(&stats, &rate);
        assert_eq!(
            report.paths.iter().map(|p| p.path.as_str()).collect::<Vec<_>>(),
            vec!["h", "h/a", "h/b"]
        );

        let root = report.path("h").unwrap();
        assert_eq!((root.requests, root.errors), (4, 1));
        assert_eq!(root.error_rate, Some(25.0));
        assert_eq!(root.p50_ms, Some(20.0));

        let failing = report.path("h/b").unwrap();
        assert_eq!(failing.p50_ms, None);
        assert_eq!(failing.mean_ms, None);

        assert!((report.requests_per_second - 0.3).abs() < 1e-9);
        assert_eq!(report.concurrent_requests, 1);
        stats.finish_request(id);
    }

    #[tokio::test]
    async fn report_serializes_to_json() {
        let stats = StatsTree::default();
        stats.record_success("http://h", 5.0);
        let report = StatsReport::capture(&stats, &RateWindow::from_secs(1));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["paths"][0]["path"], "h");
        assert_eq!(json["paths"][0]["p99_ms"], 5.0);
        StdoutReporter.report(&report).await.unwrap();
    }
}
