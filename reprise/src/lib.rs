//! Reprise — replay captured HTTP requests and measure how the target holds up.
//!
//! Feed it raw request payloads exactly as they were captured off the wire and
//! it sends them again, against the original host or anything you point it
//! at, while keeping track of latency, errors and throughput per URL path
//! prefix.
//!
//! # Architecture
//!
//! The building blocks, leaves first:
//!
//! - [`parser`]: turns a raw payload into a [`ParsedRequest`].
//! - [`RateWindow`]: completed requests per second over a trailing window.
//! - [`StatsTree`]: latency histograms, exact quantiles, error counts and a
//!   concurrency high-water mark for every path prefix. A request to
//!   `http://host/api/users` is counted under `host`, `host/api` and
//!   `host/api/users`.
//! - [`ReplayClient`]: applies [`ReplayOptions`], sends one request, and
//!   reports the [`ReplayOutcome`] to the shared `StatsTree` and `RateWindow`.
//! - [`driver`]: replays a set of payloads at rates described by stages.
//! - [`report`]: serializable snapshots of the statistics and the
//!   [`Reporter`](report::Reporter) seam for printing them.
//! - [`store`]: saves captured payloads under a name and loads them back.
//!
//! The statistics and the rate window are explicit shared handles: create
//! them once, hand `Arc`s to the client, query them whenever you like. Every
//! update is safe to make from many replays at once.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use reprise::{RateWindow, ReplayClient, ReplayOptions, StatsTree};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let stats = Arc::new(StatsTree::default());
//!     let rate = Arc::new(RateWindow::from_secs(10));
//!     let client = ReplayClient::new(
//!         ReplayOptions::builder()
//!             .override_host("localhost")
//!             .override_port(3000)
//!             .build(),
//!         rate.clone(),
//!         stats.clone(),
//!     )?;
//!
//!     let payload = b"GET /api/users HTTP/1.1\r\nHost: shop.example.com\r\n\r\n";
//!     // Parse problems come back here, before anything is sent.
//!     let replay = client.replay(payload)?;
//!     // Network problems come back as a failed outcome.
//!     let outcome = replay.await;
//!     println!("{} took {:.1}ms", outcome.url(), outcome.elapsed_ms());
//!
//!     println!("p50 for /api: {:?}", stats.quantile("shop.example.com/api", 50.0));
//!     println!("throughput: {:.2}/s", rate.rate_per_second());
//!     Ok(())
//! }
//! ```
//!
//! # Logging
//!
//! Everything is reported through [`tracing`]. Lifecycle events are `info`,
//! per-replay detail is `debug`, transport failures are `warn`. The request
//! and response dumps switched on by [`ReplayOptions::verbose`] and
//! [`ReplayOptions::output_headers`] go to the `reprise::wire` target.
//!
//! # Feature flags
//! - `internals`: expose the driver's token governor for custom executors.

/// Raw payload parsing
pub mod parser;
/// Sending one replay and recording its outcome
pub mod client;
/// Stage-based load generation
pub mod driver;
/// Replay configuration
pub mod options;
/// Throughput over a trailing window
pub mod rate;
/// Snapshots and reporters
pub mod report;
/// Per-path statistics
pub mod stats;
/// Named payload storage
pub mod store;

pub use client::{PreparedReplay, ReplayClient, ReplayError, ReplayOutcome, ReplayResponse, TransportError};
pub use options::{Protocol, ReplayOptions};
pub use parser::{ParseError, ParsedRequest, parse_request};
pub use rate::RateWindow;
pub use stats::{StatsConfig, StatsError, StatsTree};
