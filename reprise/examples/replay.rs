//! Replays a captured payload against a local server and prints the stats.
//!
//! ```text
//! RUST_LOG=reprise=info,reprise::wire=debug cargo run --example replay -- capture.txt
//! ```
//!
//! Without an argument a built-in `GET /` is replayed.

use std::{sync::Arc, time::Duration};

use reprise::{
    RateWindow, ReplayClient, ReplayOptions, StatsTree,
    driver::{ReplayDriver, Stage},
    report::{Reporter, StatsReport, StdoutReporter},
    store::{FsPayloadStore, PayloadStore},
};
use tracing_subscriber::EnvFilter;

const FALLBACK: &str = "GET / HTTP/1.1\r\nHost: localhost:3000\r\nAccept: */*\r\n\r\n";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let payload: Arc<str> = match std::env::args().nth(1) {
        Some(name) => FsPayloadStore::in_home()
            .load(&name)?
            .ok_or_else(|| format!("no payload named {name:?}"))?,
        None => FALLBACK.into(),
    };

    // One client for the whole run, it owns the connection pool
    let stats = Arc::new(StatsTree::default());
    let rate = Arc::new(RateWindow::from_secs(10));
    let client = ReplayClient::new(
        ReplayOptions::builder()
            .override_host("localhost")
            .override_port(3000)
            .build(),
        rate.clone(),
        stats.clone(),
    )?;

    // Warm up, hold, then back off
    let summary = ReplayDriver::builder()
        .stages(vec![
            Stage::new(Duration::from_secs(5), 10.0),
            Stage::new(Duration::from_secs(5), 100.0),
            Stage::new(Duration::from_secs(5), 10.0),
        ])
        .build()
        .run(&client, &[payload.as_bytes()])
        .await?;
    tracing::info!(?summary, "run complete");

    StdoutReporter
        .report(&StatsReport::capture(&stats, &rate))
        .await?;
    Ok(())
}
