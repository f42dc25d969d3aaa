//! Stage-driven load generation over a set of captured payloads.
//!
//! The driver separates *how fast* from *what*: a governor task turns the
//! configured [`Stage`]s into permits on a semaphore, and a pool of worker
//! tasks each claim one permit per replay. Workers walk the payloads
//! round-robin and send them through a shared [`ReplayClient`], so every
//! outcome ends up in the client's [`StatsTree`](crate::StatsTree) and
//! [`RateWindow`](crate::RateWindow).
//!
//! # Flow
//! 1. Every payload is prepared up front; a bad one fails the run before
//!    anything is sent.
//! 2. Workers are spawned and wait for permits.
//! 3. The governor ramps through the stages. For a stage ramping from
//!    `from` to `to` over `duration`, the rate at `elapsed` is
//!
//!    ```text
//!    r = from + (to - from) * elapsed / duration
//!    ```
//!
//!    and each tick adds `floor(r * tick + carry)` permits, capped by
//!    `bucket_capacity`. The fractional part is carried to the next tick.
//! 4. When the governor is done the workers are told to stop. Replays
//!    already in flight finish and are counted; unclaimed permits are dropped.
//!
//! # Tuning knobs
//! - `tick`: refill granularity. Small ticks give a smoother rate at the cost
//!   of more wakeups.
//! - `bucket_capacity`: how many unused permits may pile up, i.e. how large a
//!   burst can be after the target stalls.
//! - `workers`: upper bound on replays in flight. Defaults to `num_cpus * 120`.

mod stage;

pub use stage::{MAX_TOKENS, Stage};
#[cfg(feature = "internals")]
pub use stage::{ExecutionContext, token_governor, tokens_for_tick};
#[cfg(not(feature = "internals"))]
use stage::{ExecutionContext, token_governor};

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use typed_builder::TypedBuilder;

use crate::client::{PreparedReplay, ReplayClient, ReplayError, ReplayOutcome};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("nothing to replay: no payloads given")]
    NoPayloads,
    #[error("payload #{index} cannot be replayed: {source}")]
    Payload {
        index: usize,
        #[source]
        source: ReplayError,
    },
}

/// Counts of what a run sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverSummary {
    pub issued: u64,
    pub completed: u64,
    pub failed: u64,
}

impl DriverSummary {
    fn record(&mut self, outcome: &ReplayOutcome) {
        self.issued += 1;
        if outcome.is_success() {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
    }

    fn merge(&mut self, other: DriverSummary) {
        self.issued += other.issued;
        self.completed += other.completed;
        self.failed += other.failed;
    }
}

/// Replays payloads at the rates described by `stages`.
///
/// ```no_run
/// # use std::{sync::Arc, time::Duration};
/// # use reprise::{ReplayClient, ReplayOptions, RateWindow, StatsTree, driver::{ReplayDriver, Stage}};
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let client = ReplayClient::new(
///     ReplayOptions::default(),
///     Arc::new(RateWindow::from_secs(10)),
///     Arc::new(StatsTree::default()),
/// )?;
/// let summary = ReplayDriver::builder()
///     .stages(vec![
///         Stage::new(Duration::from_secs(10), 50.0),
///         Stage::new(Duration::from_secs(30), 50.0),
///     ])
///     .build()
///     .run(&client, &["GET /health HTTP/1.1\r\nHost: localhost:3000\r\n\r\n"])
///     .await?;
/// println!("{summary:?}");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, TypedBuilder)]
pub struct ReplayDriver {
    pub stages: Vec<Stage>,
    #[builder(default = Duration::from_millis(100))]
    pub tick: Duration,
    #[builder(default = MAX_TOKENS)]
    pub bucket_capacity: usize,
    // 120 workers per cpu keeps plenty of I/O-bound replays in flight
    #[builder(default = num_cpus::get() * 120)]
    pub workers: usize,
}

impl ReplayDriver {
    pub async fn run<P: AsRef<[u8]>>(
        &self,
        client: &ReplayClient,
        payloads: &[P],
    ) -> Result<DriverSummary, DriverError> {
        if payloads.is_empty() {
            return Err(DriverError::NoPayloads);
        }
        let replays: Arc<[PreparedReplay]> = payloads
            .iter()
            .enumerate()
            .map(|(index, payload)| {
                client
                    .prepare(payload.as_ref())
                    .map_err(|source| DriverError::Payload { index, source })
            })
            .collect::<Result<Vec<_>, _>>()?
            .into();

        let (ctx, shutdown_tx) = ExecutionContext::new();
        let workers = self.workers.max(1);
        tracing::info!(workers, payloads = replays.len(), "spawning replay workers");
        let handles = spawn_workers(ctx.clone(), workers, client.clone(), replays);

        tracing::info!(stages = self.stages.len(), "starting token governor");
        token_governor(
            ctx,
            self.stages.clone(),
            self.tick.max(Duration::from_millis(1)),
            self.bucket_capacity,
        )
        .await;

        tracing::info!("stages done, waiting for in-flight replays");
        // Workers that already exited have dropped their receivers.
        let _ = shutdown_tx.send(true);

        let mut summary = DriverSummary::default();
        for joined in join_all(handles).await {
            match joined {
                Ok(tally) => summary.merge(tally),
                Err(e) => tracing::error!("replay worker panicked: {e}"),
            }
        }

        tracing::info!(
            issued = summary.issued,
            completed = summary.completed,
            failed = summary.failed,
            "replay run finished"
        );
        Ok(summary)
    }
}

/// Spawn `workers` tasks that each send one replay per claimed permit.
fn spawn_workers(
    ctx: ExecutionContext,
    workers: usize,
    client: ReplayClient,
    replays: Arc<[PreparedReplay]>,
) -> Vec<JoinHandle<DriverSummary>> {
    let cursor = Arc::new(AtomicUsize::new(0));
    (0..workers)
        .map(|_| {
            let mut ctx = ctx.clone();
            let client = client.clone();
            let replays = Arc::clone(&replays);
            let cursor = Arc::clone(&cursor);
            tokio::spawn(async move {
                let mut tally = DriverSummary::default();
                loop {
                    let permit = tokio::select! {
                        biased;
                        _ = ctx.shutdown.wait_for(|done| *done) => break,
                        permit = ctx.tokens.acquire() => permit,
                    };
                    match permit {
                        Ok(permit) => permit.forget(),
                        Err(_) => break,
                    }
                    // Not raced against shutdown, so the stats always see the outcome.
                    let next = cursor.fetch_add(1, Ordering::Relaxed) % replays.len();
                    let outcome = client.execute(&replays[next]).await;
                    tally.record(&outcome);
                }
                tally
            })
        })
        .collect()
}
