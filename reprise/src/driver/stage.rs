use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::{
    sync::{Semaphore, watch},
    time::Instant,
};

/// The semaphore reserves the top bits of its counter; never hold more permits than this.
pub const MAX_TOKENS: usize = Semaphore::MAX_PERMITS;

/// A target request rate and how long to ramp to it.
///
/// `Stage::new(Duration::from_secs(10), 100.0)` ramps linearly from the
/// previous rate to 100 requests per second over ten seconds. A zero duration
/// jumps straight to `target` without issuing anything, which is how a run
/// starts at a non-zero rate.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub duration: Duration,
    /// Requests per second at the end of the stage.
    pub target: f64,
}

impl Stage {
    pub fn new(duration: Duration, target: f64) -> Self {
        Self { duration, target }
    }

    /// Jump to `target` immediately.
    pub fn jump(target: f64) -> Self {
        Self::new(Duration::ZERO, target)
    }
}

/// State shared by the governor and every worker.
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    /// One permit per request that may be sent.
    pub tokens: Arc<Semaphore>,
    /// Flips to `true` once the governor is done.
    pub shutdown: watch::Receiver<bool>,
}

impl ExecutionContext {
    pub fn new() -> (Self, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                tokens: Arc::new(Semaphore::new(0)),
                shutdown: rx,
            },
            tx,
        )
    }
}

/// Feed permits into `ctx.tokens` following `stages`, one refill per `tick`.
/// Returns when the last stage is over.
pub async fn token_governor(
    ctx: ExecutionContext,
    stages: Vec<Stage>,
    tick: Duration,
    bucket_capacity: usize,
) {
    let capacity = bucket_capacity.min(MAX_TOKENS);
    let mut rate = 0.0;
    let mut carry = 0.0;
    let total = stages.len();

    for (i, stage) in stages.into_iter().enumerate() {
        tracing::info!(stage = i + 1, of = total, target_rps = stage.target, "entering stage");
        if stage.duration.is_zero() {
            rate = stage.target;
            continue;
        }

        let start = Instant::now();
        let mut next_tick = start;
        let from = rate;

        loop {
            let elapsed = start.elapsed();
            if elapsed >= stage.duration {
                break;
            }
            next_tick += tick;

            let (whole, rest) =
                tokens_for_tick(elapsed, stage.duration, from, stage.target, carry, tick);
            carry = rest;

            let room = capacity.saturating_sub(ctx.tokens.available_permits());
            let add = whole.min(room as u64) as usize;
            if add > 0 {
                ctx.tokens.add_permits(add);
            }
            tokio::time::sleep_until(next_tick).await;
        }
        // Land exactly on the target so rounding never leaks into the next stage.
        rate = stage.target;
    }
    tracing::debug!("governor finished all stages");
}

/// Tokens to add for one tick at `elapsed` into a stage ramping
/// `from -> to` over `stage_duration`.
///
/// Returns the whole tokens and the fractional remainder to carry into the
/// next tick, so low rates are not rounded away.
pub fn tokens_for_tick(
    elapsed: Duration,
    stage_duration: Duration,
    from: f64,
    to: f64,
    carry: f64,
    tick: Duration,
) -> (u64, f64) {
    let progress = (elapsed.as_secs_f64() / stage_duration.as_secs_f64()).min(1.0);
    let rate = from + (to - from) * progress;
    let due = (rate * tick.as_secs_f64()).max(0.0) + carry;
    let whole = due.floor();
    (whole as u64, due - whole)
}
