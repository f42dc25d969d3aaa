use std::{collections::VecDeque, time::Duration};

use parking_lot::Mutex;
use tokio::time::Instant;

/// Events per second over a trailing window.
///
/// Every [`tick`](RateWindow::tick) appends the current instant. Expired
/// instants are dropped from the head on the next `tick` or
/// [`rate_per_second`](RateWindow::rate_per_second) call, so memory stays
/// bounded by `window * peak rate` without a background timer.
///
/// Timestamps come from [`tokio::time::Instant`], which follows the paused
/// test clock.
#[derive(Debug)]
pub struct RateWindow {
    window: Duration,
    ticks: Mutex<VecDeque<Instant>>,
}

impl RateWindow {
    /// Panics if `window` is zero.
    pub fn new(window: Duration) -> Self {
        assert!(!window.is_zero(), "rate window must be longer than zero");
        Self {
            window,
            ticks: Mutex::new(VecDeque::new()),
        }
    }

    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record one event now.
    pub fn tick(&self) {
        let now = Instant::now();
        let mut ticks = self.ticks.lock();
        ticks.push_back(now);
        self.evict(&mut ticks, now);
    }

    /// Retained events divided by the window length in seconds.
    pub fn rate_per_second(&self) -> f64 {
        let mut ticks = self.ticks.lock();
        self.evict(&mut ticks, Instant::now());
        ticks.len() as f64 / self.window.as_secs_f64()
    }

    /// Number of events currently retained. Does not evict.
    pub fn len(&self) -> usize {
        self.ticks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict(&self, ticks: &mut VecDeque<Instant>, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.window) else {
            return;
        };
        while ticks.front().is_some_and(|t| *t < cutoff) {
            ticks.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rate_is_ticks_over_window() {
        let window = RateWindow::from_secs(10);
        for _ in 0..7 {
            window.tick();
            tokio::time::advance(Duration::from_millis(100)).await;
        }
        assert!((window.rate_per_second() - 0.7).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_ticks_are_evicted_lazily() {
        let window = RateWindow::from_secs(10);
        for _ in 0..5 {
            window.tick();
        }
        tokio::time::advance(Duration::from_secs(11)).await;
        // Nothing evicts until the window is touched again.
        assert_eq!(window.len(), 5);

        window.tick();
        assert_eq!(window.len(), 1);
        assert!((window.rate_per_second() - 0.1).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_on_the_boundary_are_kept() {
        let window = RateWindow::from_secs(2);
        window.tick();
        tokio::time::advance(Duration::from_secs(2)).await;
        window.tick();
        assert_eq!(window.len(), 2);
        assert!((window.rate_per_second() - 1.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_query_also_evicts() {
        let window = RateWindow::from_secs(1);
        window.tick();
        window.tick();
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(window.rate_per_second(), 0.0);
        assert!(window.is_empty());
    }

    #[test]
    #[should_panic]
    fn zero_window_is_rejected() {
        RateWindow::new(Duration::ZERO);
    }
}
