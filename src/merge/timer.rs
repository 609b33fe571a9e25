//! Clocks, cancellation and the readiness ticker

use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
pub use tokio_util::sync::CancellationToken;

/// Source of wall-clock timestamps
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// How a wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Elapsed,
    Cancelled,
}

pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> WaitOutcome {
    if cancel.is_cancelled() {
        return WaitOutcome::Cancelled;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => WaitOutcome::Elapsed,
        _ = cancel.cancelled() => WaitOutcome::Cancelled,
    }
}

/// Paces readiness polls between a floor and a ceiling, and never past a
/// deadline
#[derive(Debug, Clone)]
pub struct Ticker {
    min: Duration,
    max: Duration,
    cancel: CancellationToken,
}

impl Ticker {
    pub fn new(min: Duration, max: Duration, cancel: CancellationToken) -> Self {
        let max = max.max(min);
        Self { min, max, cancel }
    }

    /// Clamp a requested wait to `[min, max]` and then to what is left
    /// before `deadline`
    pub fn next_wait(&self, requested: Duration, deadline: Instant) -> Duration {
        let clamped = requested.clamp(self.min, self.max);
        clamped.min(deadline.saturating_duration_since(Instant::now()))
    }

    pub async fn wait(&self, requested: Duration, deadline: Instant) -> WaitOutcome {
        let wait = self.next_wait(requested, deadline);
        sleep_or_cancel(wait, &self.cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_only_moves_when_advanced() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(90));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_elapses_without_cancel() {
        let cancel = CancellationToken::new();
        let started = Instant::now();
        assert_eq!(sleep_or_cancel(Duration::from_secs(30), &cancel).await, WaitOutcome::Elapsed);
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_sleep_immediately() {
        let cancel = CancellationToken::new();
        let remote = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            remote.cancel();
        });

        let started = Instant::now();
        let outcome = sleep_or_cancel(Duration::from_secs(3600), &cancel).await;
        assert_eq!(outcome, WaitOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelling_the_shutdown_token_stops_a_run_ticker() {
        let shutdown = CancellationToken::new();
        let run = shutdown.child_token();
        let ticker = Ticker::new(Duration::from_secs(5), Duration::from_secs(300), run.clone());
        shutdown.cancel();

        let deadline = Instant::now() + Duration::from_secs(3600);
        assert_eq!(ticker.wait(Duration::from_secs(60), deadline).await, WaitOutcome::Cancelled);
        assert!(run.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_clamps_to_bounds_and_deadline() {
        let ticker = Ticker::new(
            Duration::from_secs(5),
            Duration::from_secs(300),
            CancellationToken::new(),
        );
        let far = Instant::now() + Duration::from_secs(10_000);

        assert_eq!(ticker.next_wait(Duration::from_secs(1), far), Duration::from_secs(5));
        assert_eq!(ticker.next_wait(Duration::from_secs(900), far), Duration::from_secs(300));
        assert_eq!(ticker.next_wait(Duration::from_secs(60), far), Duration::from_secs(60));

        let near = Instant::now() + Duration::from_secs(20);
        assert_eq!(ticker.next_wait(Duration::from_secs(60), near), Duration::from_secs(20));
    }
}
