use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Process-wide orchestration counters
#[derive(Debug, Default)]
pub struct OrchestrationMetrics {
    pub runs_started: AtomicU64,
    pub runs_succeeded: AtomicU64,
    pub runs_failed: AtomicU64,
    pub merges_performed: AtomicU64,
    pub merges_adopted: AtomicU64,
    pub readiness_polls: AtomicU64,
    pub actions_failed: AtomicU64,
    pub rollbacks: AtomicU64,
}

impl OrchestrationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_run_started(&self) {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_run_finished(&self, success: bool) {
        if success {
            self.runs_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.runs_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_merge(&self, adopted: bool) {
        if adopted {
            self.merges_adopted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.merges_performed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_readiness_poll(&self) {
        self.readiness_polls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_action_failure(&self) {
        self.actions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> OrchestrationStats {
        OrchestrationStats {
            runs_started: self.runs_started.load(Ordering::Relaxed),
            runs_succeeded: self.runs_succeeded.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            merges_performed: self.merges_performed.load(Ordering::Relaxed),
            merges_adopted: self.merges_adopted.load(Ordering::Relaxed),
            readiness_polls: self.readiness_polls.load(Ordering::Relaxed),
            actions_failed: self.actions_failed.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            runs = stats.runs_started,
            succeeded = stats.runs_succeeded,
            failed = stats.runs_failed,
            merges = stats.merges_performed,
            adopted = stats.merges_adopted,
            polls = stats.readiness_polls,
            action_failures = stats.actions_failed,
            rollbacks = stats.rollbacks,
            "Orchestration metrics"
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestrationStats {
    pub runs_started: u64,
    pub runs_succeeded: u64,
    pub runs_failed: u64,
    pub merges_performed: u64,
    pub merges_adopted: u64,
    pub readiness_polls: u64,
    pub actions_failed: u64,
    pub rollbacks: u64,
}

static ORCHESTRATION_METRICS: std::sync::LazyLock<OrchestrationMetrics> =
    std::sync::LazyLock::new(OrchestrationMetrics::new);

pub fn orchestration_metrics() -> &'static OrchestrationMetrics {
    &ORCHESTRATION_METRICS
}

/// Time a phase of an orchestration.
///
/// Runs on the tokio clock so paused-time tests see the virtual durations.
#[derive(Debug)]
pub struct OperationTimer {
    operation: &'static str,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Log the duration and return it in milliseconds
    pub fn finish(self) -> u64 {
        let duration_ms = self.start.elapsed().as_millis() as u64;
        debug!(operation = self.operation, duration_ms, "Phase completed");
        duration_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = OrchestrationMetrics::new();
        metrics.record_run_started();
        metrics.record_merge(false);
        metrics.record_merge(true);
        metrics.record_run_finished(true);

        let stats = metrics.get_stats();
        assert_eq!(stats.runs_started, 1);
        assert_eq!(stats.merges_performed, 1);
        assert_eq!(stats.merges_adopted, 1);
        assert_eq!(stats.runs_succeeded, 1);
        assert_eq!(stats.runs_failed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_follows_tokio_clock() {
        let timer = OperationTimer::new("merge");
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(timer.finish(), 1500);
    }
}
