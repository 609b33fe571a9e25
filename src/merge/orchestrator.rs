//! Top-level orchestration state machine
//!
//! ```text
//! Evaluating ─┬─> Merging ──> RunningPostActions ──> CheckingCompletion ──> Done(success)
//!             ├─> WaitingForReadiness ──> Evaluating                    └──> Done(failure)
//!             └─> Done(failure)
//! Merging ──(retryable, attempts left)──> Evaluating
//! ```
//!
//! Each [`Orchestrator::run`] drives one candidate to `Done`. The run is
//! bounded by the total budget; readiness waiting by its own timeout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn, Instrument};

use super::checkpoint::{CompletionCheckpoint, CompletionOutcome, CompletionTiming};
use super::config::{ConfigError, OrchestratorConfig};
use super::executor::MergeExecutor;
use super::lock::{CandidateFileLock, CandidateLocks};
use super::pipeline::{ActionPipeline, PipelineDeps, PipelineReport};
use super::readiness::ReadinessEvaluator;
use super::timer::{sleep_or_cancel, CancellationToken, Clock, Ticker, WaitOutcome};
use super::types::{ErrorKind, MergeCandidate, MergeOutcome, ReadinessVerdict};
use crate::events::{EventEmitter, EventSink, EventType};
use crate::external::{with_timeout, CiProvider, Deployer, GitHost, Notifier, PullState};
use crate::fs::FileSystemOperations;
use crate::observability::{orchestration_metrics, OperationTimer};
use crate::telemetry::{create_orchestration_span, generate_correlation_id};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Completion {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrchestrationState {
    Evaluating,
    WaitingForReadiness,
    Merging,
    RunningPostActions,
    CheckingCompletion,
    Done(Completion),
}

impl OrchestrationState {
    pub fn is_done(&self) -> bool {
        matches!(self, OrchestrationState::Done(_))
    }
}

impl fmt::Display for OrchestrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestrationState::Evaluating => f.write_str("evaluating"),
            OrchestrationState::WaitingForReadiness => f.write_str("waiting-for-readiness"),
            OrchestrationState::Merging => f.write_str("merging"),
            OrchestrationState::RunningPostActions => f.write_str("running-post-actions"),
            OrchestrationState::CheckingCompletion => f.write_str("checking-completion"),
            OrchestrationState::Done(Completion::Success) => f.write_str("done(success)"),
            OrchestrationState::Done(Completion::Failure) => f.write_str("done(failure)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "error", rename_all = "kebab-case")]
pub enum FailureKind {
    /// A mandatory requirement failed
    Blocked,
    MergeFailed(ErrorKind),
    Timeout,
    Cancelled,
    CompletionFailed,
}

/// Why a run ended in `Done(failure)`, in words a person can act on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransitionRecord {
    pub from: OrchestrationState,
    pub to: OrchestrationState,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationReport {
    pub candidate_id: u64,
    pub correlation_id: String,
    pub state: OrchestrationState,
    pub outcome: CompletionOutcome,
    pub failure: Option<FailureSummary>,
    pub verdict: Option<ReadinessVerdict>,
    pub merge: Option<MergeOutcome>,
    pub pipeline: Option<PipelineReport>,
    pub transitions: Vec<StateTransitionRecord>,
    /// Merge executor calls, including ones that failed or adopted
    pub merge_invocations: u32,
}

impl OrchestrationReport {
    pub fn is_success(&self) -> bool {
        self.state == OrchestrationState::Done(Completion::Success)
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Candidate #{0} is already being orchestrated")]
    AlreadyRunning(u64),
    #[error("Failed to lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid orchestrator configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
}

/// Everything the orchestrator talks to
#[derive(Clone)]
pub struct Collaborators {
    pub host: Arc<dyn GitHost>,
    pub ci: Arc<dyn CiProvider>,
    pub deployer: Arc<dyn Deployer>,
    pub notifier: Arc<dyn Notifier>,
    pub fs: Arc<dyn FileSystemOperations>,
    pub events: Arc<dyn EventSink>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Default)]
pub struct OrchestratorPaths {
    pub artifacts_dir: PathBuf,
    /// Cross-process candidate locks are only taken when this is set
    pub lock_dir: Option<PathBuf>,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    host: Arc<dyn GitHost>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    evaluator: ReadinessEvaluator,
    executor: MergeExecutor,
    pipeline: ActionPipeline,
    checkpoint: CompletionCheckpoint,
    locks: CandidateLocks,
    lock_dir: Option<PathBuf>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("lock_dir", &self.lock_dir)
            .finish()
    }
}

/// Mutable state of one run
struct Run {
    candidate: MergeCandidate,
    state: OrchestrationState,
    transitions: Vec<StateTransitionRecord>,
    verdict: Option<ReadinessVerdict>,
    merge: Option<MergeOutcome>,
    pipeline: Option<PipelineReport>,
    outcome: Option<CompletionOutcome>,
    failure: Option<FailureSummary>,
    merge_invocations: u32,
    timing: CompletionTiming,
    started: Instant,
    deadline: Instant,
    waiting_since: Option<Instant>,
}

impl Run {
    fn merged(&self) -> bool {
        self.merge.as_ref().is_some_and(|m| m.success)
    }
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        collaborators: Collaborators,
        paths: OrchestratorPaths,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;
        let call_timeout = config.timeouts.call_timeout();
        let deps = PipelineDeps {
            host: collaborators.host.clone(),
            deployer: collaborators.deployer.clone(),
            notifier: collaborators.notifier.clone(),
            fs: collaborators.fs.clone(),
            clock: collaborators.clock.clone(),
        };

        Ok(Self {
            evaluator: ReadinessEvaluator::new(
                collaborators.host.clone(),
                collaborators.ci.clone(),
                collaborators.clock.clone(),
                &config,
            ),
            executor: MergeExecutor::new(
                collaborators.host.clone(),
                collaborators.clock.clone(),
                config.actor.clone(),
                call_timeout,
            ),
            pipeline: ActionPipeline::new(
                deps.clone(),
                config.pipeline.clone(),
                config.actor.clone(),
                call_timeout,
                paths.artifacts_dir,
            ),
            checkpoint: CompletionCheckpoint::new(&deps, config.checkpoint.clone(), call_timeout),
            host: collaborators.host,
            clock: collaborators.clock,
            events: collaborators.events,
            locks: CandidateLocks::new(),
            lock_dir: paths.lock_dir,
            config,
        })
    }

    /// Share a lock registry with other orchestrators in this process
    pub fn with_locks(mut self, locks: CandidateLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn locks(&self) -> &CandidateLocks {
        &self.locks
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// One readiness evaluation, without locking or merging
    pub async fn evaluate(&self, candidate: &MergeCandidate) -> ReadinessVerdict {
        self.evaluator.evaluate(candidate).await
    }

    /// Drive `candidate` to `Done`.
    ///
    /// Only locking problems are errors. Every domain failure is reported
    /// through [`OrchestrationReport::failure`].
    pub async fn run(
        &self,
        candidate: MergeCandidate,
        cancel: CancellationToken,
    ) -> Result<OrchestrationReport, OrchestratorError> {
        let id = candidate.id;
        let _guard = self
            .locks
            .try_acquire(id)
            .ok_or(OrchestratorError::AlreadyRunning(id))?;

        let mut file_lock = match &self.lock_dir {
            Some(dir) => {
                let lock = CandidateFileLock::open(dir, id).map_err(|source| {
                    OrchestratorError::Lock {
                        path: dir.clone(),
                        source,
                    }
                })?;
                Some(lock)
            }
            None => None,
        };
        let _file_guard = match file_lock.as_mut() {
            Some(lock) => {
                let path = lock.path().to_path_buf();
                let guard = lock
                    .try_lock()
                    .map_err(|source| OrchestratorError::Lock { path, source })?;
                Some(guard.ok_or(OrchestratorError::AlreadyRunning(id))?)
            }
            None => None,
        };

        let correlation_id = generate_correlation_id();
        let span = create_orchestration_span(id, candidate.work_item, &correlation_id);
        let report = self
            .drive(candidate, cancel, correlation_id)
            .instrument(span)
            .await;
        Ok(report)
    }

    async fn drive(
        &self,
        candidate: MergeCandidate,
        cancel: CancellationToken,
        correlation_id: String,
    ) -> OrchestrationReport {
        let timeouts = &self.config.timeouts;
        let emitter = EventEmitter::new(
            self.events.clone(),
            self.clock.clone(),
            correlation_id.clone(),
            candidate.id,
            candidate.work_item,
        )
        .with_timeout(timeouts.call_timeout());
        let ticker = Ticker::new(timeouts.min_poll(), timeouts.max_poll(), cancel.clone());
        let started = Instant::now();
        let mut run = Run {
            candidate,
            state: OrchestrationState::Evaluating,
            transitions: Vec::new(),
            verdict: None,
            merge: None,
            pipeline: None,
            outcome: None,
            failure: None,
            merge_invocations: 0,
            timing: CompletionTiming::default(),
            started,
            deadline: started + timeouts.total_budget(),
            waiting_since: None,
        };

        orchestration_metrics().record_run_started();
        info!(
            candidate = run.candidate.id,
            branch = %run.candidate.source_branch,
            target = %run.candidate.target_branch,
            "Starting merge orchestration"
        );
        emitter
            .emit(
                EventType::OrchestrationStarted,
                json!({
                    "source_branch": &run.candidate.source_branch,
                    "target_branch": &run.candidate.target_branch,
                    "head_sha": &run.candidate.head_sha,
                    "strategy": self.config.strategy,
                }),
            )
            .await;

        while !run.state.is_done() {
            // Once merged, cleanup and verification always run to completion
            if Instant::now() >= run.deadline && !run.merged() {
                let message = format!(
                    "total budget of {}s exhausted while {}",
                    timeouts.total_budget_secs, run.state
                );
                self.fail(&mut run, &emitter, FailureKind::Timeout, message).await;
                continue;
            }
            if cancel.is_cancelled() && !run.merged() {
                let message = format!("cancelled while {}", run.state);
                self.fail(&mut run, &emitter, FailureKind::Cancelled, message).await;
                continue;
            }

            match run.state {
                OrchestrationState::Evaluating => self.step_evaluate(&mut run, &emitter).await,
                OrchestrationState::WaitingForReadiness => {
                    self.step_wait(&mut run, &emitter, &ticker).await
                }
                OrchestrationState::Merging => self.step_merge(&mut run, &emitter, &cancel).await,
                OrchestrationState::RunningPostActions => {
                    self.step_post_actions(&mut run, &emitter).await
                }
                OrchestrationState::CheckingCompletion => self.step_check(&mut run, &emitter).await,
                OrchestrationState::Done(_) => {}
            }
        }

        self.finish(run, &emitter, correlation_id).await
    }

    async fn step_evaluate(&self, run: &mut Run, emitter: &EventEmitter) {
        if run.merge_invocations > 0 {
            self.refresh_head(run).await;
        }

        let timer = OperationTimer::new("readiness_evaluation");
        let verdict = self.evaluator.evaluate(&run.candidate).await;
        run.timing.evaluation_ms += timer.finish();
        run.timing.readiness_polls += 1;
        orchestration_metrics().record_readiness_poll();

        emitter
            .emit(
                EventType::ReadinessEvaluated,
                json!({
                    "can_merge": verdict.can_merge,
                    "blocking_issues": &verdict.blocking_issues,
                    "warnings": &verdict.warnings,
                    "estimated_ready_at": verdict.estimated_ready_at,
                    "poll": run.timing.readiness_polls,
                }),
            )
            .await;

        if verdict.can_merge {
            run.verdict = Some(verdict);
            let reason = "all mandatory requirements satisfied";
            self.transition(run, emitter, OrchestrationState::Merging, reason)
                .await;
        } else if verdict.has_failed_mandatory() {
            let message = format!("blocked: {}", verdict.summary());
            run.verdict = Some(verdict);
            self.fail(run, emitter, FailureKind::Blocked, message).await;
        } else {
            let reason = verdict.summary();
            run.verdict = Some(verdict);
            self.transition(run, emitter, OrchestrationState::WaitingForReadiness, reason)
                .await;
        }
    }

    async fn step_wait(&self, run: &mut Run, emitter: &EventEmitter, ticker: &Ticker) {
        let timeouts = &self.config.timeouts;
        let now = Instant::now();
        let waiting_since = *run.waiting_since.get_or_insert(now);
        let readiness_deadline = waiting_since + timeouts.readiness_timeout();

        if now >= readiness_deadline {
            let summary = run
                .verdict
                .as_ref()
                .map(|v| v.summary())
                .unwrap_or_else(|| "readiness unknown".to_string());
            let message = format!(
                "not ready after {}s: {summary}",
                timeouts.readiness_timeout_secs
            );
            self.fail(run, emitter, FailureKind::Timeout, message).await;
            return;
        }

        let requested = run
            .verdict
            .as_ref()
            .and_then(|v| v.estimated_ready_at)
            .and_then(|at| (at - self.clock.now()).to_std().ok())
            .unwrap_or_else(|| timeouts.poll_interval());
        let deadline = readiness_deadline.min(run.deadline);

        match ticker.wait(requested, deadline).await {
            WaitOutcome::Elapsed => {
                let reason = "re-checking readiness";
                self.transition(run, emitter, OrchestrationState::Evaluating, reason)
                    .await;
            }
            WaitOutcome::Cancelled => {
                let message = "cancelled while waiting for readiness".to_string();
                self.fail(run, emitter, FailureKind::Cancelled, message).await;
            }
        }
    }

    async fn step_merge(&self, run: &mut Run, emitter: &EventEmitter, cancel: &CancellationToken) {
        run.merge_invocations += 1;
        let attempt = run.merge_invocations;
        emitter
            .emit(
                EventType::MergeAttempted,
                json!({
                    "attempt": attempt,
                    "strategy": self.config.strategy,
                    "head_sha": &run.candidate.head_sha,
                }),
            )
            .await;

        let outcome = self.executor.execute(&run.candidate, self.config.strategy).await;
        run.timing.merge_ms += outcome.duration_ms;

        if outcome.success {
            orchestration_metrics().record_merge(outcome.adopted);
            if outcome.adopted {
                emitter
                    .emit(EventType::MergeAdopted, json!({ "merge_commit": &outcome.merge_commit }))
                    .await;
            }
            let reason = format!(
                "merged as {}",
                outcome.merge_commit.as_deref().unwrap_or("unknown commit")
            );
            run.merge = Some(outcome);
            self.transition(run, emitter, OrchestrationState::RunningPostActions, reason)
                .await;
            return;
        }

        let error = outcome.error().cloned();
        run.merge = Some(outcome);
        let Some(error) = error else {
            self.fail(
                run,
                emitter,
                FailureKind::MergeFailed(ErrorKind::PolicyViolation),
                "merge failed without an error".to_string(),
            )
            .await;
            return;
        };

        let wants_retry = error.retryable || error.kind == ErrorKind::RequirementsNotMet;
        if wants_retry && attempt < self.config.max_merge_attempts {
            if error.kind == ErrorKind::TransportError {
                let backoff = self
                    .config
                    .timeouts
                    .transport_backoff()
                    .min(run.deadline.saturating_duration_since(Instant::now()));
                sleep_or_cancel(backoff, cancel).await;
            }
            let reason = format!("merge attempt {attempt} failed ({error}), re-evaluating");
            self.transition(run, emitter, OrchestrationState::Evaluating, reason)
                .await;
        } else {
            let message = if wants_retry {
                format!("merge failed after {attempt} attempt(s): {error}")
            } else {
                format!("merge failed: {error}")
            };
            self.fail(run, emitter, FailureKind::MergeFailed(error.kind), message)
                .await;
        }
    }

    async fn step_post_actions(&self, run: &mut Run, emitter: &EventEmitter) {
        let Some(merge) = run.merge.as_ref() else {
            let message = "no merge outcome to act on".to_string();
            self.fail(run, emitter, FailureKind::CompletionFailed, message).await;
            return;
        };
        let report = self
            .pipeline
            .run(&run.candidate, merge, emitter, run.deadline)
            .await;
        run.timing.pipeline_ms += report.duration_ms;

        let reason = match report.halted_by {
            Some(kind) => format!("pipeline halted by {kind}"),
            None => "pipeline finished".to_string(),
        };
        run.pipeline = Some(report);
        self.transition(run, emitter, OrchestrationState::CheckingCompletion, reason)
            .await;
    }

    async fn step_check(&self, run: &mut Run, emitter: &EventEmitter) {
        let (Some(merge), Some(report)) = (run.merge.as_ref(), run.pipeline.as_ref()) else {
            self.fail(run, emitter, FailureKind::CompletionFailed, "nothing to verify".to_string())
                .await;
            return;
        };
        let mut outcome = self.checkpoint.verify(&run.candidate, merge, report, emitter).await;

        if outcome.success {
            emitter
                .emit(
                    EventType::NextWorkRequested,
                    json!({
                        "merge_commit": &outcome.merge_commit,
                        "target_branch": &run.candidate.target_branch,
                    }),
                )
                .await;
            outcome.next_work_triggered = true;
            run.outcome = Some(outcome);
            let done = OrchestrationState::Done(Completion::Success);
            self.transition(run, emitter, done, "completion verified").await;
        } else {
            let mut causes: Vec<String> =
                outcome.critical_errors().map(|e| e.message.clone()).collect();
            if causes.is_empty() {
                if let Some(kind) = report.halted_by {
                    causes.push(format!("pipeline halted by {kind}"));
                }
            }
            run.outcome = Some(outcome);
            let message = format!("post-merge completion failed: {}", causes.join("; "));
            self.fail(run, emitter, FailureKind::CompletionFailed, message).await;
        }
    }

    /// Pick up a new head pushed since the last evaluation, so the next
    /// merge attempt pins the commit that was actually evaluated
    async fn refresh_head(&self, run: &mut Run) {
        let limit = self.config.timeouts.call_timeout();
        let pull =
            with_timeout("get_pull_request", limit, self.host.get_pull_request(run.candidate.id))
                .await;
        match pull {
            Ok(pull)
                if pull.state == PullState::Open && pull.head_sha != run.candidate.head_sha =>
            {
                info!(
                    candidate = run.candidate.id,
                    old = %run.candidate.head_sha,
                    new = %pull.head_sha,
                    "Head moved, re-evaluating new head"
                );
                run.candidate.head_sha = pull.head_sha;
            }
            Ok(_) => {}
            Err(e) => warn!(
                candidate = run.candidate.id,
                error = %e,
                "Could not refresh head before re-evaluation"
            ),
        }
    }

    async fn transition(
        &self,
        run: &mut Run,
        emitter: &EventEmitter,
        to: OrchestrationState,
        reason: impl Into<String>,
    ) {
        let record = StateTransitionRecord {
            from: run.state,
            to,
            reason: reason.into(),
            timestamp: self.clock.now(),
            elapsed_ms: run.started.elapsed().as_millis() as u64,
        };

        info!(
            from_state = %record.from,
            to_state = %record.to,
            reason = %record.reason,
            elapsed_ms = record.elapsed_ms,
            "Orchestration state transition"
        );
        emitter
            .emit(
                EventType::StateTransition,
                json!({ "from": record.from, "to": record.to, "reason": &record.reason }),
            )
            .await;

        run.state = to;
        run.transitions.push(record);
    }

    async fn fail(
        &self,
        run: &mut Run,
        emitter: &EventEmitter,
        kind: FailureKind,
        message: String,
    ) {
        warn!(candidate = run.candidate.id, ?kind, %message, "Orchestration failed");
        run.failure = Some(FailureSummary {
            kind,
            message: message.clone(),
        });
        self.transition(run, emitter, OrchestrationState::Done(Completion::Failure), message)
            .await;
    }

    async fn finish(
        &self,
        run: Run,
        emitter: &EventEmitter,
        correlation_id: String,
    ) -> OrchestrationReport {
        let mut outcome = run.outcome.unwrap_or_else(|| {
            let mut outcome = CompletionOutcome::not_merged();
            outcome.merge_commit = run.merge.as_ref().and_then(|m| m.merge_commit.clone());
            outcome
        });
        outcome.timing = CompletionTiming {
            verification_ms: outcome.timing.verification_ms,
            total_ms: run.started.elapsed().as_millis() as u64,
            ..run.timing
        };

        let report = OrchestrationReport {
            candidate_id: run.candidate.id,
            correlation_id,
            state: run.state,
            outcome,
            failure: run.failure,
            verdict: run.verdict,
            merge: run.merge,
            pipeline: run.pipeline,
            transitions: run.transitions,
            merge_invocations: run.merge_invocations,
        };

        orchestration_metrics().record_run_finished(report.is_success());
        emitter
            .emit(
                EventType::OrchestrationCompleted,
                json!({
                    "state": report.state,
                    "success": report.is_success(),
                    "failure": &report.failure,
                    "outcome": &report.outcome,
                    "merge_invocations": report.merge_invocations,
                }),
            )
            .await;
        info!(
            candidate = report.candidate_id,
            state = %report.state,
            total_ms = report.outcome.timing.total_ms,
            "Merge orchestration finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEventSink;
    use crate::external::mocks::{
        approval, passing_check, ready_pull_request, InMemoryGitHost, MockCiProvider, MockDeployer,
        RecordingNotifier,
    };
    use crate::external::{CheckRun, CheckStatus, CollaboratorError, IssueState};
    use crate::fs::StandardFileSystem;
    use crate::merge::timer::SystemClock;
    use std::time::Duration;

    struct Harness {
        host: Arc<InMemoryGitHost>,
        sink: Arc<MemoryEventSink>,
        candidate: MergeCandidate,
    }

    impl Harness {
        fn new(number: u64) -> Self {
            let host = Arc::new(InMemoryGitHost::new());
            let pull = ready_pull_request(number);
            host.add_pull_request(pull.clone());
            host.add_issue(number, IssueState::Open);
            host.set_reviews(number, vec![approval("alice")]);
            host.set_checks(&pull.head_sha, vec![passing_check("build")]);
            Self {
                host,
                sink: Arc::new(MemoryEventSink::new()),
                candidate: MergeCandidate::from_snapshot(&pull),
            }
        }

        fn orchestrator(&self, config: OrchestratorConfig) -> Orchestrator {
            Orchestrator::new(
                config,
                Collaborators {
                    host: self.host.clone(),
                    ci: Arc::new(MockCiProvider::new()),
                    deployer: Arc::new(MockDeployer::new()),
                    notifier: Arc::new(RecordingNotifier::new()),
                    fs: Arc::new(StandardFileSystem),
                    events: self.sink.clone(),
                    clock: Arc::new(SystemClock),
                },
                OrchestratorPaths::default(),
            )
            .unwrap()
        }
    }

    fn fast_config() -> OrchestratorConfig {
        let mut config = OrchestratorConfig::default();
        config.pipeline.jitter = false;
        config.pipeline.base_backoff_ms = 10;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_candidate_reaches_done_success() {
        let harness = Harness::new(50);
        let report = harness
            .orchestrator(fast_config())
            .run(harness.candidate.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.state, OrchestrationState::Done(Completion::Success));
        assert!(report.outcome.next_work_triggered);
        assert!(report.failure.is_none());
        assert_eq!(report.merge_invocations, 1);
        assert_eq!(harness.sink.of_type(EventType::NextWorkRequested).len(), 1);

        let path: Vec<OrchestrationState> = report.transitions.iter().map(|t| t.to).collect();
        assert_eq!(
            path,
            vec![
                OrchestrationState::Merging,
                OrchestrationState::RunningPostActions,
                OrchestrationState::CheckingCompletion,
                OrchestrationState::Done(Completion::Success),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_ci_waits_then_merges() {
        let harness = Harness::new(51);
        let head = harness.candidate.head_sha.clone();
        harness.host.set_checks(
            &head,
            vec![CheckRun {
                name: "build".to_string(),
                status: CheckStatus::InProgress,
                conclusion: None,
                started_at: None,
                completed_at: None,
            }],
        );

        let host = harness.host.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(700)).await;
            host.set_checks(&head, vec![passing_check("build")]);
        });

        let report = harness
            .orchestrator(fast_config())
            .run(harness.candidate.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert!(report.is_success());
        assert!(report.outcome.timing.readiness_polls >= 2);
        assert!(report
            .transitions
            .iter()
            .any(|t| t.to == OrchestrationState::WaitingForReadiness));
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_timeout_ends_in_failure() {
        let harness = Harness::new(52);
        harness.host.set_reviews(52, vec![]);
        let mut config = fast_config();
        config.timeouts.readiness_timeout_secs = 120;

        let report = harness
            .orchestrator(config)
            .run(harness.candidate.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.state, OrchestrationState::Done(Completion::Failure));
        let failure = report.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert!(failure.message.contains("approvals"));
        assert_eq!(harness.host.call_count("merge"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_wait_is_immediate() {
        let harness = Harness::new(53);
        harness.host.set_reviews(53, vec![]);
        let cancel = CancellationToken::new();
        let remote = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            remote.cancel();
        });

        let started = Instant::now();
        let report = harness
            .orchestrator(fast_config())
            .run(harness.candidate.clone(), cancel)
            .await
            .unwrap();

        assert_eq!(report.failure.unwrap().kind, FailureKind::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_retries_after_backoff() {
        let harness = Harness::new(54);
        harness
            .host
            .fail_next("merge", CollaboratorError::Transport("connection reset".to_string()));

        let report = harness
            .orchestrator(fast_config())
            .run(harness.candidate.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(report.merge_invocations, 2);
        assert_eq!(harness.host.merges_performed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_is_terminal() {
        let harness = Harness::new(55);
        harness.host.fail_always(
            "merge",
            CollaboratorError::Api {
                status: 403,
                message: "Resource not accessible by integration".to_string(),
            },
        );

        let report = harness
            .orchestrator(fast_config())
            .run(harness.candidate.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            report.failure.unwrap().kind,
            FailureKind::MergeFailed(ErrorKind::PermissionDenied)
        );
        assert_eq!(report.merge_invocations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_budget_bounds_the_run() {
        let harness = Harness::new(56);
        harness.host.set_reviews(56, vec![]);
        let mut config = fast_config();
        config.timeouts.total_budget_secs = 60;

        let started = Instant::now();
        let report = harness
            .orchestrator(config)
            .run(harness.candidate.clone(), CancellationToken::new())
            .await
            .unwrap();

        let failure = report.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert!(failure.message.contains("total budget"));
        assert!(started.elapsed() <= Duration::from_secs(61));
    }

    #[tokio::test]
    async fn test_second_run_for_same_candidate_is_rejected() {
        let harness = Harness::new(57);
        let orchestrator = harness.orchestrator(fast_config());
        let _held = orchestrator.locks().try_acquire(57).unwrap();

        let result = orchestrator.run(harness.candidate.clone(), CancellationToken::new()).await;
        assert!(matches!(result, Err(OrchestratorError::AlreadyRunning(57))));
    }

    #[test]
    fn test_invalid_config_is_rejected_at_construction() {
        let harness = Harness::new(58);
        let mut config = fast_config();
        config.timeouts.total_budget_secs = 0;

        let result = Orchestrator::new(
            config,
            Collaborators {
                host: harness.host.clone(),
                ci: Arc::new(MockCiProvider::new()),
                deployer: Arc::new(MockDeployer::new()),
                notifier: Arc::new(RecordingNotifier::new()),
                fs: Arc::new(StandardFileSystem),
                events: harness.sink.clone(),
                clock: Arc::new(SystemClock),
            },
            OrchestratorPaths::default(),
        );
        assert!(matches!(result, Err(OrchestratorError::InvalidConfig(_))));
    }
}
