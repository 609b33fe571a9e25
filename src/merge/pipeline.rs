//! Post-merge action pipeline
//!
//! Runs the configured side effects strictly one after another in `order`.
//! Every action has its own retry budget. A critical action that runs out
//! of attempts halts the pipeline and leaves everything after it pending.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::config::{ActionConfig, PipelineConfig};
use super::timer::Clock;
use super::types::{MergeCandidate, MergeOutcome};
use crate::events::{EventEmitter, EventType};
use crate::external::{
    with_timeout, CollaboratorError, DeliveryReceipt, DeploymentHandle, DeploymentRequest, Deployer,
    GitHost, NotificationMessage, Notifier,
};
use crate::fs::FileSystemOperations;
use crate::observability::{orchestration_metrics, OperationTimer};

const BUDGET_EXHAUSTED: &str = "total budget exhausted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    BranchDelete,
    IssueClose,
    DeployTrigger,
    Notify,
    Cleanup,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::BranchDelete => "branch-delete",
            ActionKind::IssueClose => "issue-close",
            ActionKind::DeployTrigger => "deploy-trigger",
            ActionKind::Notify => "notify",
            ActionKind::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Completed,
    Failed,
    Skipped,
}

/// What a completed action did, with enough detail to verify or undo it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum ActionEffect {
    BranchDeleted { branch: String, sha: String },
    /// Another open pull request still builds on the branch
    BranchRetained { branch: String, referenced_by: Vec<u64> },
    BranchAlreadyGone { branch: String },
    IssueClosed { issue: u64, comment_id: Option<u64> },
    DeploymentTriggered { handle: DeploymentHandle },
    Notified { receipts: Vec<DeliveryReceipt>, failed_channels: Vec<String> },
    CleanedUp { path: PathBuf, existed: bool },
    NoOp { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostMergeAction {
    pub kind: ActionKind,
    pub enabled: bool,
    pub order: u32,
    pub critical: bool,
    pub retry_budget: u32,
    pub status: ActionStatus,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub effect: Option<ActionEffect>,
}

impl PostMergeAction {
    pub fn from_config(config: &ActionConfig) -> Self {
        Self {
            kind: config.kind,
            enabled: config.enabled,
            order: config.order,
            critical: config.critical,
            retry_budget: config.retry_budget.max(1),
            status: ActionStatus::Pending,
            attempts: 0,
            started_at: None,
            finished_at: None,
            last_error: None,
            effect: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub actions: Vec<PostMergeAction>,
    /// Critical action whose failure stopped the pipeline
    pub halted_by: Option<ActionKind>,
    pub duration_ms: u64,
}

impl PipelineReport {
    pub fn action(&self, kind: ActionKind) -> Option<&PostMergeAction> {
        self.actions.iter().find(|a| a.kind == kind)
    }

    pub fn status_of(&self, kind: ActionKind) -> Option<ActionStatus> {
        self.action(kind).map(|a| a.status)
    }

    pub fn effect_of(&self, kind: ActionKind) -> Option<&ActionEffect> {
        self.action(kind).and_then(|a| a.effect.as_ref())
    }

    pub fn failed(&self) -> impl Iterator<Item = &PostMergeAction> {
        self.actions.iter().filter(|a| a.status == ActionStatus::Failed)
    }
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
    #[error("No merge commit recorded")]
    NoMergeCommit,
    #[error("Every notification channel failed: {0:?}")]
    AllChannelsFailed(Vec<String>),
    #[error("File system error: {0}")]
    Io(String),
}

/// State carried between attempts of one action
#[derive(Debug, Default)]
struct AttemptState {
    closing_comment: Option<u64>,
}

pub struct ActionPipeline {
    host: Arc<dyn GitHost>,
    deployer: Arc<dyn Deployer>,
    notifier: Arc<dyn Notifier>,
    fs: Arc<dyn FileSystemOperations>,
    clock: Arc<dyn Clock>,
    config: PipelineConfig,
    actor: String,
    call_timeout: Duration,
    artifacts_dir: PathBuf,
}

impl fmt::Debug for ActionPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionPipeline")
            .field("config", &self.config)
            .field("actor", &self.actor)
            .field("artifacts_dir", &self.artifacts_dir)
            .finish()
    }
}

/// Collaborators used by the pipeline and the checkpoint
#[derive(Clone)]
pub struct PipelineDeps {
    pub host: Arc<dyn GitHost>,
    pub deployer: Arc<dyn Deployer>,
    pub notifier: Arc<dyn Notifier>,
    pub fs: Arc<dyn FileSystemOperations>,
    pub clock: Arc<dyn Clock>,
}

impl ActionPipeline {
    pub fn new(
        deps: PipelineDeps,
        config: PipelineConfig,
        actor: impl Into<String>,
        call_timeout: Duration,
        artifacts_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            host: deps.host,
            deployer: deps.deployer,
            notifier: deps.notifier,
            fs: deps.fs,
            clock: deps.clock,
            config,
            actor: actor.into(),
            call_timeout,
            artifacts_dir: artifacts_dir.into(),
        }
    }

    /// Actions in execution order
    pub fn planned_actions(&self) -> Vec<PostMergeAction> {
        let mut actions: Vec<PostMergeAction> =
            self.config.actions.iter().map(PostMergeAction::from_config).collect();
        actions.sort_by_key(|a| (a.order, a.kind));
        actions
    }

    /// Runs every enabled action in order. Retries never sleep past `deadline`,
    /// and actions not yet started when it passes are skipped.
    pub async fn run(
        &self,
        candidate: &MergeCandidate,
        merge: &MergeOutcome,
        events: &EventEmitter,
        deadline: Instant,
    ) -> PipelineReport {
        let timer = OperationTimer::new("post_merge_actions");
        let mut report = PipelineReport {
            actions: self.planned_actions(),
            halted_by: None,
            duration_ms: 0,
        };

        for index in 0..report.actions.len() {
            if report.halted_by.is_some() {
                break;
            }
            let action = &mut report.actions[index];

            if !action.enabled {
                action.status = ActionStatus::Skipped;
                debug!(action = %action.kind, "Action disabled, skipping");
                events
                    .emit(
                        EventType::ActionSkipped,
                        json!({ "action": action.kind, "reason": "disabled" }),
                    )
                    .await;
                continue;
            }
            if Instant::now() >= deadline {
                action.status = ActionStatus::Skipped;
                action.last_error = Some(BUDGET_EXHAUSTED.to_string());
                warn!(action = %action.kind, "Total budget exhausted, skipping action");
                events
                    .emit(
                        EventType::ActionSkipped,
                        json!({ "action": action.kind, "reason": BUDGET_EXHAUSTED }),
                    )
                    .await;
                continue;
            }

            self.run_action(action, candidate, merge, events, deadline).await;

            if action.status == ActionStatus::Failed && action.critical {
                warn!(action = %action.kind, "Critical action failed, halting pipeline");
                report.halted_by = Some(action.kind);
            }
        }

        report.duration_ms = timer.finish();
        report
    }

    async fn run_action(
        &self,
        action: &mut PostMergeAction,
        candidate: &MergeCandidate,
        merge: &MergeOutcome,
        events: &EventEmitter,
        deadline: Instant,
    ) {
        action.started_at = Some(self.clock.now());
        events
            .emit(
                EventType::ActionStarted,
                json!({
                    "action": action.kind,
                    "order": action.order,
                    "critical": action.critical,
                }),
            )
            .await;

        let mut state = AttemptState::default();
        loop {
            action.attempts += 1;
            match self.perform(action.kind, candidate, merge, &mut state).await {
                Ok(effect) => {
                    info!(
                        action = %action.kind,
                        attempts = action.attempts,
                        "Post-merge action completed"
                    );
                    action.status = ActionStatus::Completed;
                    action.finished_at = Some(self.clock.now());
                    events
                        .emit(
                            EventType::ActionCompleted,
                            json!({
                                "action": action.kind,
                                "attempts": action.attempts,
                                "effect": &effect,
                            }),
                        )
                        .await;
                    action.effect = Some(effect);
                    return;
                }
                Err(e) => {
                    warn!(
                        action = %action.kind,
                        attempt = action.attempts,
                        budget = action.retry_budget,
                        error = %e,
                        "Post-merge action attempt failed"
                    );
                    action.last_error = Some(e.to_string());
                    if action.attempts >= action.retry_budget {
                        break;
                    }
                    let resume_at = (Instant::now() + self.backoff(action.attempts)).min(deadline);
                    tokio::time::sleep_until(resume_at).await;
                    if Instant::now() >= deadline {
                        warn!(
                            action = %action.kind,
                            attempts = action.attempts,
                            "Total budget exhausted, abandoning retries"
                        );
                        action.last_error = Some(format!(
                            "{BUDGET_EXHAUSTED} after {} attempts: {}",
                            action.attempts, e
                        ));
                        break;
                    }
                }
            }
        }

        action.status = ActionStatus::Failed;
        action.finished_at = Some(self.clock.now());
        orchestration_metrics().record_action_failure();
        events
            .emit(
                EventType::ActionFailed,
                json!({
                    "action": action.kind,
                    "attempts": action.attempts,
                    "critical": action.critical,
                    "error": action.last_error,
                }),
            )
            .await;
    }

    /// Delay before attempt `attempt + 1`
    pub fn backoff(&self, attempt: u32) -> Duration {
        backoff_delay(
            self.config.base_backoff_ms,
            self.config.max_backoff_ms,
            attempt,
            self.config.jitter,
        )
    }

    async fn perform(
        &self,
        kind: ActionKind,
        candidate: &MergeCandidate,
        merge: &MergeOutcome,
        state: &mut AttemptState,
    ) -> Result<ActionEffect, ActionError> {
        match kind {
            ActionKind::BranchDelete => self.delete_branch(candidate).await,
            ActionKind::IssueClose => self.close_issue(candidate, merge, state).await,
            ActionKind::DeployTrigger => self.trigger_deployment(candidate, merge).await,
            ActionKind::Notify => self.notify(candidate, merge).await,
            ActionKind::Cleanup => self.cleanup(candidate).await,
        }
    }

    async fn delete_branch(&self, candidate: &MergeCandidate) -> Result<ActionEffect, ActionError> {
        let branch = candidate.source_branch.clone();
        let limit = self.call_timeout;

        let open =
            with_timeout("list_open_pull_requests", limit, self.host.list_open_pull_requests())
                .await?;
        let referenced_by: Vec<u64> = open
            .iter()
            .filter(|p| p.number != candidate.id && (p.head_ref == branch || p.base_ref == branch))
            .map(|p| p.number)
            .collect();
        if !referenced_by.is_empty() {
            info!(%branch, ?referenced_by, "Branch still in use, keeping it");
            return Ok(ActionEffect::BranchRetained { branch, referenced_by });
        }

        if !with_timeout("branch_exists", limit, self.host.branch_exists(&branch)).await? {
            return Ok(ActionEffect::BranchAlreadyGone { branch });
        }

        match with_timeout("delete_branch", limit, self.host.delete_branch(&branch)).await {
            Ok(()) => Ok(ActionEffect::BranchDeleted {
                branch,
                sha: candidate.head_sha.clone(),
            }),
            Err(e) if e.is_not_found() => Ok(ActionEffect::BranchAlreadyGone { branch }),
            Err(e) => Err(e.into()),
        }
    }

    async fn close_issue(
        &self,
        candidate: &MergeCandidate,
        merge: &MergeOutcome,
        state: &mut AttemptState,
    ) -> Result<ActionEffect, ActionError> {
        let Some(issue) = candidate.work_item else {
            return Ok(ActionEffect::NoOp {
                reason: "no linked issue".to_string(),
            });
        };
        let limit = self.call_timeout;

        if state.closing_comment.is_none() {
            let body = closing_comment(candidate, merge, &self.actor);
            let id = with_timeout("add_comment", limit, self.host.add_comment(issue, &body)).await?;
            state.closing_comment = Some(id);
        }

        with_timeout("close_issue", limit, self.host.close_issue(issue)).await?;
        Ok(ActionEffect::IssueClosed {
            issue,
            comment_id: state.closing_comment,
        })
    }

    async fn trigger_deployment(
        &self,
        candidate: &MergeCandidate,
        merge: &MergeOutcome,
    ) -> Result<ActionEffect, ActionError> {
        let commit_sha = merge.merge_commit.clone().ok_or(ActionError::NoMergeCommit)?;
        let request = DeploymentRequest {
            commit_sha,
            environment: self.config.deploy_environment.clone(),
            description: format!("Deploy #{} ({})", candidate.id, candidate.title),
        };
        let handle =
            with_timeout("trigger_deployment", self.call_timeout, self.deployer.trigger(&request))
                .await?;
        Ok(ActionEffect::DeploymentTriggered { handle })
    }

    async fn notify(
        &self,
        candidate: &MergeCandidate,
        merge: &MergeOutcome,
    ) -> Result<ActionEffect, ActionError> {
        if self.config.notify_channels.is_empty() {
            return Ok(ActionEffect::NoOp {
                reason: "no notification channels configured".to_string(),
            });
        }

        let message = NotificationMessage {
            candidate_id: candidate.id,
            subject: format!("Merged #{}: {}", candidate.id, candidate.title),
            body: format!(
                "{} was merged into {} as {} ({}).",
                candidate.source_branch,
                candidate.target_branch,
                merge.merge_commit.as_deref().unwrap_or("unknown commit"),
                merge.strategy
            ),
        };

        let mut receipts = Vec::new();
        let mut failed_channels = Vec::new();
        for channel in &self.config.notify_channels {
            let sent =
                with_timeout("notify", self.call_timeout, self.notifier.send(channel, &message))
                    .await;
            match sent {
                Ok(receipt) => receipts.push(receipt),
                Err(e) => {
                    warn!(%channel, error = %e, "Notification channel failed");
                    failed_channels.push(channel.clone());
                }
            }
        }

        if receipts.is_empty() {
            return Err(ActionError::AllChannelsFailed(failed_channels));
        }
        Ok(ActionEffect::Notified {
            receipts,
            failed_channels,
        })
    }

    async fn cleanup(&self, candidate: &MergeCandidate) -> Result<ActionEffect, ActionError> {
        let path = self.artifacts_dir.join(format!("candidate-{}", candidate.id));
        let path_str = path.to_string_lossy().to_string();

        if !self.fs.exists(&path_str) {
            return Ok(ActionEffect::CleanedUp { path, existed: false });
        }
        self.fs
            .remove_dir_all(&path_str)
            .await
            .map_err(|e| ActionError::Io(e.to_string()))?;
        Ok(ActionEffect::CleanedUp { path, existed: true })
    }
}

/// `base * 2^(attempt - 1)` capped at `max`, with up to a quarter of extra
/// random delay when `jitter` is set
pub fn backoff_delay(base_ms: u64, max_ms: u64, attempt: u32, jitter: bool) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    let mut delay = base_ms.saturating_mul(1u64 << exponent).min(max_ms);
    if jitter && delay > 0 {
        delay = delay
            .saturating_add(rand::rng().random_range(0..=delay / 4))
            .min(max_ms);
    }
    Duration::from_millis(delay)
}

pub fn closing_comment(candidate: &MergeCandidate, merge: &MergeOutcome, actor: &str) -> String {
    let commit = merge.merge_commit.as_deref().unwrap_or("unknown");
    let stats = &merge.stats;
    format!(
        "Completed by #{id}, merged into `{target}` as {commit}.\n\n\
         - Strategy: {strategy}\n\
         - Files changed: {files} (+{additions} / -{deletions})\n\
         - Commits: {commits}\n\
         - Merged by: {actor}",
        id = candidate.id,
        target = candidate.target_branch,
        strategy = merge.strategy,
        files = stats.files_changed,
        additions = stats.additions,
        deletions = stats.deletions,
        commits = stats.commits,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEventSink;
    use crate::external::mocks::{
        ready_pull_request, InMemoryGitHost, MockDeployer, RecordingNotifier,
    };
    use crate::external::{IssueState, MergeStrategy, OpenPullRef};
    use crate::fs::{MockFileSystemOperations, StandardFileSystem};
    use crate::merge::timer::SystemClock;

    struct Harness {
        host: Arc<InMemoryGitHost>,
        deployer: Arc<MockDeployer>,
        notifier: Arc<RecordingNotifier>,
        sink: Arc<MemoryEventSink>,
        candidate: MergeCandidate,
        merge: MergeOutcome,
    }

    impl Harness {
        fn new() -> Self {
            let host = Arc::new(InMemoryGitHost::new());
            let pull = ready_pull_request(30);
            host.add_pull_request(pull.clone());
            host.add_issue(30, IssueState::Open);
            let candidate = MergeCandidate::from_snapshot(&pull);
            let merge = MergeOutcome {
                success: true,
                merge_commit: Some("m3rg3".to_string()),
                strategy: MergeStrategy::Squash,
                stats: pull.stats,
                errors: Vec::new(),
                adopted: false,
                started_at: Utc::now(),
                duration_ms: 5,
            };
            Self {
                host,
                deployer: Arc::new(MockDeployer::new()),
                notifier: Arc::new(RecordingNotifier::new()),
                sink: Arc::new(MemoryEventSink::new()),
                candidate,
                merge,
            }
        }

        fn pipeline(
            &self,
            config: PipelineConfig,
            fs: Arc<dyn FileSystemOperations>,
        ) -> ActionPipeline {
            ActionPipeline::new(
                PipelineDeps {
                    host: self.host.clone(),
                    deployer: self.deployer.clone(),
                    notifier: self.notifier.clone(),
                    fs,
                    clock: Arc::new(SystemClock),
                },
                config,
                "release-bot",
                Duration::from_secs(5),
                "/nonexistent/artifacts",
            )
        }

        fn emitter(&self) -> EventEmitter {
            EventEmitter::new(
                self.sink.clone(),
                Arc::new(SystemClock),
                "corr",
                self.candidate.id,
                self.candidate.work_item,
            )
        }

        async fn run(&self, config: PipelineConfig) -> PipelineReport {
            self.run_until(config, Instant::now() + Duration::from_secs(3_600))
                .await
        }

        async fn run_until(&self, config: PipelineConfig, deadline: Instant) -> PipelineReport {
            self.pipeline(config, Arc::new(StandardFileSystem))
                .run(&self.candidate, &self.merge, &self.emitter(), deadline)
                .await
        }
    }

    fn config(actions: Vec<ActionConfig>) -> PipelineConfig {
        PipelineConfig {
            actions,
            base_backoff_ms: 100,
            max_backoff_ms: 1_000,
            jitter: false,
            notify_channels: vec!["ops".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(100, 1_000, 1, false), Duration::from_millis(100));
        assert_eq!(backoff_delay(100, 1_000, 2, false), Duration::from_millis(200));
        assert_eq!(backoff_delay(100, 1_000, 3, false), Duration::from_millis(400));
        assert_eq!(backoff_delay(100, 1_000, 10, false), Duration::from_millis(1_000));

        let jittered = backoff_delay(400, 10_000, 1, true);
        assert!(jittered >= Duration::from_millis(400) && jittered <= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_actions_run_in_order() {
        let harness = Harness::new();
        let report = harness.run(config(PipelineConfig::default().actions)).await;

        let statuses: Vec<(ActionKind, ActionStatus)> =
            report.actions.iter().map(|a| (a.kind, a.status)).collect();
        assert_eq!(
            statuses,
            vec![
                (ActionKind::BranchDelete, ActionStatus::Completed),
                (ActionKind::IssueClose, ActionStatus::Completed),
                (ActionKind::DeployTrigger, ActionStatus::Skipped),
                (ActionKind::Notify, ActionStatus::Completed),
                (ActionKind::Cleanup, ActionStatus::Completed),
            ]
        );
        assert!(report.halted_by.is_none());
        assert!(!harness.host.has_branch("feature/30"));
        assert_eq!(harness.host.issue_state(30), Some(IssueState::Closed));
        assert_eq!(harness.notifier.sent().len(), 1);

        let started: Vec<_> = harness
            .sink
            .of_type(EventType::ActionStarted)
            .iter()
            .map(|e| e.payload["action"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(started, vec!["branch-delete", "issue-close", "notify", "cleanup"]);
        assert_eq!(harness.sink.of_type(EventType::ActionSkipped).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_failure_halts_remaining_actions() {
        let harness = Harness::new();
        let forbidden = CollaboratorError::Api {
            status: 403,
            message: "forbidden".to_string(),
        };
        harness.host.fail_always("close_issue", forbidden);

        let report = harness.run(config(PipelineConfig::default().actions)).await;

        assert_eq!(report.halted_by, Some(ActionKind::IssueClose));
        assert_eq!(report.status_of(ActionKind::BranchDelete), Some(ActionStatus::Completed));
        let close = report.action(ActionKind::IssueClose).unwrap();
        assert_eq!(close.status, ActionStatus::Failed);
        assert_eq!(close.attempts, 3);
        assert_eq!(report.status_of(ActionKind::DeployTrigger), Some(ActionStatus::Pending));
        assert_eq!(report.status_of(ActionKind::Notify), Some(ActionStatus::Pending));
        assert_eq!(report.status_of(ActionKind::Cleanup), Some(ActionStatus::Pending));
        assert!(harness.notifier.sent().is_empty());
        assert!(!harness.host.has_branch("feature/30"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_critical_failure_continues() {
        let harness = Harness::new();
        harness
            .host
            .fail_always("delete_branch", CollaboratorError::Transport("reset".to_string()));

        let report = harness.run(config(PipelineConfig::default().actions)).await;

        let delete = report.action(ActionKind::BranchDelete).unwrap();
        assert_eq!(delete.status, ActionStatus::Failed);
        assert_eq!(delete.attempts, 3);
        assert!(report.halted_by.is_none());
        assert_eq!(report.status_of(ActionKind::IssueClose), Some(ActionStatus::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_issue_close_retry_does_not_repost_comment() {
        let harness = Harness::new();
        harness
            .host
            .fail_next("close_issue", CollaboratorError::Transport("reset".to_string()));

        let report = harness
            .run(config(vec![ActionConfig::new(ActionKind::IssueClose, 1, true, 3)]))
            .await;

        let close = report.action(ActionKind::IssueClose).unwrap();
        assert_eq!(close.status, ActionStatus::Completed);
        assert_eq!(close.attempts, 2);
        assert_eq!(harness.host.comments_on(30).len(), 1);
        assert!(harness.host.comments_on(30)[0].contains("Merged by: release-bot"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_backoff_stops_at_deadline() {
        let harness = Harness::new();
        harness
            .host
            .fail_always("close_issue", CollaboratorError::Transport("reset".to_string()));
        let mut cfg = config(vec![
            ActionConfig::new(ActionKind::IssueClose, 1, true, 3),
            ActionConfig::new(ActionKind::Cleanup, 2, false, 1),
        ]);
        cfg.base_backoff_ms = 600_000;
        cfg.max_backoff_ms = 600_000;

        let started = Instant::now();
        let report = harness
            .run_until(cfg, started + Duration::from_secs(60))
            .await;

        assert!(started.elapsed() < Duration::from_secs(61));
        let close = report.action(ActionKind::IssueClose).unwrap();
        assert_eq!(close.status, ActionStatus::Failed);
        assert_eq!(close.attempts, 1);
        assert!(close.last_error.as_deref().unwrap().contains("total budget exhausted"));
        assert_eq!(report.halted_by, Some(ActionKind::IssueClose));
    }

    #[tokio::test(start_paused = true)]
    async fn test_actions_after_deadline_are_skipped() {
        let harness = Harness::new();
        let started = Instant::now();
        let report = harness
            .run_until(
                config(vec![ActionConfig::new(ActionKind::Cleanup, 1, false, 1)]),
                started,
            )
            .await;

        let cleanup = report.action(ActionKind::Cleanup).unwrap();
        assert_eq!(cleanup.status, ActionStatus::Skipped);
        assert_eq!(cleanup.attempts, 0);
        assert_eq!(harness.sink.of_type(EventType::ActionSkipped).len(), 1);
    }

    #[tokio::test]
    async fn test_branch_referenced_by_another_pull_is_retained() {
        let harness = Harness::new();
        let mut stacked = ready_pull_request(31);
        stacked.base_ref = "feature/30".to_string();
        harness.host.add_pull_request(stacked);

        let report = harness
            .run(config(vec![ActionConfig::new(ActionKind::BranchDelete, 1, false, 1)]))
            .await;

        assert_eq!(
            report.effect_of(ActionKind::BranchDelete),
            Some(&ActionEffect::BranchRetained {
                branch: "feature/30".to_string(),
                referenced_by: vec![31],
            })
        );
        assert!(harness.host.has_branch("feature/30"));
    }

    #[tokio::test]
    async fn test_branch_listing_ignores_the_candidate_itself() {
        let harness = Harness::new();
        let open = harness.host.list_open_pull_requests().await.unwrap();
        assert_eq!(
            open,
            vec![OpenPullRef {
                number: 30,
                head_ref: "feature/30".to_string(),
                base_ref: "main".to_string()
            }]
        );

        let report = harness
            .run(config(vec![ActionConfig::new(ActionKind::BranchDelete, 1, false, 1)]))
            .await;
        assert!(matches!(
            report.effect_of(ActionKind::BranchDelete),
            Some(ActionEffect::BranchDeleted { .. })
        ));
    }

    #[tokio::test]
    async fn test_issue_close_without_work_item_is_noop() {
        let mut harness = Harness::new();
        harness.candidate.work_item = None;

        let report = harness
            .run(config(vec![ActionConfig::new(ActionKind::IssueClose, 1, true, 1)]))
            .await;
        assert!(matches!(
            report.effect_of(ActionKind::IssueClose),
            Some(ActionEffect::NoOp { .. })
        ));
        assert_eq!(harness.host.call_count("add_comment"), 0);
    }

    #[tokio::test]
    async fn test_deploy_trigger_uses_merge_commit() {
        let harness = Harness::new();
        let report = harness
            .run(config(vec![ActionConfig::new(ActionKind::DeployTrigger, 1, true, 1)]))
            .await;

        assert_eq!(report.status_of(ActionKind::DeployTrigger), Some(ActionStatus::Completed));
        let triggered = harness.deployer.triggered();
        assert_eq!(triggered[0].commit_sha, "m3rg3");
        assert_eq!(triggered[0].environment, "production");
    }

    #[tokio::test]
    async fn test_notify_fails_only_when_every_channel_fails() {
        let harness = Harness::new();
        harness.notifier.break_channel("ops");
        let mut cfg = config(vec![ActionConfig::new(ActionKind::Notify, 1, false, 1)]);
        cfg.notify_channels = vec!["ops".to_string(), "team".to_string()];

        let report = harness.run(cfg.clone()).await;
        match report.effect_of(ActionKind::Notify) {
            Some(ActionEffect::Notified { receipts, failed_channels }) => {
                assert_eq!(receipts.len(), 1);
                assert_eq!(failed_channels, &vec!["ops".to_string()]);
            }
            other => panic!("unexpected effect {other:?}"),
        }

        harness.notifier.break_channel("team");
        let report = harness.run(cfg).await;
        assert_eq!(report.status_of(ActionKind::Notify), Some(ActionStatus::Failed));
    }

    #[tokio::test]
    async fn test_cleanup_removes_candidate_artifacts() {
        let harness = Harness::new();
        let mut fs = MockFileSystemOperations::new();
        fs.expect_exists()
            .withf(|path| path.ends_with("candidate-30"))
            .return_const(true);
        fs.expect_remove_dir_all().times(1).returning(|_| Ok(()));

        let report = harness
            .pipeline(
                config(vec![ActionConfig::new(ActionKind::Cleanup, 1, false, 1)]),
                Arc::new(fs),
            )
            .run(
                &harness.candidate,
                &harness.merge,
                &harness.emitter(),
                Instant::now() + Duration::from_secs(60),
            )
            .await;

        assert!(matches!(
            report.effect_of(ActionKind::Cleanup),
            Some(ActionEffect::CleanedUp { existed: true, .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_artifacts_are_success() {
        let harness = Harness::new();
        let report = harness
            .run(config(vec![ActionConfig::new(ActionKind::Cleanup, 1, false, 1)]))
            .await;
        assert!(matches!(
            report.effect_of(ActionKind::Cleanup),
            Some(ActionEffect::CleanedUp { existed: false, .. })
        ));
    }
}
