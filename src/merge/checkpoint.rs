//! Completion checkpoint
//!
//! After the pipeline reports, the checkpoint goes back to each collaborator
//! and checks that the side effect is really there. It decides the final
//! outcome and, when a critical aspect failed, compensates what can be
//! compensated. It never returns an error: every problem ends up in
//! [`CompletionOutcome::errors`].

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::config::CheckpointConfig;
use super::pipeline::{ActionEffect, ActionKind, ActionStatus, PipelineDeps, PipelineReport};
use super::types::{MergeCandidate, MergeOutcome};
use crate::events::{EventEmitter, EventType};
use crate::external::{
    with_timeout, CollaboratorError, DeliveryStatus, DeploymentState, Deployer, GitHost, IssueState,
    Notifier,
};
use crate::observability::{orchestration_metrics, OperationTimer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompletionErrorKind {
    ActionFailed,
    VerificationFailed,
    RollbackFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionError {
    pub aspect: ActionKind,
    pub kind: CompletionErrorKind,
    pub critical: bool,
    pub retryable: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackStep {
    pub action: ActionKind,
    pub description: String,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionTiming {
    pub evaluation_ms: u64,
    pub merge_ms: u64,
    pub pipeline_ms: u64,
    pub verification_ms: u64,
    pub total_ms: u64,
    pub readiness_polls: u32,
}

/// Final record of one orchestration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionOutcome {
    pub success: bool,
    pub issue_closed: bool,
    pub branch_cleaned: bool,
    pub deployment_triggered: bool,
    pub notifications_sent: bool,
    pub errors: Vec<CompletionError>,
    pub rollback: Vec<RollbackStep>,
    pub timing: CompletionTiming,
    pub next_work_triggered: bool,
    pub merge_commit: Option<String>,
}

impl CompletionOutcome {
    /// Outcome for a run that never got past merging
    pub fn not_merged() -> Self {
        Self::default()
    }

    pub fn critical_errors(&self) -> impl Iterator<Item = &CompletionError> {
        self.errors.iter().filter(|e| e.critical)
    }
}

pub struct CompletionCheckpoint {
    host: Arc<dyn GitHost>,
    deployer: Arc<dyn Deployer>,
    notifier: Arc<dyn Notifier>,
    config: CheckpointConfig,
    call_timeout: Duration,
}

impl std::fmt::Debug for CompletionCheckpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionCheckpoint")
            .field("config", &self.config)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl CompletionCheckpoint {
    pub fn new(deps: &PipelineDeps, config: CheckpointConfig, call_timeout: Duration) -> Self {
        Self {
            host: deps.host.clone(),
            deployer: deps.deployer.clone(),
            notifier: deps.notifier.clone(),
            config,
            call_timeout,
        }
    }

    pub async fn verify(
        &self,
        candidate: &MergeCandidate,
        merge: &MergeOutcome,
        report: &PipelineReport,
        events: &EventEmitter,
    ) -> CompletionOutcome {
        let timer = OperationTimer::new("completion_check");
        let mut outcome = CompletionOutcome {
            merge_commit: merge.merge_commit.clone(),
            ..Default::default()
        };
        // Effects the fresh reads showed are not in place, nothing to undo
        let mut absent: HashSet<ActionKind> = HashSet::new();

        for action in report.failed() {
            outcome.errors.push(CompletionError {
                aspect: action.kind,
                kind: CompletionErrorKind::ActionFailed,
                critical: action.critical,
                retryable: true,
                message: format!(
                    "{} failed after {} attempt(s): {}",
                    action.kind,
                    action.attempts,
                    action.last_error.as_deref().unwrap_or("unknown error")
                ),
            });
        }

        outcome.issue_closed = self.check_issue(report, &mut outcome.errors, &mut absent).await;
        outcome.branch_cleaned = self.check_branch(report, &mut outcome.errors, &mut absent).await;
        outcome.deployment_triggered = self
            .check_deployment(report, &mut outcome.errors, &mut absent)
            .await;
        outcome.notifications_sent = self.check_notifications(report, &mut outcome.errors).await;

        outcome.success = report.halted_by.is_none() && outcome.critical_errors().next().is_none();

        events
            .emit(
                EventType::VerificationCompleted,
                json!({
                    "success": outcome.success,
                    "issue_closed": outcome.issue_closed,
                    "branch_cleaned": outcome.branch_cleaned,
                    "deployment_triggered": outcome.deployment_triggered,
                    "notifications_sent": outcome.notifications_sent,
                    "errors": &outcome.errors,
                }),
            )
            .await;

        if !outcome.success && self.config.rollback_on_failure {
            self.roll_back(candidate, report, &absent, &mut outcome, events).await;
        }

        outcome.timing.verification_ms = timer.finish();
        info!(
            candidate = candidate.id,
            success = outcome.success,
            errors = outcome.errors.len(),
            rollback_steps = outcome.rollback.len(),
            "Completion checkpoint finished"
        );
        outcome
    }

    fn is_critical(report: &PipelineReport, kind: ActionKind) -> bool {
        report.action(kind).map(|a| a.critical).unwrap_or(false)
    }

    fn verification_error(
        report: &PipelineReport,
        kind: ActionKind,
        message: String,
        retryable: bool,
    ) -> CompletionError {
        CompletionError {
            aspect: kind,
            kind: CompletionErrorKind::VerificationFailed,
            critical: Self::is_critical(report, kind),
            retryable,
            message,
        }
    }

    async fn check_issue(
        &self,
        report: &PipelineReport,
        errors: &mut Vec<CompletionError>,
        absent: &mut HashSet<ActionKind>,
    ) -> bool {
        let kind = ActionKind::IssueClose;
        let Some(ActionEffect::IssueClosed { issue, .. }) = completed_effect(report, kind) else {
            return false;
        };
        if !self.config.verify_issue_closure {
            return true;
        }

        let state = with_timeout(
            "get_issue_state",
            self.call_timeout,
            self.host.get_issue_state(*issue),
        )
        .await;
        match state {
            Ok(IssueState::Closed) => true,
            Ok(IssueState::Open) => {
                absent.insert(kind);
                errors.push(Self::verification_error(
                    report,
                    kind,
                    format!("issue #{issue} is still open"),
                    true,
                ));
                false
            }
            Err(e) => {
                errors.push(Self::verification_error(
                    report,
                    kind,
                    format!("could not read issue #{issue}: {e}"),
                    true,
                ));
                false
            }
        }
    }

    async fn check_branch(
        &self,
        report: &PipelineReport,
        errors: &mut Vec<CompletionError>,
        absent: &mut HashSet<ActionKind>,
    ) -> bool {
        let kind = ActionKind::BranchDelete;
        let branch = match completed_effect(report, kind) {
            Some(ActionEffect::BranchDeleted { branch, .. }) => branch,
            Some(ActionEffect::BranchAlreadyGone { .. }) => return true,
            _ => return false,
        };
        if !self.config.verify_branch_cleanup {
            return true;
        }

        let exists =
            with_timeout("branch_exists", self.call_timeout, self.host.branch_exists(branch)).await;
        match exists {
            Ok(false) => true,
            Ok(true) => {
                absent.insert(kind);
                errors.push(Self::verification_error(
                    report,
                    kind,
                    format!("branch '{branch}' still exists"),
                    true,
                ));
                false
            }
            Err(e) => {
                errors.push(Self::verification_error(
                    report,
                    kind,
                    format!("could not read branch '{branch}': {e}"),
                    true,
                ));
                false
            }
        }
    }

    async fn check_deployment(
        &self,
        report: &PipelineReport,
        errors: &mut Vec<CompletionError>,
        absent: &mut HashSet<ActionKind>,
    ) -> bool {
        let kind = ActionKind::DeployTrigger;
        let Some(ActionEffect::DeploymentTriggered { handle }) = completed_effect(report, kind)
        else {
            return false;
        };
        if !self.config.verify_deployment {
            return true;
        }

        let state = with_timeout(
            "deployment_status",
            self.call_timeout,
            self.deployer.status(handle),
        )
        .await;
        match state {
            Ok(DeploymentState::Failed | DeploymentState::Inactive) => {
                absent.insert(kind);
                errors.push(Self::verification_error(
                    report,
                    kind,
                    format!("deployment {} to {} did not take", handle.id, handle.environment),
                    false,
                ));
                false
            }
            Ok(DeploymentState::Succeeded) => true,
            Ok(state) if self.config.require_deployment_success => {
                errors.push(Self::verification_error(
                    report,
                    kind,
                    format!("deployment {} has not succeeded yet ({state:?})", handle.id),
                    true,
                ));
                false
            }
            Ok(_) => true,
            Err(e) => {
                errors.push(Self::verification_error(
                    report,
                    kind,
                    format!("could not read deployment {}: {e}", handle.id),
                    true,
                ));
                false
            }
        }
    }

    async fn check_notifications(
        &self,
        report: &PipelineReport,
        errors: &mut Vec<CompletionError>,
    ) -> bool {
        let kind = ActionKind::Notify;
        let Some(ActionEffect::Notified { receipts, .. }) = completed_effect(report, kind) else {
            return false;
        };
        if !self.config.verify_notifications {
            return !receipts.is_empty();
        }

        let mut problems = Vec::new();
        for receipt in receipts {
            match with_timeout(
                "delivery_status",
                self.call_timeout,
                self.notifier.delivery_status(receipt),
            )
            .await
            {
                Ok(DeliveryStatus::Delivered | DeliveryStatus::Unverifiable) => return true,
                Ok(DeliveryStatus::Failed) => {
                    problems.push(format!("{}: not delivered", receipt.channel))
                }
                Err(e) => problems.push(format!("{}: {e}", receipt.channel)),
            }
        }

        errors.push(Self::verification_error(
            report,
            kind,
            format!("no notification confirmed ({})", problems.join(", ")),
            true,
        ));
        false
    }

    async fn roll_back(
        &self,
        candidate: &MergeCandidate,
        report: &PipelineReport,
        absent: &HashSet<ActionKind>,
        outcome: &mut CompletionOutcome,
        events: &EventEmitter,
    ) {
        warn!(candidate = candidate.id, "Completion failed, rolling back post-merge effects");
        orchestration_metrics().record_rollback();
        let reason = outcome
            .critical_errors()
            .map(|e| e.message.clone())
            .collect::<Vec<_>>()
            .join("; ");

        for action in report.actions.iter().rev() {
            if action.status != ActionStatus::Completed || absent.contains(&action.kind) {
                continue;
            }
            let Some(effect) = &action.effect else { continue };

            let (description, result) = match effect {
                ActionEffect::IssueClosed { issue, .. } => {
                    let result = self.reopen_issue(*issue, candidate, &reason).await;
                    if result.is_ok() {
                        outcome.issue_closed = false;
                    }
                    (format!("reopen issue #{issue}"), result)
                }
                ActionEffect::BranchDeleted { branch, sha } => {
                    let result = with_timeout(
                        "create_branch",
                        self.call_timeout,
                        self.host.create_branch(branch, sha),
                    )
                    .await;
                    if result.is_ok() {
                        outcome.branch_cleaned = false;
                    }
                    (format!("re-create branch '{branch}' at {sha}"), result)
                }
                ActionEffect::DeploymentTriggered { handle } => {
                    let result = with_timeout(
                        "deactivate_deployment",
                        self.call_timeout,
                        self.deployer.deactivate(handle, &reason),
                    )
                    .await;
                    if result.is_ok() {
                        outcome.deployment_triggered = false;
                    }
                    (format!("deactivate deployment {}", handle.id), result)
                }
                _ => continue,
            };

            let step = RollbackStep {
                action: action.kind,
                description,
                success: result.is_ok(),
                error: result.as_ref().err().map(|e| e.to_string()),
            };
            match &result {
                Ok(()) => {
                    info!(action = %action.kind, step = %step.description, "Rollback step done")
                }
                Err(e) => {
                    warn!(
                        action = %action.kind,
                        step = %step.description,
                        error = %e,
                        "Rollback step failed"
                    );
                    outcome.errors.push(CompletionError {
                        aspect: action.kind,
                        kind: CompletionErrorKind::RollbackFailed,
                        critical: true,
                        retryable: true,
                        message: format!("could not {}: {e}", step.description),
                    });
                }
            }
            events
                .emit(EventType::RollbackPerformed, json!({ "step": &step }))
                .await;
            outcome.rollback.push(step);
        }
    }

    async fn reopen_issue(
        &self,
        issue: u64,
        candidate: &MergeCandidate,
        reason: &str,
    ) -> Result<(), CollaboratorError> {
        with_timeout("reopen_issue", self.call_timeout, self.host.reopen_issue(issue)).await?;
        let body = format!(
            "Reopened: post-merge completion for #{} did not finish. {}",
            candidate.id, reason
        );
        with_timeout("add_comment", self.call_timeout, self.host.add_comment(issue, &body)).await?;
        Ok(())
    }
}

fn completed_effect(report: &PipelineReport, kind: ActionKind) -> Option<&ActionEffect> {
    report
        .action(kind)
        .filter(|a| a.status == ActionStatus::Completed)
        .and_then(|a| a.effect.as_ref())
}
