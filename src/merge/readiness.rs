//! Readiness evaluation
//!
//! Reads reviews, checks, the pull request itself, branch protection and CI
//! history concurrently, turns each into a [`Requirement`], and folds them
//! into a [`ReadinessVerdict`]. Nothing is cached between evaluations and
//! nothing is written.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::config::{OrchestratorConfig, RequirementsConfig};
use super::timer::Clock;
use super::types::{
    MergeCandidate, ReadinessVerdict, Requirement, RequirementKind, RequirementStatus,
};
use crate::external::{
    with_timeout, BranchProtection, CheckConclusion, CheckRun, CheckStatus, CiProvider,
    CollaboratorError, GitHost, MergeStrategy, PipelineState, PipelineStatus, PullRequestSnapshot,
    PullState, Review, ReviewState,
};

pub struct ReadinessEvaluator {
    host: Arc<dyn GitHost>,
    ci: Arc<dyn CiProvider>,
    clock: Arc<dyn Clock>,
    rules: RequirementsConfig,
    strategy: MergeStrategy,
    call_timeout: Duration,
    title_pattern: Option<Regex>,
}

impl std::fmt::Debug for ReadinessEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessEvaluator")
            .field("rules", &self.rules)
            .field("strategy", &self.strategy)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl ReadinessEvaluator {
    pub fn new(
        host: Arc<dyn GitHost>,
        ci: Arc<dyn CiProvider>,
        clock: Arc<dyn Clock>,
        config: &OrchestratorConfig,
    ) -> Self {
        let title_pattern = config
            .requirements
            .title_pattern
            .as_deref()
            .and_then(|p| Regex::new(p).ok());

        Self {
            host,
            ci,
            clock,
            rules: config.requirements.clone(),
            strategy: config.strategy,
            call_timeout: config.timeouts.call_timeout(),
            title_pattern,
        }
    }

    pub async fn evaluate(&self, candidate: &MergeCandidate) -> ReadinessVerdict {
        let limit = self.call_timeout;
        let (reviews, checks, pull, protection, typical) = tokio::join!(
            with_timeout("get_reviews", limit, self.host.get_reviews(candidate.id)),
            with_timeout("get_checks", limit, self.host.get_checks(&candidate.head_sha)),
            with_timeout("get_pull_request", limit, self.host.get_pull_request(candidate.id)),
            with_timeout(
                "get_branch_protection",
                limit,
                self.host.get_branch_protection(&candidate.target_branch)
            ),
            with_timeout(
                "typical_duration",
                limit,
                self.ci.typical_duration(&candidate.target_branch)
            ),
        );

        let now = self.clock.now();
        let typical = typical.unwrap_or_else(|e| {
            debug!(error = %e, "No CI history, using configured estimate");
            None
        });
        let ci_estimate = |checks: &[CheckRun]| {
            ci_wait_estimate(
                checks,
                typical,
                Duration::from_secs(self.rules.ci_wait_estimate_secs),
                now,
            )
        };

        let approvals = match &reviews {
            Ok(reviews) => approvals_requirement(reviews, self.rules.required_approvals, now),
            Err(e) => Requirement::unknown(RequirementKind::Approvals, e, now),
        };

        let ci = match &checks {
            Ok(checks) if !checks.is_empty() => {
                ci_requirement(checks, now).with_estimate_if_pending(ci_estimate(checks))
            }
            Ok(checks) => self
                .pipeline_requirement(candidate, ci_estimate(checks), now)
                .await
                .unwrap_or_else(|| ci_requirement(checks, now)),
            Err(e) => self
                .pipeline_requirement(candidate, ci_estimate(&[]), now)
                .await
                .unwrap_or_else(|| Requirement::unknown(RequirementKind::CiChecks, e, now)),
        };

        let conflicts = match &pull {
            Ok(pull) => conflicts_requirement(
                pull,
                Duration::from_secs(self.rules.mergeability_wait_secs),
                now,
            ),
            Err(e) => Requirement::unknown(RequirementKind::NoConflicts, e, now),
        };

        let protection = match (&protection, &reviews, &checks) {
            (Ok(protection), Ok(reviews), Ok(checks)) => protection_requirement(
                protection.as_ref(),
                reviews,
                checks,
                self.strategy,
                ci_estimate(checks),
                now,
            ),
            (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => {
                Requirement::unknown(RequirementKind::BranchProtection, e, now)
            }
        };

        let policy = match &pull {
            Ok(pull) => {
                policy_requirement(pull, candidate, &self.rules, self.title_pattern.as_ref(), now)
            }
            Err(e) => Requirement::unknown(RequirementKind::PolicyCompliance, e, now),
        };

        let requirements = [approvals, ci, conflicts, protection, policy]
            .into_iter()
            .map(|mut r| {
                r.mandatory = self.rules.is_mandatory(r.kind);
                r
            })
            .collect();

        let verdict = ReadinessVerdict::from_requirements(requirements, now);
        info!(
            candidate = candidate.id,
            can_merge = verdict.can_merge,
            blocking = ?verdict.blocking_codes(),
            estimated_ready_at = ?verdict.estimated_ready_at,
            "Readiness evaluated"
        );
        verdict
    }
}

impl ReadinessEvaluator {
    /// CI signal from the pipeline itself, used when the host reports no
    /// checks for the head commit or could not be read
    async fn pipeline_requirement(
        &self,
        candidate: &MergeCandidate,
        estimate: Duration,
        now: DateTime<Utc>,
    ) -> Option<Requirement> {
        let status = with_timeout(
            "pipeline_status",
            self.call_timeout,
            self.ci.pipeline_status(&candidate.head_sha),
        )
        .await;
        match status {
            Ok(status) => pipeline_requirement(&status, estimate, now),
            Err(e) => {
                debug!(error = %e, "Pipeline status unavailable");
                None
            }
        }
    }
}

/// `None` when the pipeline state says nothing either way
pub fn pipeline_requirement(
    status: &PipelineStatus,
    estimate: Duration,
    now: DateTime<Utc>,
) -> Option<Requirement> {
    let kind = RequirementKind::CiChecks;
    let requirement = match status.state {
        PipelineState::Queued | PipelineState::Running => {
            let elapsed = status
                .started_at
                .and_then(|started| (now - started).to_std().ok())
                .unwrap_or(Duration::ZERO);
            let state = if status.state == PipelineState::Queued { "queued" } else { "running" };
            Requirement::new(kind, RequirementStatus::Pending, format!("pipeline {state}"), now)
                .with_wait_estimate(Some(estimate.saturating_sub(elapsed)))
        }
        PipelineState::Succeeded => {
            Requirement::new(kind, RequirementStatus::Satisfied, "pipeline succeeded", now)
        }
        PipelineState::Failed => {
            Requirement::new(kind, RequirementStatus::Failed, "pipeline failed", now)
        }
        PipelineState::Cancelled => {
            let mut requirement =
                Requirement::new(kind, RequirementStatus::Failed, "pipeline cancelled", now);
            requirement.auto_resolvable = true;
            requirement
        }
        PipelineState::Unknown => return None,
    };
    Some(requirement)
}

impl Requirement {
    fn with_estimate_if_pending(self, estimate: Duration) -> Self {
        if self.status == RequirementStatus::Pending {
            self.with_wait_estimate(Some(estimate))
        } else {
            self
        }
    }
}

/// Latest state-bearing review per reviewer.
///
/// Comments and pending reviews never override an approval or a change
/// request. Reviews without a timestamp count as oldest.
pub fn latest_reviews(reviews: &[Review]) -> HashMap<&str, &Review> {
    let mut latest: HashMap<&str, &Review> = HashMap::new();
    for review in reviews.iter().filter(|r| {
        matches!(
            r.state,
            ReviewState::Approved | ReviewState::ChangesRequested | ReviewState::Dismissed
        )
    }) {
        match latest.get(review.reviewer.as_str()) {
            Some(existing) if existing.submitted_at > review.submitted_at => {}
            _ => {
                latest.insert(review.reviewer.as_str(), review);
            }
        }
    }
    latest
}

fn approval_count(reviews: &[Review]) -> u32 {
    latest_reviews(reviews)
        .values()
        .filter(|r| r.state == ReviewState::Approved)
        .count() as u32
}

pub fn approvals_requirement(reviews: &[Review], required: u32, now: DateTime<Utc>) -> Requirement {
    let latest = latest_reviews(reviews);
    let mut requesting: Vec<&str> = latest
        .values()
        .filter(|r| r.state == ReviewState::ChangesRequested)
        .map(|r| r.reviewer.as_str())
        .collect();
    requesting.sort_unstable();

    if !requesting.is_empty() {
        return Requirement::new(
            RequirementKind::Approvals,
            RequirementStatus::Failed,
            format!("changes requested by {}", requesting.join(", ")),
            now,
        );
    }

    let approved = approval_count(reviews);
    if approved < required {
        Requirement::new(
            RequirementKind::Approvals,
            RequirementStatus::Pending,
            format!("{approved} of {required} required approvals"),
            now,
        )
    } else {
        Requirement::new(
            RequirementKind::Approvals,
            RequirementStatus::Satisfied,
            format!("{approved} approvals"),
            now,
        )
    }
}

fn failing_checks(checks: &[CheckRun]) -> Vec<&CheckRun> {
    checks
        .iter()
        .filter(|c| c.status == CheckStatus::Completed)
        .filter(|c| c.conclusion.map(|k| !k.is_passing()).unwrap_or(false))
        .collect()
}

fn pending_checks(checks: &[CheckRun]) -> Vec<&CheckRun> {
    checks
        .iter()
        .filter(|c| c.status != CheckStatus::Completed || c.conclusion.is_none())
        .collect()
}

pub fn ci_requirement(checks: &[CheckRun], now: DateTime<Utc>) -> Requirement {
    let failing = failing_checks(checks);
    if !failing.is_empty() {
        let names: Vec<&str> = failing.iter().map(|c| c.name.as_str()).collect();
        let mut requirement = Requirement::new(
            RequirementKind::CiChecks,
            RequirementStatus::Failed,
            format!("failing checks: {}", names.join(", ")),
            now,
        );
        requirement.auto_resolvable = failing.iter().all(|c| {
            matches!(
                c.conclusion,
                Some(CheckConclusion::Cancelled | CheckConclusion::TimedOut)
            )
        });
        return requirement;
    }

    let pending = pending_checks(checks);
    if !pending.is_empty() {
        let names: Vec<&str> = pending.iter().map(|c| c.name.as_str()).collect();
        return Requirement::new(
            RequirementKind::CiChecks,
            RequirementStatus::Pending,
            format!("waiting on checks: {}", names.join(", ")),
            now,
        );
    }

    let description = if checks.is_empty() {
        "no checks reported".to_string()
    } else {
        format!("{} checks passed", checks.len())
    };
    Requirement::new(RequirementKind::CiChecks, RequirementStatus::Satisfied, description, now)
}

/// Remaining CI time: typical duration minus time since the earliest pending
/// check started, or the configured fallback without history
pub fn ci_wait_estimate(
    checks: &[CheckRun],
    typical: Option<Duration>,
    fallback: Duration,
    now: DateTime<Utc>,
) -> Duration {
    let Some(typical) = typical else {
        return fallback;
    };
    let elapsed = pending_checks(checks)
        .iter()
        .filter_map(|c| c.started_at)
        .min()
        .and_then(|started| (now - started).to_std().ok())
        .unwrap_or(Duration::ZERO);
    typical.saturating_sub(elapsed)
}

pub fn conflicts_requirement(
    pull: &PullRequestSnapshot,
    mergeability_wait: Duration,
    now: DateTime<Utc>,
) -> Requirement {
    if pull.state == PullState::Merged {
        return Requirement::new(
            RequirementKind::NoConflicts,
            RequirementStatus::Satisfied,
            "already merged",
            now,
        );
    }
    match pull.mergeable {
        Some(true) => Requirement::new(
            RequirementKind::NoConflicts,
            RequirementStatus::Satisfied,
            "no merge conflicts",
            now,
        ),
        Some(false) => Requirement::new(
            RequirementKind::NoConflicts,
            RequirementStatus::Failed,
            format!("{} conflicts with {}", pull.head_ref, pull.base_ref),
            now,
        ),
        None => Requirement::new(
            RequirementKind::NoConflicts,
            RequirementStatus::Pending,
            "host is still computing mergeability",
            now,
        )
        .with_wait_estimate(Some(mergeability_wait)),
    }
}

pub fn protection_requirement(
    protection: Option<&BranchProtection>,
    reviews: &[Review],
    checks: &[CheckRun],
    strategy: MergeStrategy,
    ci_estimate: Duration,
    now: DateTime<Utc>,
) -> Requirement {
    let kind = RequirementKind::BranchProtection;
    let Some(protection) = protection else {
        return Requirement::new(
            kind,
            RequirementStatus::Satisfied,
            "target branch is not protected",
            now,
        );
    };

    if protection.locked {
        return Requirement::new(kind, RequirementStatus::Failed, "target branch is locked", now);
    }
    if protection.requires_linear_history && strategy == MergeStrategy::Merge {
        return Requirement::new(
            kind,
            RequirementStatus::Failed,
            "target branch requires linear history, merge commits are rejected",
            now,
        );
    }

    let approved = approval_count(reviews);
    if approved < protection.required_approving_reviews {
        return Requirement::new(
            kind,
            RequirementStatus::Pending,
            format!(
                "protection requires {} approvals, have {approved}",
                protection.required_approving_reviews
            ),
            now,
        );
    }

    let missing: Vec<&str> = protection
        .required_status_checks
        .iter()
        .filter(|context| {
            !checks.iter().any(|c| {
                &c.name == *context
                    && c.status == CheckStatus::Completed
                    && c.conclusion.map(|k| k.is_passing()).unwrap_or(false)
            })
        })
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Requirement::new(
            kind,
            RequirementStatus::Pending,
            format!("required status checks not green: {}", missing.join(", ")),
            now,
        )
        .with_wait_estimate(Some(ci_estimate));
    }

    Requirement::new(kind, RequirementStatus::Satisfied, "protection rules met", now)
}

pub fn policy_requirement(
    pull: &PullRequestSnapshot,
    candidate: &MergeCandidate,
    rules: &RequirementsConfig,
    title_pattern: Option<&Regex>,
    now: DateTime<Utc>,
) -> Requirement {
    let kind = RequirementKind::PolicyCompliance;
    let failed =
        |description: String| Requirement::new(kind, RequirementStatus::Failed, description, now);

    if pull.state == PullState::Closed {
        let mut requirement = failed("pull request was closed without merging".to_string());
        requirement.actionable = false;
        return requirement;
    }
    if pull.draft {
        return failed("pull request is a draft".to_string());
    }
    if let Some(label) = pull
        .labels
        .iter()
        .find(|l| rules.blocked_labels.iter().any(|b| b.eq_ignore_ascii_case(l)))
    {
        return failed(format!("blocked by label '{label}'"));
    }
    if let Some(pattern) = title_pattern {
        if !pattern.is_match(&pull.title) {
            return failed(format!("title '{}' does not match '{}'", pull.title, pattern.as_str()));
        }
    }
    if rules.require_work_item && candidate.work_item.is_none() {
        return failed("no linked issue (add 'Fixes #<issue>' to the description)".to_string());
    }

    Requirement::new(kind, RequirementStatus::Satisfied, "policy checks passed", now)
}

/// Used by the orchestrator when an evaluation cannot even start
pub fn unknown_verdict(error: &CollaboratorError, now: DateTime<Utc>) -> ReadinessVerdict {
    let requirements = RequirementKind::ALL
        .iter()
        .map(|kind| Requirement::unknown(*kind, error, now))
        .collect();
    ReadinessVerdict::from_requirements(requirements, now)
}
