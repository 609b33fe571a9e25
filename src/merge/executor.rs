//! Merge execution
//!
//! One call, one merge attempt. A last-moment re-read of the pull request
//! guards against merging something the evaluator never saw, and adopts a
//! merge that already happened instead of performing a second one.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::timer::Clock;
use super::types::{ErrorKind, MergeCandidate, MergeError, MergeOutcome};
use crate::external::{
    with_timeout, ChangeStats, CollaboratorError, GitHost, MergeRequest, MergeStrategy, PullState,
};
use crate::observability::OperationTimer;

pub struct MergeExecutor {
    host: Arc<dyn GitHost>,
    clock: Arc<dyn Clock>,
    actor: String,
    call_timeout: Duration,
}

impl std::fmt::Debug for MergeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeExecutor")
            .field("actor", &self.actor)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl MergeExecutor {
    pub fn new(
        host: Arc<dyn GitHost>,
        clock: Arc<dyn Clock>,
        actor: impl Into<String>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            host,
            clock,
            actor: actor.into(),
            call_timeout,
        }
    }

    pub async fn execute(
        &self,
        candidate: &MergeCandidate,
        strategy: MergeStrategy,
    ) -> MergeOutcome {
        let started_at = self.clock.now();
        let timer = OperationTimer::new("merge");
        let mut outcome = MergeOutcome {
            success: false,
            merge_commit: None,
            strategy,
            stats: ChangeStats::default(),
            errors: Vec::new(),
            adopted: false,
            started_at,
            duration_ms: 0,
        };

        match self.attempt(candidate, strategy, &mut outcome).await {
            Ok(()) => {
                outcome.success = true;
                info!(
                    candidate = candidate.id,
                    commit = ?outcome.merge_commit,
                    adopted = outcome.adopted,
                    %strategy,
                    "Merge completed"
                );
            }
            Err(error) => {
                warn!(
                    candidate = candidate.id,
                    kind = %error.kind,
                    retryable = error.retryable,
                    message = %error.message,
                    "Merge failed"
                );
                outcome.errors.push(error);
            }
        }

        outcome.duration_ms = timer.finish();
        outcome
    }

    async fn attempt(
        &self,
        candidate: &MergeCandidate,
        strategy: MergeStrategy,
        outcome: &mut MergeOutcome,
    ) -> Result<(), MergeError> {
        let pull = with_timeout(
            "get_pull_request",
            self.call_timeout,
            self.host.get_pull_request(candidate.id),
        )
        .await
        .map_err(|e| classify_collaborator_error(&e))?;

        outcome.stats = pull.stats;

        if pull.state == PullState::Merged {
            outcome.adopted = true;
            outcome.merge_commit = pull.merge_commit_sha.clone();
            info!(
                candidate = candidate.id,
                commit = ?pull.merge_commit_sha,
                "Already merged on the host, adopting"
            );
            return Ok(());
        }

        if pull.state != PullState::Open {
            return Err(MergeError::new(ErrorKind::RequirementsNotMet, "pull request is closed"));
        }
        if pull.mergeable != Some(true) {
            return Err(MergeError::new(
                ErrorKind::RequirementsNotMet,
                format!("pull request is not mergeable (mergeable = {:?})", pull.mergeable),
            ));
        }
        if pull.head_sha != candidate.head_sha {
            return Err(MergeError::new(
                ErrorKind::RequirementsNotMet,
                format!("head moved from {} to {}", candidate.head_sha, pull.head_sha),
            ));
        }

        let request = MergeRequest {
            strategy,
            commit_title: commit_title(candidate),
            commit_message: commit_message(candidate, strategy, &self.actor),
            expected_head_sha: candidate.head_sha.clone(),
        };

        let merge = self.host.merge(candidate.id, &request);
        let response = with_timeout("merge", self.call_timeout, merge)
            .await
            .map_err(|e| classify_collaborator_error(&e))?;

        if !response.merged {
            let message = response.message.unwrap_or_else(|| "merge was not performed".to_string());
            return Err(MergeError::new(classify_status(405, &message), message));
        }

        outcome.merge_commit = response.sha.filter(|sha| !sha.is_empty());
        Ok(())
    }
}

pub fn commit_title(candidate: &MergeCandidate) -> String {
    format!("{} (#{})", candidate.title, candidate.id)
}

pub fn commit_message(candidate: &MergeCandidate, strategy: MergeStrategy, actor: &str) -> String {
    let mut lines = Vec::new();
    let description = candidate
        .description
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty());
    if let Some(description) = description {
        lines.push(description.to_string());
        lines.push(String::new());
    }
    lines.push(format!("Merged by {actor} using {strategy}"));
    if let Some(work_item) = candidate.work_item {
        lines.push(format!("Closes #{work_item}"));
    }
    lines.join("\n")
}

/// Map an HTTP status and message from the host to an [`ErrorKind`]
pub fn classify_status(status: u16, message: &str) -> ErrorKind {
    let message = message.to_ascii_lowercase();
    let mentions_protection = message.contains("protect") || message.contains("review");
    match status {
        500..=599 => ErrorKind::TransportError,
        401 | 404 => ErrorKind::PermissionDenied,
        403 if mentions_protection => ErrorKind::BranchProtected,
        403 => ErrorKind::PermissionDenied,
        405 if message.contains("status check") => ErrorKind::CiPending,
        405 if mentions_protection => ErrorKind::BranchProtected,
        405 if message.contains("policy") => ErrorKind::PolicyViolation,
        405 => ErrorKind::MergeConflict,
        409 => ErrorKind::MergeConflict,
        422 if message.contains("status check") => ErrorKind::CiPending,
        _ => ErrorKind::PolicyViolation,
    }
}

pub fn classify_collaborator_error(error: &CollaboratorError) -> MergeError {
    let kind = match error {
        CollaboratorError::Transport(_) | CollaboratorError::Timeout { .. } => {
            ErrorKind::TransportError
        }
        CollaboratorError::NotFound(_) => ErrorKind::PermissionDenied,
        CollaboratorError::Api { status, message } => classify_status(*status, message),
    };
    MergeError::new(kind, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::mocks::{ready_pull_request, InMemoryGitHost};
    use crate::external::MergeResponse;
    use crate::merge::timer::SystemClock;

    fn setup(number: u64) -> (Arc<InMemoryGitHost>, MergeExecutor, MergeCandidate) {
        let host = Arc::new(InMemoryGitHost::new());
        let mut pull = ready_pull_request(number);
        pull.body = Some("Adds login.\n\nFixes #77".to_string());
        host.add_pull_request(pull.clone());
        let executor = MergeExecutor::new(
            host.clone(),
            Arc::new(SystemClock),
            "release-bot",
            Duration::from_secs(5),
        );
        (host, executor, MergeCandidate::from_snapshot(&pull))
    }

    #[test]
    fn test_commit_text_is_deterministic() {
        let mut candidate = MergeCandidate::from_snapshot(&ready_pull_request(9));
        candidate.title = "Add login".to_string();
        candidate.description = Some("Adds the login page.".to_string());
        candidate.work_item = Some(4);

        assert_eq!(commit_title(&candidate), "Add login (#9)");
        assert_eq!(
            commit_message(&candidate, MergeStrategy::Squash, "release-bot"),
            "Adds the login page.\n\nMerged by release-bot using squash\nCloses #4"
        );

        candidate.description = None;
        candidate.work_item = None;
        assert_eq!(
            commit_message(&candidate, MergeStrategy::Rebase, "ops"),
            "Merged by ops using rebase"
        );
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(classify_status(502, "bad gateway"), ErrorKind::TransportError);
        assert_eq!(classify_status(401, "Bad credentials"), ErrorKind::PermissionDenied);
        assert_eq!(classify_status(404, "Not Found"), ErrorKind::PermissionDenied);
        assert_eq!(classify_status(403, "Resource not accessible"), ErrorKind::PermissionDenied);
        assert_eq!(
            classify_status(403, "Protected branch update failed"),
            ErrorKind::BranchProtected
        );
        assert_eq!(
            classify_status(405, "Required status check \"build\" is expected."),
            ErrorKind::CiPending
        );
        assert_eq!(
            classify_status(405, "At least 2 approving reviews are required"),
            ErrorKind::BranchProtected
        );
        assert_eq!(
            classify_status(405, "Repository rule policy violation"),
            ErrorKind::PolicyViolation
        );
        assert_eq!(classify_status(405, "Pull Request is not mergeable"), ErrorKind::MergeConflict);
        assert_eq!(
            classify_status(409, "Head branch was modified. Review and try the merge again."),
            ErrorKind::MergeConflict
        );
        assert_eq!(
            classify_status(422, "2 of 3 required status checks are expected"),
            ErrorKind::CiPending
        );
        assert_eq!(classify_status(422, "Validation Failed"), ErrorKind::PolicyViolation);
        assert_eq!(classify_status(418, "teapot"), ErrorKind::PolicyViolation);
    }

    #[test]
    fn test_transport_failures_are_retryable() {
        let error = classify_collaborator_error(&CollaboratorError::Timeout {
            operation: "merge".to_string(),
            timeout_ms: 5000,
        });
        assert_eq!(error.kind, ErrorKind::TransportError);
        assert!(error.retryable);
    }

    #[tokio::test]
    async fn test_successful_merge_records_commit_and_stats() {
        let (host, executor, candidate) = setup(21);
        let outcome = executor.execute(&candidate, MergeStrategy::Squash).await;

        assert!(outcome.success);
        assert!(!outcome.adopted);
        assert!(outcome.merge_commit.as_deref().is_some_and(|sha| !sha.is_empty()));
        assert_eq!(outcome.stats.files_changed, 3);
        assert_eq!(host.merges_performed(), 1);

        let (_, request) = &host.merge_requests()[0];
        assert_eq!(request.commit_title, "Change #21 (#21)");
        assert!(request.commit_message.contains("Merged by release-bot using squash"));
        assert!(request.commit_message.ends_with("Closes #77"));
        assert_eq!(request.expected_head_sha, candidate.head_sha);
    }

    #[tokio::test]
    async fn test_conflict_is_retryable_merge_conflict() {
        let (host, executor, candidate) = setup(22);
        host.fail_next(
            "merge",
            CollaboratorError::Api {
                status: 409,
                message: "Head branch was modified. Review and try the merge again.".to_string(),
            },
        );

        let outcome = executor.execute(&candidate, MergeStrategy::Squash).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error_kind(), Some(ErrorKind::MergeConflict));
        assert!(outcome.error().unwrap().retryable);
    }

    #[tokio::test]
    async fn test_unmerged_response_is_classified() {
        let (host, executor, candidate) = setup(23);
        host.queue_merge_response(MergeResponse {
            merged: false,
            sha: None,
            message: Some("Required status check \"build\" is expected.".to_string()),
        });

        let outcome = executor.execute(&candidate, MergeStrategy::Squash).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::CiPending));
    }

    #[tokio::test]
    async fn test_guard_refuses_moved_head_without_calling_merge() {
        let (host, executor, candidate) = setup(24);
        host.update_pull_request(24, |p| p.head_sha = "newhead".to_string());

        let outcome = executor.execute(&candidate, MergeStrategy::Squash).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::RequirementsNotMet));
        assert!(!outcome.error().unwrap().retryable);
        assert_eq!(host.call_count("merge"), 0);
    }

    #[tokio::test]
    async fn test_already_merged_is_adopted() {
        let (host, executor, candidate) = setup(25);
        host.update_pull_request(25, |p| {
            p.state = PullState::Merged;
            p.merge_commit_sha = Some("abc123".to_string());
        });

        let outcome = executor.execute(&candidate, MergeStrategy::Squash).await;
        assert!(outcome.success);
        assert!(outcome.adopted);
        assert_eq!(outcome.merge_commit.as_deref(), Some("abc123"));
        assert_eq!(host.call_count("merge"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_merge_call_times_out_as_transport_error() {
        let (host, executor, candidate) = setup(26);
        host.delay("merge", Duration::from_secs(120));

        let outcome = executor.execute(&candidate, MergeStrategy::Squash).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::TransportError));
    }
}
