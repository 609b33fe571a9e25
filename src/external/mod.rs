//! Collaborator abstractions
//!
//! Trait-based seams for everything the orchestrator talks to: the git host,
//! CI, deployments, and notification channels. Production code injects the
//! GitHub-backed implementations; tests inject the in-memory ones from
//! [`mocks`].
//!
//! Every collaborator returns [`CollaboratorError`], a machine-readable error
//! that carries the HTTP status and message when there is one. Nothing above
//! this layer inspects provider-specific error text except the merge error
//! classifier.

pub mod ci;
pub mod deploy;
pub mod git_host;
pub mod mocks;
pub mod notify;

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

pub use ci::{CiProvider, PipelineState, PipelineStatus};
pub use deploy::{DeploymentHandle, DeploymentRequest, DeploymentState, Deployer};
pub use git_host::{
    BranchProtection, ChangeStats, CheckConclusion, CheckRun, CheckStatus, GitHost, IssueNumber,
    IssueState,
    MergeRequest, MergeResponse, MergeStrategy, OpenPullRef, PullNumber, PullRequestSnapshot, PullState,
    Review, ReviewState,
};
pub use notify::{
    ChannelKind, ChannelNotifier, DeliveryReceipt, DeliveryStatus, NotificationChannelConfig,
    NotificationMessage, Notifier,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("HTTP {status}: {message}")]
    Api { status: u16, message: String },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },
}

impl CollaboratorError {
    /// HTTP status when the collaborator answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            CollaboratorError::Api { status, .. } => Some(*status),
            CollaboratorError::NotFound(_) => Some(404),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

/// Run a collaborator call under a hard deadline.
///
/// A hung call turns into [`CollaboratorError::Timeout`] instead of stalling
/// the orchestrator.
pub async fn with_timeout<T, F>(
    operation: &str,
    limit: Duration,
    call: F,
) -> Result<T, CollaboratorError>
where
    F: Future<Output = Result<T, CollaboratorError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                operation,
                timeout_ms = limit.as_millis() as u64,
                "Collaborator call timed out"
            );
            Err(CollaboratorError::Timeout {
                operation: operation.to_string(),
                timeout_ms: limit.as_millis() as u64,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_converts_hung_call() {
        let result: Result<(), _> = with_timeout("get_reviews", Duration::from_secs(5), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;

        assert_eq!(
            result.unwrap_err(),
            CollaboratorError::Timeout {
                operation: "get_reviews".to_string(),
                timeout_ms: 5000,
            }
        );
    }

    #[tokio::test]
    async fn test_with_timeout_passes_through_errors() {
        let result: Result<(), _> = with_timeout("merge", Duration::from_secs(5), async {
            Err(CollaboratorError::Api {
                status: 405,
                message: "Pull Request is not mergeable".to_string(),
            })
        })
        .await;

        assert_eq!(result.unwrap_err().status(), Some(405));
    }

    #[test]
    fn test_not_found_reports_404() {
        assert!(CollaboratorError::NotFound("branch".to_string()).is_not_found());
        assert!(!CollaboratorError::Transport("reset".to_string()).is_not_found());
    }
}
