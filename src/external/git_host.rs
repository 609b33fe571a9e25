//! Git hosting abstraction
//!
//! Read and write operations the orchestrator needs from the platform hosting
//! the repository. The host is the source of truth for merge state, so every
//! decision that matters (readiness, the last-moment merge guard, at-most-once
//! merge, completion verification) goes through a fresh read here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::CollaboratorError;

pub type PullNumber = u64;
pub type IssueNumber = u64;

/// How the host should combine the branch into its target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    Merge,
    #[default]
    Squash,
    Rebase,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStrategy::Merge => "merge",
            MergeStrategy::Squash => "squash",
            MergeStrategy::Rebase => "rebase",
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MergeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "merge" => Ok(MergeStrategy::Merge),
            "squash" => Ok(MergeStrategy::Squash),
            "rebase" => Ok(MergeStrategy::Rebase),
            other => Err(format!(
                "unknown merge strategy '{other}' (expected merge, squash or rebase)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewState {
    Approved,
    ChangesRequested,
    Commented,
    Dismissed,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub reviewer: String,
    pub state: ReviewState,
    pub submitted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckStatus {
    Queued,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckConclusion {
    Success,
    Failure,
    Neutral,
    Cancelled,
    Skipped,
    TimedOut,
    ActionRequired,
    Stale,
}

impl CheckConclusion {
    pub fn is_passing(&self) -> bool {
        matches!(
            self,
            CheckConclusion::Success | CheckConclusion::Neutral | CheckConclusion::Skipped
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRun {
    pub name: String,
    pub status: CheckStatus,
    pub conclusion: Option<CheckConclusion>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PullState {
    Open,
    Closed,
    Merged,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeStats {
    pub files_changed: u64,
    pub additions: u64,
    pub deletions: u64,
    pub commits: u64,
}

/// Point-in-time view of a pull request as the host reports it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestSnapshot {
    pub number: PullNumber,
    pub title: String,
    pub body: Option<String>,
    pub state: PullState,
    pub draft: bool,
    /// `None` while the host is still computing mergeability
    pub mergeable: Option<bool>,
    pub head_ref: String,
    pub head_sha: String,
    pub base_ref: String,
    pub merge_commit_sha: Option<String>,
    pub labels: Vec<String>,
    pub stats: ChangeStats,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchProtection {
    pub required_approving_reviews: u32,
    pub required_status_checks: Vec<String>,
    pub requires_linear_history: bool,
    pub locked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRequest {
    pub strategy: MergeStrategy,
    pub commit_title: String,
    pub commit_message: String,
    /// The host refuses the merge if the head moved past this sha
    pub expected_head_sha: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeResponse {
    pub merged: bool,
    pub sha: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssueState {
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenPullRef {
    pub number: PullNumber,
    pub head_ref: String,
    pub base_ref: String,
}

#[async_trait]
pub trait GitHost: Send + Sync {
    /// Current state of a pull request, including its mergeable flag
    async fn get_pull_request(
        &self,
        number: PullNumber,
    ) -> Result<PullRequestSnapshot, CollaboratorError>;

    async fn get_reviews(&self, number: PullNumber) -> Result<Vec<Review>, CollaboratorError>;

    async fn get_checks(&self, sha: &str) -> Result<Vec<CheckRun>, CollaboratorError>;

    /// `None` means the branch is not protected
    async fn get_branch_protection(
        &self,
        branch: &str,
    ) -> Result<Option<BranchProtection>, CollaboratorError>;

    async fn merge(
        &self,
        number: PullNumber,
        request: &MergeRequest,
    ) -> Result<MergeResponse, CollaboratorError>;

    async fn list_open_pull_requests(&self) -> Result<Vec<OpenPullRef>, CollaboratorError>;

    async fn branch_exists(&self, branch: &str) -> Result<bool, CollaboratorError>;

    async fn delete_branch(&self, branch: &str) -> Result<(), CollaboratorError>;

    async fn create_branch(&self, branch: &str, sha: &str) -> Result<(), CollaboratorError>;

    /// Returns the id of the created comment
    async fn add_comment(&self, issue: IssueNumber, body: &str) -> Result<u64, CollaboratorError>;

    async fn comment_exists(&self, comment_id: u64) -> Result<bool, CollaboratorError>;

    async fn close_issue(&self, issue: IssueNumber) -> Result<(), CollaboratorError>;

    async fn reopen_issue(&self, issue: IssueNumber) -> Result<(), CollaboratorError>;

    async fn get_issue_state(&self, issue: IssueNumber) -> Result<IssueState, CollaboratorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_strategy_parsing() {
        assert_eq!("squash".parse::<MergeStrategy>().unwrap(), MergeStrategy::Squash);
        assert_eq!("Rebase".parse::<MergeStrategy>().unwrap(), MergeStrategy::Rebase);
        assert!("octopus".parse::<MergeStrategy>().is_err());
        assert_eq!(MergeStrategy::default(), MergeStrategy::Squash);
    }

    #[test]
    fn test_passing_conclusions() {
        assert!(CheckConclusion::Success.is_passing());
        assert!(CheckConclusion::Skipped.is_passing());
        assert!(!CheckConclusion::TimedOut.is_passing());
        assert!(!CheckConclusion::Stale.is_passing());
    }
}
