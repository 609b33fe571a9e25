//! Wire shapes of the GitHub REST responses the client reads, and their
//! conversion into host-neutral types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::external::{
    BranchProtection, ChangeStats, CheckConclusion, CheckRun, CheckStatus, IssueState,
    MergeStrategy, OpenPullRef, PullRequestSnapshot, PullState, Review, ReviewState,
};

#[derive(Debug, Clone, Deserialize)]
pub struct GitRefDto {
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub sha: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LabelDto {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserDto {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestDto {
    pub number: u64,
    #[serde(default)]
    pub title: String,
    pub body: Option<String>,
    pub state: String,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub merged: bool,
    pub merged_at: Option<DateTime<Utc>>,
    pub mergeable: Option<bool>,
    pub merge_commit_sha: Option<String>,
    pub head: GitRefDto,
    pub base: GitRefDto,
    #[serde(default)]
    pub labels: Vec<LabelDto>,
    #[serde(default)]
    pub additions: u64,
    #[serde(default)]
    pub deletions: u64,
    #[serde(default)]
    pub changed_files: u64,
    #[serde(default)]
    pub commits: u64,
}

impl PullRequestDto {
    fn pull_state(&self) -> PullState {
        if self.merged || self.merged_at.is_some() {
            PullState::Merged
        } else if self.state == "open" {
            PullState::Open
        } else {
            PullState::Closed
        }
    }
}

impl From<PullRequestDto> for PullRequestSnapshot {
    fn from(dto: PullRequestDto) -> Self {
        let state = dto.pull_state();
        PullRequestSnapshot {
            number: dto.number,
            title: dto.title,
            body: dto.body,
            state,
            draft: dto.draft,
            mergeable: dto.mergeable,
            head_ref: dto.head.ref_name,
            head_sha: dto.head.sha,
            base_ref: dto.base.ref_name,
            // Only meaningful once merged; before that GitHub reports a test merge
            merge_commit_sha: if state == PullState::Merged { dto.merge_commit_sha } else { None },
            labels: dto.labels.into_iter().map(|l| l.name).collect(),
            stats: ChangeStats {
                files_changed: dto.changed_files,
                additions: dto.additions,
                deletions: dto.deletions,
                commits: dto.commits,
            },
        }
    }
}

impl From<PullRequestDto> for OpenPullRef {
    fn from(dto: PullRequestDto) -> Self {
        OpenPullRef {
            number: dto.number,
            head_ref: dto.head.ref_name,
            base_ref: dto.base.ref_name,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReviewDto {
    pub user: Option<UserDto>,
    pub state: String,
    pub submitted_at: Option<DateTime<Utc>>,
}

impl ReviewDto {
    /// `None` for reviews by deleted accounts
    pub fn into_review(self) -> Option<Review> {
        let state = match self.state.as_str() {
            "APPROVED" => ReviewState::Approved,
            "CHANGES_REQUESTED" => ReviewState::ChangesRequested,
            "DISMISSED" => ReviewState::Dismissed,
            "PENDING" => ReviewState::Pending,
            _ => ReviewState::Commented,
        };
        Some(Review {
            reviewer: self.user?.login,
            state,
            submitted_at: self.submitted_at,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckRunsDto {
    #[serde(default)]
    pub check_runs: Vec<CheckRunDto>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckRunDto {
    pub name: String,
    pub status: String,
    pub conclusion: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<CheckRunDto> for CheckRun {
    fn from(dto: CheckRunDto) -> Self {
        let status = match dto.status.as_str() {
            "completed" => CheckStatus::Completed,
            "in_progress" => CheckStatus::InProgress,
            _ => CheckStatus::Queued,
        };
        let conclusion = dto.conclusion.as_deref().map(|c| match c {
            "success" => CheckConclusion::Success,
            "neutral" => CheckConclusion::Neutral,
            "cancelled" => CheckConclusion::Cancelled,
            "skipped" => CheckConclusion::Skipped,
            "timed_out" => CheckConclusion::TimedOut,
            "action_required" => CheckConclusion::ActionRequired,
            "stale" => CheckConclusion::Stale,
            _ => CheckConclusion::Failure,
        });
        CheckRun {
            name: dto.name,
            status,
            conclusion,
            started_at: dto.started_at,
            completed_at: dto.completed_at,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BranchProtectionDto {
    pub required_status_checks: Option<RequiredStatusChecksDto>,
    pub required_pull_request_reviews: Option<RequiredReviewsDto>,
    pub required_linear_history: Option<EnabledDto>,
    pub lock_branch: Option<EnabledDto>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequiredStatusChecksDto {
    #[serde(default)]
    pub contexts: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequiredReviewsDto {
    #[serde(default)]
    pub required_approving_review_count: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnabledDto {
    #[serde(default)]
    pub enabled: bool,
}

impl From<BranchProtectionDto> for BranchProtection {
    fn from(dto: BranchProtectionDto) -> Self {
        BranchProtection {
            required_approving_reviews: dto
                .required_pull_request_reviews
                .map(|r| r.required_approving_review_count)
                .unwrap_or(0),
            required_status_checks: dto
                .required_status_checks
                .map(|c| c.contexts)
                .unwrap_or_default(),
            requires_linear_history: dto.required_linear_history.is_some_and(|l| l.enabled),
            locked: dto.lock_branch.is_some_and(|l| l.enabled),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeBody<'a> {
    pub commit_title: &'a str,
    pub commit_message: &'a str,
    pub sha: &'a str,
    pub merge_method: MergeStrategy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MergeResponseDto {
    pub sha: Option<String>,
    #[serde(default)]
    pub merged: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssueDto {
    pub state: String,
}

impl IssueDto {
    pub fn issue_state(&self) -> IssueState {
        if self.state == "closed" {
            IssueState::Closed
        } else {
            IssueState::Open
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdDto {
    pub id: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRunsDto {
    #[serde(default)]
    pub workflow_runs: Vec<WorkflowRunDto>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRunDto {
    pub status: Option<String>,
    pub conclusion: Option<String>,
    pub run_started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRunDto {
    pub fn started_at(&self) -> DateTime<Utc> {
        self.run_started_at.unwrap_or(self.created_at)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentStatusDto {
    pub state: String,
}
