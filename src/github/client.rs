use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Jitter, Quota, RateLimiter};
use octocrab::params::repos::Reference;
use octocrab::Octocrab;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::errors::{to_collaborator_error, GitHubError};
use super::types::{
    BranchProtectionDto, DeploymentStatusDto, IdDto, IssueDto, MergeBody, MergeResponseDto,
    PullRequestDto, ReviewDto, CheckRunsDto, WorkflowRunsDto,
};
use crate::config::{GitHubConfig, RateLimitConfig};
use crate::external::{
    BranchProtection, CheckRun, CiProvider, CollaboratorError, DeploymentHandle, DeploymentRequest,
    DeploymentState, Deployer, GitHost, IssueNumber, IssueState, MergeRequest, MergeResponse,
    OpenPullRef, PipelineState, PipelineStatus, PullNumber, PullRequestSnapshot, Review,
};

/// GitHub REST adapter for the git host, CI and deployment seams.
///
/// Every request waits on a shared rate limiter first.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    octocrab: Octocrab,
    rate_limiter: Arc<DefaultDirectRateLimiter>,
    owner: String,
    repo: String,
}

impl GitHubClient {
    pub fn new(config: &GitHubConfig) -> Result<Self, GitHubError> {
        let token = config
            .token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                GitHubError::TokenNotFound(
                    "GitHub token not found in config or environment.".to_string(),
                )
            })?;

        if config.owner.is_empty() || config.repo.is_empty() {
            return Err(GitHubError::ConfigNotFound(
                "GitHub owner and repo must be set before talking to GitHub.".to_string(),
            ));
        }

        let mut builder = Octocrab::builder().personal_token(token);
        if let Some(api_base) = &config.api_base {
            builder = builder.base_uri(api_base.as_str())?;
        }

        Ok(Self::with_octocrab(
            builder.build()?,
            config.owner.clone(),
            config.repo.clone(),
            &config.rate_limit,
        ))
    }

    pub fn with_octocrab(
        octocrab: Octocrab,
        owner: String,
        repo: String,
        rate_limit: &RateLimitConfig,
    ) -> Self {
        let per_hour = NonZeroU32::new(rate_limit.requests_per_hour).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(rate_limit.burst_capacity).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_hour(per_hour).allow_burst(burst);

        Self {
            octocrab,
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
            owner,
            repo,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    fn route(&self, path: &str) -> String {
        format!("/repos/{}/{}/{}", self.owner, self.repo, path)
    }

    async fn throttle(&self) {
        self.rate_limiter
            .until_ready_with_jitter(Jitter::up_to(Duration::from_millis(50)))
            .await;
    }

    async fn get<T: DeserializeOwned, P: Serialize + ?Sized>(
        &self,
        path: &str,
        query: Option<&P>,
    ) -> Result<T, CollaboratorError> {
        self.throttle().await;
        let route = self.route(path);
        debug!(%route, "GET");
        self.octocrab.get(route, query).await.map_err(to_collaborator_error)
    }

    async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, CollaboratorError> {
        self.throttle().await;
        let route = self.route(path);
        debug!(%route, "POST");
        self.octocrab.post(route, Some(body)).await.map_err(to_collaborator_error)
    }

    async fn patch<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, CollaboratorError> {
        self.throttle().await;
        let route = self.route(path);
        debug!(%route, "PATCH");
        self.octocrab.patch(route, Some(body)).await.map_err(to_collaborator_error)
    }

    async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, CollaboratorError> {
        self.throttle().await;
        let route = self.route(path);
        debug!(%route, "PUT");
        self.octocrab.put(route, Some(body)).await.map_err(to_collaborator_error)
    }

    async fn workflow_runs(
        &self,
        query: &[(&str, &str)],
    ) -> Result<WorkflowRunsDto, CollaboratorError> {
        self.get("actions/runs", Some(query)).await
    }
}

/// `Ok(false)` for 404, everything else passes through
fn exists<T>(result: Result<T, CollaboratorError>) -> Result<bool, CollaboratorError> {
    match result {
        Ok(_) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl GitHost for GitHubClient {
    async fn get_pull_request(
        &self,
        number: PullNumber,
    ) -> Result<PullRequestSnapshot, CollaboratorError> {
        let dto: PullRequestDto = self.get(&format!("pulls/{number}"), None::<&()>).await?;
        Ok(dto.into())
    }

    async fn get_reviews(&self, number: PullNumber) -> Result<Vec<Review>, CollaboratorError> {
        let dtos: Vec<ReviewDto> = self
            .get(&format!("pulls/{number}/reviews"), Some(&[("per_page", "100")]))
            .await?;
        Ok(dtos.into_iter().filter_map(ReviewDto::into_review).collect())
    }

    async fn get_checks(&self, sha: &str) -> Result<Vec<CheckRun>, CollaboratorError> {
        let dto: CheckRunsDto = self
            .get(&format!("commits/{sha}/check-runs"), Some(&[("per_page", "100")]))
            .await?;
        Ok(dto.check_runs.into_iter().map(CheckRun::from).collect())
    }

    async fn get_branch_protection(
        &self,
        branch: &str,
    ) -> Result<Option<BranchProtection>, CollaboratorError> {
        match self
            .get::<BranchProtectionDto, ()>(&format!("branches/{branch}/protection"), None)
            .await
        {
            Ok(dto) => Ok(Some(dto.into())),
            Err(e) if e.is_not_found() => Ok(None),
            // Plans without branch protection answer 403 "Upgrade to GitHub Pro"
            Err(CollaboratorError::Api { status: 403, message }) if message.contains("Upgrade") => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn merge(
        &self,
        number: PullNumber,
        request: &MergeRequest,
    ) -> Result<MergeResponse, CollaboratorError> {
        let body = MergeBody {
            commit_title: &request.commit_title,
            commit_message: &request.commit_message,
            sha: &request.expected_head_sha,
            merge_method: request.strategy,
        };
        let dto: MergeResponseDto = self.put(&format!("pulls/{number}/merge"), &body).await?;
        Ok(MergeResponse {
            merged: dto.merged,
            sha: dto.sha,
            message: dto.message,
        })
    }

    async fn list_open_pull_requests(&self) -> Result<Vec<OpenPullRef>, CollaboratorError> {
        let dtos: Vec<PullRequestDto> = self
            .get("pulls", Some(&[("state", "open"), ("per_page", "100")]))
            .await?;
        Ok(dtos.into_iter().map(OpenPullRef::from).collect())
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool, CollaboratorError> {
        exists(
            self.get::<serde_json::Value, ()>(&format!("branches/{branch}"), None)
                .await,
        )
    }

    async fn delete_branch(&self, branch: &str) -> Result<(), CollaboratorError> {
        self.throttle().await;
        debug!(branch, "DELETE ref");
        self.octocrab
            .repos(&self.owner, &self.repo)
            .delete_ref(&Reference::Branch(branch.to_string()))
            .await
            .map_err(to_collaborator_error)
    }

    async fn create_branch(&self, branch: &str, sha: &str) -> Result<(), CollaboratorError> {
        let body = json!({ "ref": format!("refs/heads/{branch}"), "sha": sha });
        let _: serde_json::Value = self.post("git/refs", &body).await?;
        Ok(())
    }

    async fn add_comment(&self, issue: IssueNumber, body: &str) -> Result<u64, CollaboratorError> {
        let created: IdDto = self
            .post(&format!("issues/{issue}/comments"), &json!({ "body": body }))
            .await?;
        Ok(created.id)
    }

    async fn comment_exists(&self, comment_id: u64) -> Result<bool, CollaboratorError> {
        exists(
            self.get::<IdDto, ()>(&format!("issues/comments/{comment_id}"), None)
                .await,
        )
    }

    async fn close_issue(&self, issue: IssueNumber) -> Result<(), CollaboratorError> {
        let _: IssueDto = self
            .patch(
                &format!("issues/{issue}"),
                &json!({ "state": "closed", "state_reason": "completed" }),
            )
            .await?;
        Ok(())
    }

    async fn reopen_issue(&self, issue: IssueNumber) -> Result<(), CollaboratorError> {
        let _: IssueDto = self
            .patch(&format!("issues/{issue}"), &json!({ "state": "open" }))
            .await?;
        Ok(())
    }

    async fn get_issue_state(&self, issue: IssueNumber) -> Result<IssueState, CollaboratorError> {
        let dto: IssueDto = self.get(&format!("issues/{issue}"), None::<&()>).await?;
        Ok(dto.issue_state())
    }
}

#[async_trait]
impl CiProvider for GitHubClient {
    async fn pipeline_status(&self, sha: &str) -> Result<PipelineStatus, CollaboratorError> {
        let runs = self.workflow_runs(&[("head_sha", sha), ("per_page", "20")]).await?;
        let states: Vec<PipelineState> = runs
            .workflow_runs
            .iter()
            .map(|r| {
                PipelineState::from((r.status.as_deref().unwrap_or(""), r.conclusion.as_deref()))
            })
            .collect();

        let state = if states.is_empty() {
            PipelineState::Unknown
        } else if states.contains(&PipelineState::Failed) {
            PipelineState::Failed
        } else if states.contains(&PipelineState::Running) {
            PipelineState::Running
        } else if states.contains(&PipelineState::Queued) {
            PipelineState::Queued
        } else if states.contains(&PipelineState::Cancelled) {
            PipelineState::Cancelled
        } else if states.iter().all(|s| *s == PipelineState::Succeeded) {
            PipelineState::Succeeded
        } else {
            PipelineState::Unknown
        };

        Ok(PipelineStatus {
            state,
            started_at: runs.workflow_runs.iter().map(|r| r.started_at()).min(),
        })
    }

    async fn typical_duration(&self, branch: &str) -> Result<Option<Duration>, CollaboratorError> {
        let runs = self
            .workflow_runs(&[("branch", branch), ("status", "success"), ("per_page", "10")])
            .await?;
        let durations: Vec<Duration> = runs
            .workflow_runs
            .iter()
            .filter_map(|r| (r.updated_at - r.started_at()).to_std().ok())
            .collect();

        if durations.is_empty() {
            return Ok(None);
        }
        let total: Duration = durations.iter().sum();
        Ok(Some(total / durations.len() as u32))
    }
}

#[async_trait]
impl Deployer for GitHubClient {
    async fn trigger(
        &self,
        request: &DeploymentRequest,
    ) -> Result<DeploymentHandle, CollaboratorError> {
        let body = json!({
            "ref": &request.commit_sha,
            "environment": &request.environment,
            "description": &request.description,
            "auto_merge": false,
            "required_contexts": [],
        });
        let created: IdDto = self.post("deployments", &body).await?;
        Ok(DeploymentHandle {
            id: created.id,
            environment: request.environment.clone(),
        })
    }

    async fn status(
        &self,
        handle: &DeploymentHandle,
    ) -> Result<DeploymentState, CollaboratorError> {
        let statuses: Vec<DeploymentStatusDto> = self
            .get(&format!("deployments/{}/statuses", handle.id), Some(&[("per_page", "1")]))
            .await?;
        Ok(statuses
            .first()
            .map(|s| DeploymentState::from(s.state.as_str()))
            .unwrap_or(DeploymentState::Pending))
    }

    async fn deactivate(
        &self,
        handle: &DeploymentHandle,
        reason: &str,
    ) -> Result<(), CollaboratorError> {
        let _: serde_json::Value = self
            .post(
                &format!("deployments/{}/statuses", handle.id),
                &json!({ "state": "inactive", "description": reason }),
            )
            .await?;
        Ok(())
    }
}
