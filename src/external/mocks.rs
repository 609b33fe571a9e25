// In-memory collaborators - no network, fully scriptable
//
// Used by unit tests, the scenario tests under tests/, and `land --dry-run`.
// State lives behind std Mutexes that are never held across an await.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use super::ci::{CiProvider, PipelineState, PipelineStatus};
use super::deploy::{DeploymentHandle, DeploymentRequest, DeploymentState, Deployer};
use super::git_host::*;
use super::notify::{DeliveryReceipt, DeliveryStatus, NotificationMessage, Notifier};
use super::CollaboratorError;

/// Failure/latency script shared by the in-memory collaborators
#[derive(Debug, Default)]
struct Script {
    calls: HashMap<String, u32>,
    failures: HashMap<String, VecDeque<CollaboratorError>>,
    always_fail: HashMap<String, CollaboratorError>,
    delays: HashMap<String, Duration>,
}

impl Script {
    fn enter(&mut self, operation: &str) -> (Option<Duration>, Option<CollaboratorError>) {
        *self.calls.entry(operation.to_string()).or_insert(0) += 1;
        let delay = self.delays.get(operation).copied();
        let failure = self
            .failures
            .get_mut(operation)
            .and_then(|queue| queue.pop_front())
            .or_else(|| self.always_fail.get(operation).cloned());
        (delay, failure)
    }
}

#[derive(Debug, Default)]
struct ScriptHandle(Mutex<Script>);

impl ScriptHandle {
    async fn gate(&self, operation: &str) -> Result<(), CollaboratorError> {
        let (delay, failure) = self.0.lock().unwrap_or_else(|e| e.into_inner()).enter(operation);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Script) -> R) -> R {
        f(&mut self.0.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

#[derive(Debug, Default)]
struct HostState {
    pulls: BTreeMap<PullNumber, PullRequestSnapshot>,
    reviews: HashMap<PullNumber, Vec<Review>>,
    checks: HashMap<String, Vec<CheckRun>>,
    protection: HashMap<String, BranchProtection>,
    branches: HashMap<String, String>,
    issues: HashMap<IssueNumber, IssueState>,
    sticky_open_issues: HashSet<IssueNumber>,
    comments: BTreeMap<u64, (IssueNumber, String)>,
    next_comment_id: u64,
    merge_requests: Vec<(PullNumber, MergeRequest)>,
    merge_responses: VecDeque<MergeResponse>,
    merges_performed: u32,
}

/// Scriptable in-memory git host
#[derive(Debug, Default)]
pub struct InMemoryGitHost {
    state: Mutex<HostState>,
    script: ScriptHandle,
}

impl InMemoryGitHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a pull request along with its head and base branches
    pub fn add_pull_request(&self, pull: PullRequestSnapshot) {
        let mut state = self.state();
        state.branches.insert(pull.head_ref.clone(), pull.head_sha.clone());
        state
            .branches
            .entry(pull.base_ref.clone())
            .or_insert_with(|| "base0000".to_string());
        state.pulls.insert(pull.number, pull);
    }

    pub fn update_pull_request(
        &self,
        number: PullNumber,
        f: impl FnOnce(&mut PullRequestSnapshot),
    ) {
        if let Some(pull) = self.state().pulls.get_mut(&number) {
            f(pull);
        }
    }

    pub fn set_reviews(&self, number: PullNumber, reviews: Vec<Review>) {
        self.state().reviews.insert(number, reviews);
    }

    pub fn set_checks(&self, sha: &str, checks: Vec<CheckRun>) {
        self.state().checks.insert(sha.to_string(), checks);
    }

    pub fn set_protection(&self, branch: &str, protection: BranchProtection) {
        self.state().protection.insert(branch.to_string(), protection);
    }

    pub fn add_issue(&self, issue: IssueNumber, state: IssueState) {
        self.state().issues.insert(issue, state);
    }

    /// Close requests for this issue are accepted but never stick, as if
    /// another actor reopened it right away
    pub fn keep_issue_open(&self, issue: IssueNumber) {
        self.state().sticky_open_issues.insert(issue);
    }

    pub fn add_branch(&self, branch: &str, sha: &str) {
        self.state().branches.insert(branch.to_string(), sha.to_string());
    }

    /// Queue a canned response for the next merge call, bypassing the
    /// built-in merge behavior
    pub fn queue_merge_response(&self, response: MergeResponse) {
        self.state().merge_responses.push_back(response);
    }

    pub fn fail_next(&self, operation: &str, error: CollaboratorError) {
        self.script.with(|s| {
            s.failures
                .entry(operation.to_string())
                .or_default()
                .push_back(error)
        });
    }

    pub fn fail_always(&self, operation: &str, error: CollaboratorError) {
        self.script
            .with(|s| s.always_fail.insert(operation.to_string(), error));
    }

    pub fn delay(&self, operation: &str, delay: Duration) {
        self.script.with(|s| s.delays.insert(operation.to_string(), delay));
    }

    pub fn call_count(&self, operation: &str) -> u32 {
        self.script
            .with(|s| s.calls.get(operation).copied().unwrap_or(0))
    }

    pub fn merges_performed(&self) -> u32 {
        self.state().merges_performed
    }

    pub fn merge_requests(&self) -> Vec<(PullNumber, MergeRequest)> {
        self.state().merge_requests.clone()
    }

    pub fn has_branch(&self, branch: &str) -> bool {
        self.state().branches.contains_key(branch)
    }

    pub fn issue_state(&self, issue: IssueNumber) -> Option<IssueState> {
        self.state().issues.get(&issue).copied()
    }

    pub fn comments_on(&self, issue: IssueNumber) -> Vec<String> {
        self.state()
            .comments
            .values()
            .filter(|(target, _)| *target == issue)
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub fn delete_all_comments(&self) {
        self.state().comments.clear();
    }

    fn pull(&self, number: PullNumber) -> Result<PullRequestSnapshot, CollaboratorError> {
        self.state()
            .pulls
            .get(&number)
            .cloned()
            .ok_or_else(|| CollaboratorError::NotFound(format!("pull request #{number}")))
    }
}

#[async_trait]
impl GitHost for InMemoryGitHost {
    async fn get_pull_request(
        &self,
        number: PullNumber,
    ) -> Result<PullRequestSnapshot, CollaboratorError> {
        self.script.gate("get_pull_request").await?;
        self.pull(number)
    }

    async fn get_reviews(&self, number: PullNumber) -> Result<Vec<Review>, CollaboratorError> {
        self.script.gate("get_reviews").await?;
        Ok(self.state().reviews.get(&number).cloned().unwrap_or_default())
    }

    async fn get_checks(&self, sha: &str) -> Result<Vec<CheckRun>, CollaboratorError> {
        self.script.gate("get_checks").await?;
        Ok(self.state().checks.get(sha).cloned().unwrap_or_default())
    }

    async fn get_branch_protection(
        &self,
        branch: &str,
    ) -> Result<Option<BranchProtection>, CollaboratorError> {
        self.script.gate("get_branch_protection").await?;
        Ok(self.state().protection.get(branch).cloned())
    }

    async fn merge(
        &self,
        number: PullNumber,
        request: &MergeRequest,
    ) -> Result<MergeResponse, CollaboratorError> {
        self.script.gate("merge").await?;
        let mut state = self.state();
        state.merge_requests.push((number, request.clone()));

        if let Some(response) = state.merge_responses.pop_front() {
            if response.merged {
                state.merges_performed += 1;
            }
            return Ok(response);
        }

        let performed = state.merges_performed;
        let pull = state
            .pulls
            .get_mut(&number)
            .ok_or_else(|| CollaboratorError::NotFound(format!("pull request #{number}")))?;

        if pull.state != PullState::Open {
            return Err(CollaboratorError::Api {
                status: 405,
                message: "Pull Request is not mergeable".to_string(),
            });
        }
        if pull.head_sha != request.expected_head_sha {
            return Err(CollaboratorError::Api {
                status: 409,
                message: "Head branch was modified. Review and try the merge again.".to_string(),
            });
        }

        let sha = format!("{:0>8}{}", number, performed + 1);
        pull.state = PullState::Merged;
        pull.merge_commit_sha = Some(sha.clone());
        state.merges_performed += 1;

        Ok(MergeResponse {
            merged: true,
            sha: Some(sha),
            message: Some("Pull Request successfully merged".to_string()),
        })
    }

    async fn list_open_pull_requests(&self) -> Result<Vec<OpenPullRef>, CollaboratorError> {
        self.script.gate("list_open_pull_requests").await?;
        Ok(self
            .state()
            .pulls
            .values()
            .filter(|p| p.state == PullState::Open)
            .map(|p| OpenPullRef {
                number: p.number,
                head_ref: p.head_ref.clone(),
                base_ref: p.base_ref.clone(),
            })
            .collect())
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool, CollaboratorError> {
        self.script.gate("branch_exists").await?;
        Ok(self.state().branches.contains_key(branch))
    }

    async fn delete_branch(&self, branch: &str) -> Result<(), CollaboratorError> {
        self.script.gate("delete_branch").await?;
        match self.state().branches.remove(branch) {
            Some(_) => Ok(()),
            None => Err(CollaboratorError::NotFound(format!("branch '{branch}'"))),
        }
    }

    async fn create_branch(&self, branch: &str, sha: &str) -> Result<(), CollaboratorError> {
        self.script.gate("create_branch").await?;
        self.state().branches.insert(branch.to_string(), sha.to_string());
        Ok(())
    }

    async fn add_comment(&self, issue: IssueNumber, body: &str) -> Result<u64, CollaboratorError> {
        self.script.gate("add_comment").await?;
        let mut state = self.state();
        state.next_comment_id += 1;
        let id = state.next_comment_id;
        state.comments.insert(id, (issue, body.to_string()));
        Ok(id)
    }

    async fn comment_exists(&self, comment_id: u64) -> Result<bool, CollaboratorError> {
        self.script.gate("comment_exists").await?;
        Ok(self.state().comments.contains_key(&comment_id))
    }

    async fn close_issue(&self, issue: IssueNumber) -> Result<(), CollaboratorError> {
        self.script.gate("close_issue").await?;
        let mut state = self.state();
        if !state.issues.contains_key(&issue) {
            return Err(CollaboratorError::NotFound(format!("issue #{issue}")));
        }
        if !state.sticky_open_issues.contains(&issue) {
            state.issues.insert(issue, IssueState::Closed);
        }
        Ok(())
    }

    async fn reopen_issue(&self, issue: IssueNumber) -> Result<(), CollaboratorError> {
        self.script.gate("reopen_issue").await?;
        self.state().issues.insert(issue, IssueState::Open);
        Ok(())
    }

    async fn get_issue_state(&self, issue: IssueNumber) -> Result<IssueState, CollaboratorError> {
        self.script.gate("get_issue_state").await?;
        self.state()
            .issues
            .get(&issue)
            .copied()
            .ok_or_else(|| CollaboratorError::NotFound(format!("issue #{issue}")))
    }
}

/// CI provider with a fixed history
#[derive(Debug, Default)]
pub struct MockCiProvider {
    typical: Mutex<Option<Duration>>,
    statuses: Mutex<HashMap<String, PipelineStatus>>,
    script: ScriptHandle,
}

impl MockCiProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_typical_duration(duration: Duration) -> Self {
        let provider = Self::default();
        *provider.typical.lock().unwrap_or_else(|e| e.into_inner()) = Some(duration);
        provider
    }

    pub fn set_status(&self, sha: &str, status: PipelineStatus) {
        self.statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(sha.to_string(), status);
    }

    pub fn fail_always(&self, operation: &str, error: CollaboratorError) {
        self.script
            .with(|s| s.always_fail.insert(operation.to_string(), error));
    }
}

#[async_trait]
impl CiProvider for MockCiProvider {
    async fn pipeline_status(&self, sha: &str) -> Result<PipelineStatus, CollaboratorError> {
        self.script.gate("pipeline_status").await?;
        Ok(self
            .statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(sha)
            .cloned()
            .unwrap_or(PipelineStatus {
                state: PipelineState::Unknown,
                started_at: None,
            }))
    }

    async fn typical_duration(&self, _branch: &str) -> Result<Option<Duration>, CollaboratorError> {
        self.script.gate("typical_duration").await?;
        Ok(*self.typical.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

#[derive(Debug, Default)]
struct DeployState {
    triggered: Vec<DeploymentRequest>,
    states: HashMap<u64, DeploymentState>,
    report_as: Option<DeploymentState>,
}

/// Deployer that accepts everything and remembers it
#[derive(Debug, Default)]
pub struct MockDeployer {
    state: Mutex<DeployState>,
    script: ScriptHandle,
}

impl MockDeployer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every status read reports this state from now on
    pub fn report_status(&self, state: DeploymentState) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).report_as = Some(state);
    }

    pub fn triggered(&self) -> Vec<DeploymentRequest> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).triggered.clone()
    }

    pub fn state_of(&self, id: u64) -> Option<DeploymentState> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .states
            .get(&id)
            .copied()
    }

    pub fn fail_next(&self, operation: &str, error: CollaboratorError) {
        self.script.with(|s| {
            s.failures
                .entry(operation.to_string())
                .or_default()
                .push_back(error)
        });
    }

    pub fn fail_always(&self, operation: &str, error: CollaboratorError) {
        self.script
            .with(|s| s.always_fail.insert(operation.to_string(), error));
    }

    pub fn call_count(&self, operation: &str) -> u32 {
        self.script
            .with(|s| s.calls.get(operation).copied().unwrap_or(0))
    }
}

#[async_trait]
impl Deployer for MockDeployer {
    async fn trigger(
        &self,
        request: &DeploymentRequest,
    ) -> Result<DeploymentHandle, CollaboratorError> {
        self.script.gate("trigger").await?;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.triggered.push(request.clone());
        let id = state.triggered.len() as u64;
        state.states.insert(id, DeploymentState::Queued);
        Ok(DeploymentHandle {
            id,
            environment: request.environment.clone(),
        })
    }

    async fn status(
        &self,
        handle: &DeploymentHandle,
    ) -> Result<DeploymentState, CollaboratorError> {
        self.script.gate("status").await?;
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(forced) = state.report_as {
            return Ok(forced);
        }
        state
            .states
            .get(&handle.id)
            .copied()
            .ok_or_else(|| CollaboratorError::NotFound(format!("deployment {}", handle.id)))
    }

    async fn deactivate(
        &self,
        handle: &DeploymentHandle,
        _reason: &str,
    ) -> Result<(), CollaboratorError> {
        self.script.gate("deactivate").await?;
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .states
            .insert(handle.id, DeploymentState::Inactive);
        Ok(())
    }
}

/// Notifier that records every message per channel
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, NotificationMessage)>>,
    broken_channels: Mutex<HashSet<String>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn break_channel(&self, channel: &str) {
        self.broken_channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(channel.to_string());
    }

    pub fn sent(&self) -> Vec<(String, NotificationMessage)> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(
        &self,
        channel: &str,
        message: &NotificationMessage,
    ) -> Result<DeliveryReceipt, CollaboratorError> {
        if self
            .broken_channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(channel)
        {
            return Err(CollaboratorError::Transport(format!("channel '{channel}' unreachable")));
        }
        let mut sent = self.sent.lock().unwrap_or_else(|e| e.into_inner());
        sent.push((channel.to_string(), message.clone()));
        Ok(DeliveryReceipt {
            channel: channel.to_string(),
            id: Some(sent.len().to_string()),
        })
    }

    async fn delivery_status(
        &self,
        receipt: &DeliveryReceipt,
    ) -> Result<DeliveryStatus, CollaboratorError> {
        let delivered = self
            .sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|(channel, _)| *channel == receipt.channel);
        Ok(if delivered {
            DeliveryStatus::Delivered
        } else {
            DeliveryStatus::Failed
        })
    }
}

/// Open pull request from `feature/<number>` into `main`, ready to merge
pub fn ready_pull_request(number: PullNumber) -> PullRequestSnapshot {
    PullRequestSnapshot {
        number,
        title: format!("Change #{number}"),
        body: None,
        state: PullState::Open,
        draft: false,
        mergeable: Some(true),
        head_ref: format!("feature/{number}"),
        head_sha: format!("head{number:04}"),
        base_ref: "main".to_string(),
        merge_commit_sha: None,
        labels: Vec::new(),
        stats: ChangeStats {
            files_changed: 3,
            additions: 40,
            deletions: 12,
            commits: 2,
        },
    }
}

pub fn approval(reviewer: &str) -> Review {
    Review {
        reviewer: reviewer.to_string(),
        state: ReviewState::Approved,
        submitted_at: None,
    }
}

pub fn passing_check(name: &str) -> CheckRun {
    CheckRun {
        name: name.to_string(),
        status: CheckStatus::Completed,
        conclusion: Some(CheckConclusion::Success),
        started_at: None,
        completed_at: None,
    }
}
