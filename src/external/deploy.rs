//! Deployment trigger abstraction

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::CollaboratorError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRequest {
    pub commit_sha: String,
    pub environment: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentHandle {
    pub id: u64,
    pub environment: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentState {
    Pending,
    Queued,
    InProgress,
    Succeeded,
    Failed,
    Inactive,
    Unknown,
}

impl From<&str> for DeploymentState {
    fn from(state: &str) -> Self {
        match state {
            "pending" => DeploymentState::Pending,
            "queued" => DeploymentState::Queued,
            "in_progress" => DeploymentState::InProgress,
            "success" => DeploymentState::Succeeded,
            "failure" | "error" => DeploymentState::Failed,
            "inactive" => DeploymentState::Inactive,
            _ => DeploymentState::Unknown,
        }
    }
}

#[async_trait]
pub trait Deployer: Send + Sync {
    /// Ask for a deployment. Success means the request was accepted, not that
    /// the deployment finished.
    async fn trigger(
        &self,
        request: &DeploymentRequest,
    ) -> Result<DeploymentHandle, CollaboratorError>;

    async fn status(&self, handle: &DeploymentHandle) -> Result<DeploymentState, CollaboratorError>;

    /// Compensation used on rollback
    async fn deactivate(
        &self,
        handle: &DeploymentHandle,
        reason: &str,
    ) -> Result<(), CollaboratorError>;
}
