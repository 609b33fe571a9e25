//! CI status abstraction
//!
//! The git host already reports individual checks; the CI provider adds the
//! pipeline-level view and, more importantly, how long pipelines usually take
//! so readiness can estimate when pending checks will land.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::CollaboratorError;

/// Status of a CI pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Unknown,
}

impl From<(&str, Option<&str>)> for PipelineState {
    /// Maps a `(status, conclusion)` pair as CI providers report it
    fn from((status, conclusion): (&str, Option<&str>)) -> Self {
        match (status, conclusion) {
            ("queued" | "waiting" | "requested" | "pending", _) => PipelineState::Queued,
            ("in_progress", _) => PipelineState::Running,
            ("completed", Some("success" | "neutral" | "skipped")) => PipelineState::Succeeded,
            ("completed", Some("cancelled")) => PipelineState::Cancelled,
            ("completed", Some(_)) => PipelineState::Failed,
            _ => PipelineState::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub state: PipelineState,
    pub started_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait CiProvider: Send + Sync {
    /// Latest pipeline run for a commit
    async fn pipeline_status(&self, sha: &str) -> Result<PipelineStatus, CollaboratorError>;

    /// Typical wall-clock duration of a successful pipeline on `branch`,
    /// `None` when there is no history to go on
    async fn typical_duration(&self, branch: &str) -> Result<Option<Duration>, CollaboratorError>;
}
