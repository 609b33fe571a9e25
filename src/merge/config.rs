//! Orchestrator configuration
//!
//! Passed explicitly to [`Orchestrator::new`](super::Orchestrator::new) and
//! loaded as the `[merge]` section of `merge-conductor.toml`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

use super::pipeline::ActionKind;
use super::types::RequirementKind;
use crate::external::MergeStrategy;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("timeout '{0}' must be greater than zero")]
    ZeroTimeout(&'static str),
    #[error("action '{0}' is configured more than once")]
    DuplicateAction(String),
    #[error("invalid title pattern '{pattern}': {message}")]
    InvalidTitlePattern { pattern: String, message: String },
    #[error("max_merge_attempts must be at least 1")]
    NoMergeAttempts,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub strategy: MergeStrategy,
    /// Identity written into commit messages and comments
    pub actor: String,
    pub max_merge_attempts: u32,
    pub requirements: RequirementsConfig,
    pub pipeline: PipelineConfig,
    pub checkpoint: CheckpointConfig,
    pub timeouts: TimeoutConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            strategy: MergeStrategy::Squash,
            actor: "merge-conductor".to_string(),
            max_merge_attempts: 3,
            requirements: RequirementsConfig::default(),
            pipeline: PipelineConfig::default(),
            checkpoint: CheckpointConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.timeouts.validate()?;

        if self.max_merge_attempts == 0 {
            return Err(ConfigError::NoMergeAttempts);
        }

        let mut seen = HashSet::new();
        for action in &self.pipeline.actions {
            if !seen.insert(action.kind) {
                return Err(ConfigError::DuplicateAction(action.kind.as_str().to_string()));
            }
        }

        if let Some(pattern) = &self.requirements.title_pattern {
            Regex::new(pattern).map_err(|e| ConfigError::InvalidTitlePattern {
                pattern: pattern.clone(),
                message: e.to_string(),
            })?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequirementsConfig {
    pub required_approvals: u32,
    /// Requirements that only produce warnings
    pub optional: Vec<RequirementKind>,
    pub blocked_labels: Vec<String>,
    pub title_pattern: Option<String>,
    pub require_work_item: bool,
    /// Used for pending CI when there is no pipeline history
    pub ci_wait_estimate_secs: u64,
    /// How long the host usually needs to compute mergeability
    pub mergeability_wait_secs: u64,
}

impl Default for RequirementsConfig {
    fn default() -> Self {
        Self {
            required_approvals: 1,
            optional: Vec::new(),
            blocked_labels: vec!["do-not-merge".to_string(), "wip".to_string()],
            title_pattern: None,
            require_work_item: false,
            ci_wait_estimate_secs: 600,
            mergeability_wait_secs: 15,
        }
    }
}

impl RequirementsConfig {
    pub fn is_mandatory(&self, kind: RequirementKind) -> bool {
        !self.optional.contains(&kind)
    }
}

/// One pipeline entry. `kind` is required, the rest fall back to
/// "enabled, non-critical, one attempt, run last".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionConfig {
    pub kind: ActionKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_order")]
    pub order: u32,
    #[serde(default)]
    pub critical: bool,
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
}

fn default_enabled() -> bool {
    true
}

fn default_order() -> u32 {
    100
}

fn default_retry_budget() -> u32 {
    1
}

impl ActionConfig {
    pub fn new(kind: ActionKind, order: u32, critical: bool, retry_budget: u32) -> Self {
        Self {
            kind,
            enabled: true,
            order,
            critical,
            retry_budget,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub actions: Vec<ActionConfig>,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter: bool,
    /// Channel names the notify action sends to
    pub notify_channels: Vec<String>,
    pub deploy_environment: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let mut deploy = ActionConfig::new(ActionKind::DeployTrigger, 30, true, 2);
        deploy.enabled = false;

        Self {
            actions: vec![
                ActionConfig::new(ActionKind::BranchDelete, 10, false, 3),
                ActionConfig::new(ActionKind::IssueClose, 20, true, 3),
                deploy,
                ActionConfig::new(ActionKind::Notify, 40, false, 2),
                ActionConfig::new(ActionKind::Cleanup, 50, false, 1),
            ],
            base_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            jitter: true,
            notify_channels: Vec::new(),
            deploy_environment: "production".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn action(&self, kind: ActionKind) -> Option<&ActionConfig> {
        self.actions.iter().find(|a| a.kind == kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub verify_issue_closure: bool,
    pub verify_branch_cleanup: bool,
    pub verify_deployment: bool,
    pub verify_notifications: bool,
    pub rollback_on_failure: bool,
    /// Demand a finished, successful deployment instead of an accepted one
    pub require_deployment_success: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            verify_issue_closure: true,
            verify_branch_cleanup: true,
            verify_deployment: true,
            verify_notifications: false,
            rollback_on_failure: true,
            require_deployment_success: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub call_timeout_secs: u64,
    pub readiness_timeout_secs: u64,
    pub total_budget_secs: u64,
    pub poll_interval_secs: u64,
    pub min_poll_secs: u64,
    pub max_poll_secs: u64,
    /// Pause before retrying a merge that failed in transport
    pub transport_backoff_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: 30,
            readiness_timeout_secs: 1_800,
            total_budget_secs: 3_600,
            poll_interval_secs: 30,
            min_poll_secs: 5,
            max_poll_secs: 300,
            transport_backoff_secs: 5,
        }
    }
}

impl TimeoutConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("call_timeout_secs", self.call_timeout_secs),
            ("readiness_timeout_secs", self.readiness_timeout_secs),
            ("total_budget_secs", self.total_budget_secs),
            ("poll_interval_secs", self.poll_interval_secs),
            ("min_poll_secs", self.min_poll_secs),
            ("max_poll_secs", self.max_poll_secs),
        ];
        match checks.iter().find(|(_, value)| *value == 0) {
            Some((name, _)) => Err(ConfigError::ZeroTimeout(*name)),
            None => Ok(()),
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn total_budget(&self) -> Duration {
        Duration::from_secs(self.total_budget_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn min_poll(&self) -> Duration {
        Duration::from_secs(self.min_poll_secs)
    }

    pub fn max_poll(&self) -> Duration {
        Duration::from_secs(self.max_poll_secs)
    }

    pub fn transport_backoff(&self) -> Duration {
        Duration::from_secs(self.transport_backoff_secs)
    }
}
