use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::external::NotificationChannelConfig;
use crate::merge::OrchestratorConfig;

/// Configuration file names, highest precedence last
pub const CONFIG_FILES: [&str; 2] = ["merge-conductor.toml", ".merge-conductor-rc"];

/// Main configuration structure for merge-conductor
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct MergeConductorConfig {
    /// GitHub configuration
    pub github: GitHubConfig,
    /// Orchestration settings
    pub merge: OrchestratorConfig,
    /// Named notification channels
    pub notifications: NotificationsConfig,
    /// Logging settings
    pub observability: ObservabilityConfig,
    /// Where artifacts, the audit log and lock files live
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GitHubConfig {
    /// GitHub API token (can be set via env var)
    pub token: Option<String>,
    /// Repository owner
    pub owner: String,
    /// Repository name
    pub repo: String,
    /// Alternative API root, e.g. for GitHub Enterprise
    pub api_base: Option<String>,
    /// Rate limiting settings
    pub rate_limit: RateLimitConfig,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            token: None,
            owner: String::new(),
            repo: String::new(),
            api_base: None,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests per hour limit
    pub requests_per_hour: u32,
    /// Burst capacity
    pub burst_capacity: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_hour: 5000,
            burst_capacity: 100,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct NotificationsConfig {
    pub channels: Vec<NotificationChannelConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level, overridden by RUST_LOG
    pub log_level: String,
    /// JSON log lines instead of human-readable output
    pub json: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PathsConfig {
    pub artifacts_dir: String,
    /// JSON-lines audit log of orchestration events
    pub audit_log: Option<String>,
    /// Directory for cross-process candidate locks
    pub lock_dir: Option<String>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            artifacts_dir: ".merge-conductor/artifacts".to_string(),
            audit_log: Some(".merge-conductor/events.jsonl".to_string()),
            lock_dir: Some(".merge-conductor/locks".to_string()),
        }
    }
}

impl PathsConfig {
    pub fn artifacts_dir(&self) -> PathBuf {
        PathBuf::from(&self.artifacts_dir)
    }

    pub fn lock_dir(&self) -> Option<PathBuf> {
        self.lock_dir.as_ref().map(PathBuf::from)
    }
}

impl MergeConductorConfig {
    /// Load configuration from the current directory
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("."))
    }

    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (merge-conductor.toml, .merge-conductor-rc) in `dir`
    /// 3. Environment variables (MERGE_CONDUCTOR_MERGE__STRATEGY=merge)
    pub fn load_from(dir: &Path) -> Result<Self> {
        let mut builder = Config::builder();

        for name in CONFIG_FILES {
            let path = dir.join(name);
            if path.exists() {
                builder = builder.add_source(File::from(path).format(config::FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("MERGE_CONDUCTOR")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut loaded: MergeConductorConfig = builder
            .build()?
            .try_deserialize()
            .context("Failed to parse merge-conductor configuration")?;

        if loaded.github.token.is_none() {
            loaded.github.token = std::env::var("GITHUB_TOKEN")
                .or_else(|_| std::env::var("MERGE_CONDUCTOR_GITHUB_TOKEN"))
                .ok();
        }

        loaded.merge.validate()?;
        Ok(loaded)
    }

    /// Save configuration to file. The token is never written out.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut to_save = self.clone();
        to_save.github.token = None;
        let toml_content = toml::to_string_pretty(&to_save)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }

    /// `owner/repo`, failing with a hint when either is missing
    pub fn repository(&self) -> Result<(String, String)> {
        if self.github.owner.is_empty() || self.github.repo.is_empty() {
            anyhow::bail!(
                "GitHub repository not configured. Set github.owner and github.repo in \
                 merge-conductor.toml or MERGE_CONDUCTOR_GITHUB__OWNER / \
                 MERGE_CONDUCTOR_GITHUB__REPO"
            );
        }
        Ok((self.github.owner.clone(), self.github.repo.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{ChannelKind, MergeStrategy};
    use crate::merge::ActionKind;

    #[test]
    fn test_defaults_without_any_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = MergeConductorConfig::load_from(dir.path()).unwrap();

        assert_eq!(config.merge.strategy, MergeStrategy::Squash);
        assert_eq!(config.merge.timeouts.total_budget_secs, 3600);
        assert_eq!(config.github.rate_limit.requests_per_hour, 5000);
        assert!(config.notifications.channels.is_empty());
    }

    #[test]
    fn test_file_overrides_nested_sections() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("merge-conductor.toml"),
            r#"
[github]
owner = "acme"
repo = "widgets"

[merge]
strategy = "rebase"
actor = "release-bot"

[merge.timeouts]
readiness_timeout_secs = 600

[[notifications.channels]]
name = "team"
type = "webhook"
url = "https://hooks.example.com/merge"

[[notifications.channels]]
name = "audit"
type = "log"
"#,
        )
        .unwrap();

        let config = MergeConductorConfig::load_from(dir.path()).unwrap();
        assert_eq!(config.repository().unwrap(), ("acme".to_string(), "widgets".to_string()));
        assert_eq!(config.merge.strategy, MergeStrategy::Rebase);
        assert_eq!(config.merge.actor, "release-bot");
        assert_eq!(config.merge.timeouts.readiness_timeout_secs, 600);
        assert_eq!(config.merge.timeouts.call_timeout_secs, 30);
        assert_eq!(config.notifications.channels.len(), 2);
        assert_eq!(
            config.notifications.channels[0].kind,
            ChannelKind::Webhook {
                url: "https://hooks.example.com/merge".to_string()
            }
        );
        assert!(config.merge.pipeline.action(ActionKind::IssueClose).is_some());
    }

    #[test]
    fn test_invalid_merge_section_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("merge-conductor.toml"),
            "[merge.timeouts]\ntotal_budget_secs = 0\n",
        )
        .unwrap();

        assert!(MergeConductorConfig::load_from(dir.path()).is_err());
    }

    #[test]
    fn test_saved_config_loads_back_without_token() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = MergeConductorConfig::default();
        config.github.owner = "acme".to_string();
        config.github.repo = "widgets".to_string();
        config.github.token = Some("ghp_secret".to_string());

        let path = dir.path().join("merge-conductor.toml");
        config.save_to_file(&path).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(!written.contains("ghp_secret"));

        let loaded = MergeConductorConfig::load_from(dir.path()).unwrap();
        assert_eq!(loaded.github.owner, "acme");
        assert_eq!(loaded.merge.pipeline.actions.len(), config.merge.pipeline.actions.len());
    }

    #[test]
    fn test_missing_repository_has_actionable_message() {
        let config = MergeConductorConfig::default();
        let err = config.repository().unwrap_err().to_string();
        assert!(err.contains("github.owner"));
    }
}
