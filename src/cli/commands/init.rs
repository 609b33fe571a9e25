use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::config::{MergeConductorConfig, CONFIG_FILES};
use crate::external::{ChannelKind, NotificationChannelConfig};

pub struct InitCommand {
    pub force: bool,
    pub dir: PathBuf,
}

impl InitCommand {
    pub fn new(force: bool) -> Self {
        Self {
            force,
            dir: PathBuf::from("."),
        }
    }

    pub fn in_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn execute(&self) -> Result<PathBuf> {
        let path = self.dir.join(CONFIG_FILES[0]);
        if path.exists() && !self.force {
            anyhow::bail!(
                "{} already exists. Use --force to overwrite it.",
                path.display()
            );
        }

        let mut config = MergeConductorConfig::default();
        config.github.owner = std::env::var("GITHUB_OWNER").unwrap_or_default();
        config.github.repo = std::env::var("GITHUB_REPO").unwrap_or_default();
        config.notifications.channels.push(NotificationChannelConfig {
            name: "log".to_string(),
            kind: ChannelKind::Log,
        });
        config.merge.pipeline.notify_channels = vec!["log".to_string()];

        config.save_to_file(&path)?;
        println!("✅ Wrote {}", path.display());
        if config.github.owner.is_empty() {
            println!("💡 Set github.owner and github.repo before running 'merge-conductor land'");
        }
        Ok(path)
    }
}
