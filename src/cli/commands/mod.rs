use anyhow::{Context, Result};
use std::sync::Arc;

use crate::config::MergeConductorConfig;
use crate::events::{EventSink, FanoutEventSink, JsonlEventSink, TracingEventSink};
use crate::external::{ChannelNotifier, GitHost};
use crate::fs::{FileSystemOperations, StandardFileSystem};
use crate::github::GitHubClient;
use crate::merge::{Collaborators, MergeCandidate, SystemClock};

pub mod check;
pub mod config;
pub mod init;
pub mod land;

pub use check::CheckCommand;
pub use config::ConfigCommand;
pub use init::InitCommand;
pub use land::LandCommand;

pub fn connect(config: &MergeConductorConfig) -> Result<Arc<GitHubClient>> {
    print!("🔄 Connecting to GitHub... ");
    std::io::Write::flush(&mut std::io::stdout())?;

    match GitHubClient::new(&config.github) {
        Ok(client) => {
            println!("✅ {}/{}", client.owner(), client.repo());
            Ok(Arc::new(client))
        }
        Err(e) => {
            println!("❌");
            Err(anyhow::anyhow!("{e}"))
        }
    }
}

/// Live collaborators: GitHub for host, CI and deployments, configured
/// notification channels, and the tracing plus audit-log event sinks
pub fn live_collaborators(
    config: &MergeConductorConfig,
    github: Arc<GitHubClient>,
) -> Collaborators {
    let fs: Arc<dyn FileSystemOperations> = Arc::new(StandardFileSystem);

    let mut sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(TracingEventSink)];
    if let Some(path) = &config.paths.audit_log {
        sinks.push(Arc::new(JsonlEventSink::new(fs.clone(), path.clone())));
    }

    Collaborators {
        host: github.clone(),
        ci: github.clone(),
        deployer: github.clone(),
        notifier: Arc::new(ChannelNotifier::new(
            config.notifications.channels.clone(),
            github.clone(),
            config.merge.timeouts.call_timeout(),
        )),
        fs,
        events: Arc::new(FanoutEventSink::new(sinks)),
        clock: Arc::new(SystemClock),
    }
}

pub async fn load_candidate(host: &dyn GitHost, pr: u64) -> Result<MergeCandidate> {
    let snapshot = host
        .get_pull_request(pr)
        .await
        .with_context(|| format!("Failed to load pull request #{pr}"))?;
    Ok(MergeCandidate::from_snapshot(&snapshot))
}
