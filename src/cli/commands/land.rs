use anyhow::Result;
use std::sync::Arc;

use super::{connect, live_collaborators, load_candidate};
use crate::config::MergeConductorConfig;
use crate::events::TracingEventSink;
use crate::external::mocks::{InMemoryGitHost, MockDeployer, RecordingNotifier};
use crate::external::{GitHost, IssueState, MergeStrategy};
use crate::fs::StandardFileSystem;
use crate::github::GitHubClient;
use crate::merge::{
    ActionStatus, Collaborators, Completion, MergeCandidate, OrchestrationReport, Orchestrator,
    OrchestratorConfig, OrchestratorPaths, SystemClock,
};
use crate::shutdown::ShutdownCoordinator;

pub struct LandCommand {
    pub pr: u64,
    pub strategy: Option<MergeStrategy>,
    pub dry_run: bool,
    pub no_wait: bool,
    pub verbose: bool,
}

impl LandCommand {
    pub fn new(
        pr: u64,
        strategy: Option<MergeStrategy>,
        dry_run: bool,
        no_wait: bool,
        verbose: bool,
    ) -> Self {
        Self {
            pr,
            strategy,
            dry_run,
            no_wait,
            verbose,
        }
    }

    fn orchestrator_config(&self, base: &OrchestratorConfig) -> OrchestratorConfig {
        let mut config = base.clone();
        if let Some(strategy) = self.strategy {
            config.strategy = strategy;
        }
        if self.no_wait || self.dry_run {
            config.timeouts.readiness_timeout_secs = 1;
            config.timeouts.min_poll_secs = 1;
        }
        config
    }

    /// `Ok(true)` when the run ended in `Done(success)`
    pub async fn execute(&self, config: &MergeConductorConfig) -> Result<bool> {
        if self.dry_run {
            println!("🚀 MERGE-CONDUCTOR LAND #{} (DRY RUN)", self.pr);
        } else {
            println!("🚀 MERGE-CONDUCTOR LAND #{}", self.pr);
        }
        println!("==========================================");

        let github = connect(config)?;
        let candidate = load_candidate(github.as_ref(), self.pr).await?;
        println!(
            "📋 #{} {} ({} → {})",
            candidate.id, candidate.title, candidate.source_branch, candidate.target_branch
        );
        if let Some(issue) = candidate.work_item {
            println!("🔗 Work item: #{issue}");
        }
        println!();

        let orchestrator_config = self.orchestrator_config(&config.merge);
        let (collaborators, paths) = if self.dry_run {
            dry_run_collaborators(&github, &candidate).await?
        } else {
            (
                live_collaborators(config, github),
                OrchestratorPaths {
                    artifacts_dir: config.paths.artifacts_dir(),
                    lock_dir: config.paths.lock_dir(),
                },
            )
        };
        let orchestrator = Orchestrator::new(orchestrator_config, collaborators, paths)?;

        let shutdown = ShutdownCoordinator::new();
        shutdown.install_signal_handlers()?;
        let report = orchestrator.run(candidate, shutdown.token()).await?;

        print!("{}", self.render(&report));
        Ok(report.is_success())
    }

    pub fn render(&self, report: &OrchestrationReport) -> String {
        let mut out = String::new();
        if self.verbose {
            out.push_str("🔧 Transitions:\n");
            for t in &report.transitions {
                out.push_str(&format!(
                    "   {:>7}ms {} → {}: {}\n",
                    t.elapsed_ms, t.from, t.to, t.reason
                ));
            }
            out.push('\n');
        }

        if let Some(merge) = &report.merge {
            if let Some(commit) = &merge.merge_commit {
                let how = if merge.adopted { "already merged as" } else { "merged as" };
                out.push_str(&format!("🔀 {how} {commit}\n"));
            }
        }
        if let Some(pipeline) = &report.pipeline {
            for action in &pipeline.actions {
                let icon = match action.status {
                    ActionStatus::Completed => "✅",
                    ActionStatus::Skipped => "⏭️ ",
                    ActionStatus::Failed => "❌",
                    _ => "⏸️ ",
                };
                out.push_str(&format!("   {icon} {}", action.kind));
                if let Some(error) = &action.last_error {
                    if action.status == ActionStatus::Failed {
                        out.push_str(&format!(": {error}"));
                    }
                }
                out.push('\n');
            }
        }
        for step in &report.outcome.rollback {
            let icon = if step.success { "↩️ " } else { "⚠️ " };
            out.push_str(&format!("   {icon} rollback {}: {}\n", step.action, step.description));
        }

        out.push('\n');
        match (report.state, &report.failure) {
            (crate::merge::OrchestrationState::Done(Completion::Success), _) => {
                out.push_str(&format!(
                    "🎉 Landed #{} in {}ms, next work requested\n",
                    report.candidate_id, report.outcome.timing.total_ms
                ));
            }
            (_, Some(failure)) => {
                let id = report.candidate_id;
                out.push_str(&format!("❌ #{id} not landed: {}\n", failure.message));
            }
            _ => out.push_str(&format!("❌ #{} ended in {}\n", report.candidate_id, report.state)),
        }
        out.push_str(&format!("🧾 Correlation id: {}\n", report.correlation_id));
        out
    }
}

/// Copy what GitHub currently reports about the candidate into an
/// in-memory host, so the whole run can play out without side effects
async fn dry_run_collaborators(
    github: &Arc<GitHubClient>,
    candidate: &MergeCandidate,
) -> Result<(Collaborators, OrchestratorPaths)> {
    let host = InMemoryGitHost::new();
    let snapshot = github.get_pull_request(candidate.id).await?;
    host.set_reviews(candidate.id, github.get_reviews(candidate.id).await?);
    host.set_checks(&snapshot.head_sha, github.get_checks(&snapshot.head_sha).await?);
    if let Some(protection) = github.get_branch_protection(&snapshot.base_ref).await? {
        host.set_protection(&snapshot.base_ref, protection);
    }
    if let Some(issue) = candidate.work_item {
        let state = github.get_issue_state(issue).await.unwrap_or(IssueState::Open);
        host.add_issue(issue, state);
    }
    let head_exists = github.branch_exists(&snapshot.head_ref).await?;
    let head_ref = snapshot.head_ref.clone();
    host.add_pull_request(snapshot);
    if !head_exists {
        host.delete_branch(&head_ref).await?;
    }

    let collaborators = Collaborators {
        host: Arc::new(host),
        ci: github.clone(),
        deployer: Arc::new(MockDeployer::new()),
        notifier: Arc::new(RecordingNotifier::new()),
        fs: Arc::new(StandardFileSystem),
        events: Arc::new(TracingEventSink),
        clock: Arc::new(SystemClock),
    };
    let paths = OrchestratorPaths {
        artifacts_dir: std::env::temp_dir()
            .join(format!("merge-conductor-dry-run-{}", candidate.id)),
        lock_dir: None,
    };
    Ok((collaborators, paths))
}
