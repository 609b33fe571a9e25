use anyhow::Result;

use super::{connect, live_collaborators, load_candidate};
use crate::config::MergeConductorConfig;
use crate::merge::{Orchestrator, OrchestratorPaths, ReadinessVerdict, RequirementStatus};

pub struct CheckCommand {
    pub pr: u64,
}

impl CheckCommand {
    pub fn new(pr: u64) -> Self {
        Self { pr }
    }

    /// `Ok(true)` when the pull request could be merged right now
    pub async fn execute(&self, config: &MergeConductorConfig) -> Result<bool> {
        let github = connect(config)?;
        let candidate = load_candidate(github.as_ref(), self.pr).await?;
        let orchestrator = Orchestrator::new(
            config.merge.clone(),
            live_collaborators(config, github),
            OrchestratorPaths::default(),
        )?;

        println!(
            "🔍 Checking #{} {} ({} → {})",
            candidate.id, candidate.title, candidate.source_branch, candidate.target_branch
        );
        println!();
        let verdict = orchestrator.evaluate(&candidate).await;
        print!("{}", render_verdict(&verdict));
        Ok(verdict.can_merge)
    }
}

fn status_icon(status: RequirementStatus) -> &'static str {
    match status {
        RequirementStatus::Satisfied => "✅",
        RequirementStatus::Pending => "⏳",
        RequirementStatus::Failed => "❌",
        RequirementStatus::Unknown => "❔",
    }
}

pub fn render_verdict(verdict: &ReadinessVerdict) -> String {
    let mut out = String::new();
    for requirement in &verdict.requirements {
        let optional = if requirement.mandatory { "" } else { " (optional)" };
        out.push_str(&format!(
            "   {} {}{}: {}\n",
            status_icon(requirement.status),
            requirement.kind.as_str(),
            optional,
            requirement.description
        ));
        if let Some(error) = &requirement.error {
            out.push_str(&format!("      ⚠️  {error}\n"));
        }
    }
    out.push('\n');

    if verdict.can_merge {
        out.push_str("🚀 Ready to merge\n");
    } else {
        out.push_str("🚧 Not ready:\n");
        for issue in &verdict.blocking_issues {
            let hint = if issue.auto_resolvable { " (resolves on its own)" } else { "" };
            out.push_str(&format!("   → [{}] {}{}\n", issue.code, issue.message, hint));
        }
        match verdict.estimated_ready_at {
            Some(at) => {
                let at = at.format("%Y-%m-%d %H:%M:%S UTC");
                out.push_str(&format!("⏱️  Estimated ready at {at}\n"))
            }
            None => out.push_str("⏱️  No readiness estimate\n"),
        }
    }
    for warning in &verdict.warnings {
        out.push_str(&format!("💡 {warning}\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::{Requirement, RequirementKind};
    use chrono::Utc;

    #[test]
    fn test_render_lists_blockers_and_estimate() {
        let now = Utc::now();
        let verdict = ReadinessVerdict::from_requirements(
            vec![
                Requirement::new(
                    RequirementKind::Approvals,
                    RequirementStatus::Satisfied,
                    "2 approvals",
                    now,
                ),
                Requirement::new(
                    RequirementKind::CiChecks,
                    RequirementStatus::Pending,
                    "1 check running",
                    now,
                )
                .with_wait_estimate(Some(std::time::Duration::from_secs(120))),
            ],
            now,
        );

        let rendered = render_verdict(&verdict);
        assert!(rendered.contains("✅ approvals"));
        assert!(rendered.contains("⏳ ci-checks"));
        assert!(rendered.contains("Not ready"));
        assert!(rendered.contains("Estimated ready at"));
    }
}
