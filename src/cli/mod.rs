use clap::{Parser, Subcommand};

use crate::external::MergeStrategy;

pub mod commands;

#[derive(Parser)]
#[command(name = "merge-conductor")]
#[command(version)]
#[command(about = "Land reviewed pull requests and finish the work around them")]
#[command(long_about = "merge-conductor waits until a pull request is ready, merges it \
                       exactly once, runs post-merge cleanup (branch deletion, issue \
                       closure, deployment, notifications) and verifies that all of it \
                       actually happened. Start with 'merge-conductor check <pr>'.")]
pub struct Cli {
    /// Emit JSON log lines
    #[arg(long, global = true, help = "Write structured JSON logs to stderr")]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Drive a pull request through merge, post-merge actions and verification
    Land {
        /// Pull request number
        pr: u64,
        /// Merge strategy, overriding the configured one
        #[arg(long, help = "merge, squash or rebase")]
        strategy: Option<MergeStrategy>,
        /// Evaluate against live GitHub data but merge and clean up in memory only
        #[arg(long, help = "Show what would happen without changing anything on GitHub")]
        dry_run: bool,
        /// Give up instead of waiting when the pull request is not ready yet
        #[arg(long, help = "Fail immediately when requirements are still pending")]
        no_wait: bool,
        /// Print every state transition
        #[arg(long, short = 'v', help = "Show the full state transition history")]
        verbose: bool,
    },
    /// Evaluate merge readiness without merging
    Check {
        /// Pull request number
        pr: u64,
    },
    /// Write a default merge-conductor.toml
    Init {
        /// Overwrite an existing configuration file
        #[arg(long, help = "Force initialization, overwriting existing configuration")]
        force: bool,
    },
    /// Print the effective configuration
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_land_parses_strategy() {
        let args = ["merge-conductor", "land", "42", "--strategy", "rebase", "--no-wait"];
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command {
            Commands::Land {
                pr, strategy, no_wait, ..
            } => {
                assert_eq!(pr, 42);
                assert_eq!(strategy, Some(MergeStrategy::Rebase));
                assert!(no_wait);
            }
            _ => panic!("expected land"),
        }
    }

    #[test]
    fn test_unknown_strategy_is_rejected() {
        let args = ["merge-conductor", "land", "42", "--strategy", "octopus"];
        assert!(Cli::try_parse_from(args).is_err());
    }
}
