use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;

use merge_conductor::cli::commands::{CheckCommand, ConfigCommand, InitCommand, LandCommand};
use merge_conductor::cli::{Cli, Commands};
use merge_conductor::config::MergeConductorConfig;
use merge_conductor::telemetry::init_telemetry;

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    if let Commands::Init { force } = cli.command {
        InitCommand::new(force).execute()?;
        return Ok(ExitCode::SUCCESS);
    }

    MergeConductorConfig::load_env_file()?;
    let config = MergeConductorConfig::load()?;
    let mut observability = config.observability.clone();
    observability.json |= cli.json_logs;
    init_telemetry(&observability)?;

    let succeeded = match cli.command {
        Commands::Land {
            pr,
            strategy,
            dry_run,
            no_wait,
            verbose,
        } => tokio::runtime::Runtime::new()?.block_on(async {
            LandCommand::new(pr, strategy, dry_run, no_wait, verbose)
                .execute(&config)
                .await
        })?,
        Commands::Check { pr } => tokio::runtime::Runtime::new()?
            .block_on(async { CheckCommand::new(pr).execute(&config).await })?,
        Commands::Config => {
            ConfigCommand.execute(&config)?;
            true
        }
        Commands::Init { .. } => true,
    };

    Ok(if succeeded { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
