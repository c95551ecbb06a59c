mod commands;
mod logging;

use std::{path::PathBuf, process::ExitCode};

use anyhow::Result;
use clap::{Parser, Subcommand};
use scoresnap::RebuildError;

use crate::commands::{
    config::ConfigArgs, publish::PublishArgs, rebuild::RebuildArgs, snapshot::SnapshotArgs,
};

#[derive(Parser)]
#[command(author, version, about = "Leaderboard snapshot rebuild CLI")]
struct Cli {
    /// Path to a TOML configuration file. Built-in defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rebuild the high score snapshot from the score update log
    Rebuild(RebuildArgs),
    /// Append score updates to the score update log
    Publish(PublishArgs),
    /// Show the current snapshot table
    Snapshot(SnapshotArgs),
    /// Print or save the effective configuration
    Config(ConfigArgs),
}

fn main() -> ExitCode {
    let Cli { config, command } = Cli::parse();

    match run(config, command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}

fn run(config_path: Option<PathBuf>, command: Commands) -> Result<()> {
    match command {
        Commands::Rebuild(args) => {
            let config = commands::load_config(config_path, args.overrides())?;
            logging::init(config.log_dir.as_deref())?;
            scoresnap::telemetry::describe();
            commands::rebuild::execute(&config)
        }
        Commands::Publish(args) => {
            let config = commands::load_config(config_path, args.connection.clone().into())?;
            logging::init(config.log_dir.as_deref())?;
            commands::publish::execute(&config, args)
        }
        Commands::Snapshot(args) => {
            let config = commands::load_config(config_path, args.connection.clone().into())?;
            logging::init(config.log_dir.as_deref())?;
            commands::snapshot::execute(&config, args)
        }
        Commands::Config(args) => {
            let config = commands::load_config(config_path, args.overrides())?;
            commands::config::execute(&config, args)
        }
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<RebuildError>())
        .map(RebuildError::exit_code)
        .unwrap_or(1)
}
