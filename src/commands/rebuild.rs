use anyhow::{Context, Result};
use clap::Args;
use scoresnap::{
    RebuildPipeline,
    config::{Config, ConfigUpdate},
};

use super::ConnectionArgs;

#[derive(Args, Clone, Default)]
pub struct RebuildArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// How long a single poll waits for new records
    #[arg(long)]
    pub poll_timeout_ms: Option<u64>,

    /// Upper bound on records folded into one committed cycle
    #[arg(long)]
    pub max_poll_records: Option<usize>,

    /// Tries per cycle before a commit failure ends the run
    #[arg(long)]
    pub commit_attempts: Option<u32>,

    /// Consecutive empty polls treated as "caught up"
    #[arg(long = "empty-polls")]
    pub empty_polls_to_finish: Option<u32>,
}

impl RebuildArgs {
    pub fn overrides(&self) -> ConfigUpdate {
        ConfigUpdate {
            poll_timeout_ms: self.poll_timeout_ms,
            max_poll_records: self.max_poll_records,
            commit_attempts: self.commit_attempts,
            empty_polls_to_finish: self.empty_polls_to_finish,
            ..ConfigUpdate::from(self.connection.clone())
        }
    }
}

pub fn execute(config: &Config) -> Result<()> {
    println!("Starting snapshot rebuild ...");

    let pipeline =
        RebuildPipeline::connect(config).context("failed to connect rebuild pipeline")?;
    let report = pipeline.run().context("snapshot rebuild failed")?;

    println!(
        "Processed {} record(s) in {} cycle(s); upserted {} row(s) for {} player(s).",
        report.records_polled, report.cycles, report.rows_upserted, report.players
    );
    if !report.parse_failures.is_empty() {
        println!(
            "Skipped {} malformed record(s):",
            report.parse_failures.len()
        );
        for failure in &report.parse_failures {
            println!(
                "  partition {} offset {} key {}: {}",
                failure.partition,
                failure.offset,
                failure.key.as_deref().unwrap_or("<none>"),
                failure.error
            );
        }
    }

    println!("Snapshot rebuild finished.");
    Ok(())
}
