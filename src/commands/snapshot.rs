use anyhow::{Context, Result};
use clap::Args;
use scoresnap::{config::Config, sink};

use super::ConnectionArgs;

#[derive(Args)]
pub struct SnapshotArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Only show the top N players
    #[arg(long)]
    pub limit: Option<usize>,

    /// Emit results as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

pub fn execute(config: &Config, args: SnapshotArgs) -> Result<()> {
    let mut store = sink::open(&config.sink_uri()?, &config.snapshot_table)
        .context("failed to open snapshot store")?;
    let mut rows = store.rows().context("failed to read snapshot rows")?;
    store.close()?;
    if let Some(limit) = args.limit {
        rows.truncate(limit);
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("(no snapshot rows)");
        return Ok(());
    }
    let width = rows
        .iter()
        .map(|row| row.player_id.len())
        .max()
        .unwrap_or(0)
        .max("player".len());
    println!("{:<4}  {:<width$}  {:>12}", "rank", "player", "score");
    for (index, row) in rows.iter().enumerate() {
        println!("{:<4}  {:<width$}  {:>12}", index + 1, row.player_id, row.score);
    }
    Ok(())
}
