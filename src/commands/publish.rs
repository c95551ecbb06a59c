use std::io::{self, BufRead};

use anyhow::{Context, Result, bail};
use clap::Args;
use scoresnap::{
    config::Config,
    source::{FileLog, SourceAddress},
};
use serde::Deserialize;

use super::ConnectionArgs;

#[derive(Args)]
pub struct PublishArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Player identifier (record key)
    #[arg(required_unless_present = "stdin", requires = "score")]
    pub player: Option<String>,

    /// Score to record for the player
    #[arg(allow_negative_numbers = true)]
    pub score: Option<i64>,

    /// Read newline-delimited JSON messages ({"lb":..,"player":..,"score":..}) from stdin
    #[arg(long, conflicts_with_all = ["player", "score"])]
    pub stdin: bool,
}

#[derive(Deserialize)]
struct ScoreMessage {
    #[serde(default)]
    lb: Option<String>,
    player: String,
    score: i64,
}

pub fn execute(config: &Config, args: PublishArgs) -> Result<()> {
    let root = match config.source_address()? {
        SourceAddress::File(root) => root,
        SourceAddress::Memory => bail!("publish requires a file:// source address"),
    };
    let log = FileLog::create(&root, &config.topic, config.source_partitions)
        .with_context(|| format!("failed to open score log at {}", root.display()))?;

    if !args.stdin {
        let (Some(player), Some(score)) = (args.player, args.score) else {
            bail!("player and score are required unless --stdin is given");
        };
        return publish_one(&log, &player, score);
    }

    let mut malformed = 0usize;
    for line in io::stdin().lock().lines() {
        let line = line.context("failed to read stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ScoreMessage>(&line) {
            Ok(message) if !message.player.is_empty() => {
                if let Some(leaderboard) = message.lb.as_deref() {
                    tracing::debug!(leaderboard, player = %message.player, "publishing score");
                }
                publish_one(&log, &message.player, message.score)?;
            }
            Ok(_) | Err(_) => {
                malformed += 1;
                eprintln!("Malformed input: {line}");
            }
        }
    }
    if malformed > 0 {
        tracing::warn!(malformed, "skipped malformed score messages");
    }
    Ok(())
}

fn publish_one(log: &FileLog, player: &str, score: i64) -> Result<()> {
    let (partition, offset) = log
        .append(player, &score.to_string())
        .with_context(|| format!("failed to publish score for {player}"))?;
    tracing::debug!(partition, offset, "appended score update");
    println!("Published {player}:{score}");
    Ok(())
}
