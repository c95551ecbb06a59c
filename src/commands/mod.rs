use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use scoresnap::config::{Config, ConfigUpdate, load_or_default};

pub mod config;
pub mod publish;
pub mod rebuild;
pub mod snapshot;

/// Endpoint overrides shared by every command that touches the log or the
/// snapshot store.
#[derive(Args, Clone, Default)]
pub struct ConnectionArgs {
    /// Event log address (file://<dir> or memory://)
    #[arg(long = "source")]
    pub source_bootstrap_address: Option<String>,

    /// Topic holding score updates
    #[arg(long)]
    pub topic: Option<String>,

    /// Consumer group whose offsets are resumed and committed
    #[arg(long = "group")]
    pub consumer_group_id: Option<String>,

    /// Partition count used when creating a new topic
    #[arg(long = "partitions")]
    pub source_partitions: Option<u32>,

    /// Snapshot store URI (sqlite://<path>, postgres://..., memory://)
    #[arg(long = "sink")]
    pub sink_connection_uri: Option<String>,

    /// Snapshot table name
    #[arg(long = "table")]
    pub snapshot_table: Option<String>,

    /// Raw-copy audit store (file://<path>)
    #[arg(long = "audit")]
    pub audit_store_contact_point: Option<String>,

    /// Directory for daily-rolling log files
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

impl From<ConnectionArgs> for ConfigUpdate {
    fn from(args: ConnectionArgs) -> Self {
        ConfigUpdate {
            source_bootstrap_address: args.source_bootstrap_address,
            topic: args.topic,
            consumer_group_id: args.consumer_group_id,
            source_partitions: args.source_partitions,
            sink_connection_uri: args.sink_connection_uri,
            snapshot_table: args.snapshot_table,
            audit_store_contact_point: args.audit_store_contact_point.map(Some),
            log_dir: args.log_dir,
            ..ConfigUpdate::default()
        }
    }
}

pub fn load_config(path: Option<PathBuf>, update: ConfigUpdate) -> Result<Config> {
    let (mut config, _) = load_or_default(path)?;
    config.apply_update(update);
    config
        .validate()
        .context("invalid scoresnap configuration")?;
    Ok(config)
}
