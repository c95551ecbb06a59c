use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use scoresnap::config::{Config, ConfigUpdate};

use super::rebuild::RebuildArgs;

#[derive(Args)]
pub struct ConfigArgs {
    #[command(flatten)]
    pub settings: RebuildArgs,

    /// Save the effective configuration to this path instead of printing it
    #[arg(long)]
    pub write: Option<PathBuf>,
}

impl ConfigArgs {
    pub fn overrides(&self) -> ConfigUpdate {
        self.settings.overrides()
    }
}

pub fn execute(config: &Config, args: ConfigArgs) -> Result<()> {
    match args.write {
        Some(path) => {
            config
                .save(&path)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Configuration saved to {}", path.display());
        }
        None => print!("{}", config.to_toml()?),
    }
    Ok(())
}
