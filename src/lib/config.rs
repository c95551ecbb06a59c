use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    audit::AuditAddress,
    error::{RebuildError, Result},
    pipeline::PipelineOptions,
    sink::SinkUri,
    source::SourceAddress,
};

pub const DEFAULT_TOPIC: &str = "score_updates";
pub const DEFAULT_CONSUMER_GROUP: &str = "batch-rebuilder";
pub const DEFAULT_SNAPSHOT_TABLE: &str = "leaderboard_snapshot";
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 1_000;
pub const DEFAULT_MAX_POLL_RECORDS: usize = 500;
pub const DEFAULT_SOURCE_PARTITIONS: u32 = 3;

fn default_source_bootstrap_address() -> String {
    "file://./data/log".into()
}

fn default_topic() -> String {
    DEFAULT_TOPIC.into()
}

fn default_consumer_group_id() -> String {
    DEFAULT_CONSUMER_GROUP.into()
}

fn default_source_partitions() -> u32 {
    DEFAULT_SOURCE_PARTITIONS
}

fn default_sink_connection_uri() -> String {
    "sqlite://./data/leaderboard.db".into()
}

fn default_snapshot_table() -> String {
    DEFAULT_SNAPSHOT_TABLE.into()
}

fn default_poll_timeout_ms() -> u64 {
    DEFAULT_POLL_TIMEOUT_MS
}

fn default_max_poll_records() -> usize {
    DEFAULT_MAX_POLL_RECORDS
}

fn default_commit_attempts() -> u32 {
    1
}

fn default_empty_polls_to_finish() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_source_bootstrap_address")]
    pub source_bootstrap_address: String,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_consumer_group_id")]
    pub consumer_group_id: String,
    #[serde(default = "default_source_partitions")]
    pub source_partitions: u32,
    #[serde(default = "default_sink_connection_uri")]
    pub sink_connection_uri: String,
    #[serde(default = "default_snapshot_table")]
    pub snapshot_table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_store_contact_point: Option<String>,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_max_poll_records")]
    pub max_poll_records: usize,
    #[serde(default = "default_commit_attempts")]
    pub commit_attempts: u32,
    #[serde(default = "default_empty_polls_to_finish")]
    pub empty_polls_to_finish: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source_bootstrap_address: default_source_bootstrap_address(),
            topic: default_topic(),
            consumer_group_id: default_consumer_group_id(),
            source_partitions: default_source_partitions(),
            sink_connection_uri: default_sink_connection_uri(),
            snapshot_table: default_snapshot_table(),
            audit_store_contact_point: None,
            poll_timeout_ms: default_poll_timeout_ms(),
            max_poll_records: default_max_poll_records(),
            commit_attempts: default_commit_attempts(),
            empty_polls_to_finish: default_empty_polls_to_finish(),
            log_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigUpdate {
    pub source_bootstrap_address: Option<String>,
    pub topic: Option<String>,
    pub consumer_group_id: Option<String>,
    pub source_partitions: Option<u32>,
    pub sink_connection_uri: Option<String>,
    pub snapshot_table: Option<String>,
    pub audit_store_contact_point: Option<Option<String>>,
    pub poll_timeout_ms: Option<u64>,
    pub max_poll_records: Option<usize>,
    pub commit_attempts: Option<u32>,
    pub empty_polls_to_finish: Option<u32>,
    pub log_dir: Option<PathBuf>,
}

/// Reads the configuration file when it exists and falls back to defaults
/// otherwise. Nothing is written back to disk.
pub fn load_or_default(path: Option<PathBuf>) -> Result<(Config, Option<PathBuf>)> {
    let Some(path) = path else {
        return Ok((Config::default(), None));
    };

    if path.exists() {
        let config = Config::load(&path)?;
        debug!("loaded configuration from {}", path.display());
        Ok((config, Some(path)))
    } else {
        Err(RebuildError::Config(format!(
            "configuration file {} does not exist",
            path.display()
        )))
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|err| RebuildError::Config(format!("{}: {err}", path.display())))?;
        toml::from_str(&contents)
            .map_err(|err| RebuildError::Config(format!("{}: {err}", path.display())))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn apply_update(&mut self, update: ConfigUpdate) {
        if let Some(address) = update.source_bootstrap_address {
            self.source_bootstrap_address = address;
        }
        if let Some(topic) = update.topic {
            self.topic = topic;
        }
        if let Some(group) = update.consumer_group_id {
            self.consumer_group_id = group;
        }
        if let Some(partitions) = update.source_partitions {
            self.source_partitions = partitions;
        }
        if let Some(uri) = update.sink_connection_uri {
            self.sink_connection_uri = uri;
        }
        if let Some(table) = update.snapshot_table {
            self.snapshot_table = table;
        }
        if let Some(contact_point) = update.audit_store_contact_point {
            self.audit_store_contact_point = contact_point.and_then(|value| {
                let trimmed = value.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            });
        }
        if let Some(timeout) = update.poll_timeout_ms {
            self.poll_timeout_ms = timeout;
        }
        if let Some(max_records) = update.max_poll_records {
            self.max_poll_records = max_records;
        }
        if let Some(attempts) = update.commit_attempts {
            self.commit_attempts = attempts;
        }
        if let Some(polls) = update.empty_polls_to_finish {
            self.empty_polls_to_finish = polls;
        }
        if let Some(dir) = update.log_dir {
            self.log_dir = Some(dir);
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure_non_empty("topic", &self.topic)?;
        ensure_non_empty("consumer_group_id", &self.consumer_group_id)?;
        ensure_non_empty("snapshot_table", &self.snapshot_table)?;
        if self.source_partitions == 0 {
            return Err(RebuildError::Config(
                "source_partitions must be at least 1".into(),
            ));
        }
        if self.max_poll_records == 0 {
            return Err(RebuildError::Config(
                "max_poll_records must be at least 1".into(),
            ));
        }
        if self.commit_attempts == 0 {
            return Err(RebuildError::Config(
                "commit_attempts must be at least 1".into(),
            ));
        }
        if self.empty_polls_to_finish == 0 {
            return Err(RebuildError::Config(
                "empty_polls_to_finish must be at least 1".into(),
            ));
        }
        self.source_address()?;
        self.sink_uri()?;
        self.audit_address()?;
        Ok(())
    }

    pub fn source_address(&self) -> Result<SourceAddress> {
        SourceAddress::parse(&self.source_bootstrap_address)
    }

    pub fn sink_uri(&self) -> Result<SinkUri> {
        SinkUri::parse(&self.sink_connection_uri)
    }

    pub fn audit_address(&self) -> Result<Option<AuditAddress>> {
        self.audit_store_contact_point
            .as_deref()
            .map(AuditAddress::parse)
            .transpose()
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            poll_timeout: self.poll_timeout(),
            max_poll_records: self.max_poll_records,
            commit_attempts: self.commit_attempts,
            empty_polls_to_finish: self.empty_polls_to_finish,
        }
    }
}

fn ensure_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(RebuildError::Config(format!("{field} must not be empty")))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let config: Config = toml::from_str(
            r#"
sink_connection_uri = "memory://"
commit_attempts = 3
"#,
        )
        .expect("partial config should parse");
        assert_eq!(config.sink_connection_uri, "memory://");
        assert_eq!(config.commit_attempts, 3);
        assert_eq!(config.topic, DEFAULT_TOPIC);
        assert_eq!(config.consumer_group_id, DEFAULT_CONSUMER_GROUP);
        assert_eq!(config.poll_timeout_ms, DEFAULT_POLL_TIMEOUT_MS);
        assert_eq!(config.audit_store_contact_point, None);
    }

    #[test]
    fn default_config_validates() {
        Config::default().validate().expect("defaults should be valid");
    }

    #[test]
    fn validate_rejects_zero_commit_attempts() {
        let config = Config {
            commit_attempts: 0,
            ..Config::default()
        };
        let err = config.validate().expect_err("zero attempts should fail");
        assert!(matches!(err, RebuildError::Config(_)));
    }

    #[test]
    fn validate_rejects_unknown_sink_scheme() {
        let config = Config {
            sink_connection_uri: "mysql://root@localhost/leaderboard".into(),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(RebuildError::Config(_))));
    }

    #[test]
    fn applies_updates_and_clears_audit_contact_point() {
        let mut config = Config {
            audit_store_contact_point: Some("file:///tmp/audit.jsonl".into()),
            ..Config::default()
        };
        config.apply_update(ConfigUpdate {
            consumer_group_id: Some("nightly".into()),
            poll_timeout_ms: Some(250),
            audit_store_contact_point: Some(Some("  ".into())),
            ..ConfigUpdate::default()
        });
        assert_eq!(config.consumer_group_id, "nightly");
        assert_eq!(config.poll_timeout(), Duration::from_millis(250));
        assert_eq!(config.audit_store_contact_point, None);
    }

    #[test]
    fn save_and_load_preserve_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("scoresnap.toml");
        let config = Config {
            topic: "weekly_scores".into(),
            max_poll_records: 64,
            ..Config::default()
        };
        config.save(&path).unwrap();

        let (loaded, loaded_path) = load_or_default(Some(path.clone())).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded_path, Some(path));
    }

    #[test]
    fn malformed_config_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scoresnap.toml");
        fs::write(&path, "topic = [\n").unwrap();

        let err = load_or_default(Some(path.clone())).unwrap_err();
        assert!(matches!(err, RebuildError::Config(_)));
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains("scoresnap.toml"));
    }

    #[test]
    fn missing_explicit_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_or_default(Some(dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, RebuildError::Config(_)));
    }
}
