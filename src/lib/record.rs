use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A raw entry read from one partition of the event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub partition: u32,
    pub offset: u64,
    pub key: Option<String>,
    pub value: String,
}

impl SourceRecord {
    pub fn new(partition: u32, offset: u64, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            partition,
            offset,
            key: Some(key.into()),
            value: value.into(),
        }
    }

    pub fn parse(&self) -> std::result::Result<ScoreUpdateRecord, ParseError> {
        let player_id = match self.key.as_deref() {
            None => return Err(ParseError::MissingKey),
            Some(key) if key.is_empty() => return Err(ParseError::EmptyKey),
            Some(key) => key.to_string(),
        };
        let score = self
            .value
            .parse::<i64>()
            .map_err(|err| ParseError::InvalidScore {
                value: self.value.clone(),
                reason: err.to_string(),
            })?;
        Ok(ScoreUpdateRecord { player_id, score })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreUpdateRecord {
    pub player_id: String,
    pub score: i64,
}

/// One row of the canonical snapshot table, keyed by player.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub player_id: String,
    pub score: i64,
}

impl SnapshotRow {
    pub fn new(player_id: impl Into<String>, score: i64) -> Self {
        Self {
            player_id: player_id.into(),
            score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("record has no player key")]
    MissingKey,
    #[error("record has an empty player key")]
    EmptyKey,
    #[error("score {value:?} is not a base-10 integer: {reason}")]
    InvalidScore { value: String, reason: String },
}

/// A record skipped during aggregation, kept for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFailure {
    pub partition: u32,
    pub offset: u64,
    pub key: Option<String>,
    pub error: ParseError,
}

impl ParseFailure {
    pub fn from_record(record: &SourceRecord, error: ParseError) -> Self {
        Self {
            partition: record.partition,
            offset: record.offset,
            key: record.key.clone(),
            error,
        }
    }
}
