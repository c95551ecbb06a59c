use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RebuildError>;

#[derive(Debug, Error)]
pub enum RebuildError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("failed to connect to {component}: {message}")]
    Connection {
        component: &'static str,
        message: String,
    },
    #[error("event source error: {0}")]
    Source(String),
    #[error("snapshot commit failed: {0}")]
    SinkCommit(String),
    #[error("snapshot store error: {0}")]
    Sink(String),
    #[error("audit store error: {0}")]
    Audit(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl RebuildError {
    pub fn connection(component: &'static str, message: impl ToString) -> Self {
        Self::Connection {
            component,
            message: message.to_string(),
        }
    }

    /// Process exit status reported by the binary for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 2,
            Self::Connection { .. } => 3,
            Self::SinkCommit(_) => 4,
            Self::Source(_) => 5,
            Self::Sink(_) | Self::Audit(_) | Self::Io(_) | Self::Serialization(_) => 1,
        }
    }
}

impl From<toml::de::Error> for RebuildError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for RebuildError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for RebuildError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
