//! Raw-copy audit trail of every record the rebuild consumed.

use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use chrono::Utc;
use serde::Serialize;

use crate::{
    error::{RebuildError, Result},
    record::SourceRecord,
};

pub trait AuditStore: Send {
    fn record_batch(&mut self, batch: &[SourceRecord]) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditAddress {
    File(PathBuf),
}

impl AuditAddress {
    pub fn parse(input: &str) -> Result<Self> {
        match input.trim().strip_prefix("file://") {
            Some(path) if !path.is_empty() => Ok(Self::File(PathBuf::from(path))),
            _ => Err(RebuildError::Config(format!(
                "unsupported audit store contact point '{input}' (expected file://<path>)"
            ))),
        }
    }
}

pub fn open(address: &AuditAddress) -> Result<Box<dyn AuditStore>> {
    match address {
        AuditAddress::File(path) => Ok(Box::new(
            FileAuditStore::open(path).map_err(|err| RebuildError::connection("audit store", err))?,
        )),
    }
}

#[derive(Serialize)]
struct AuditLine<'a> {
    #[serde(flatten)]
    record: &'a SourceRecord,
    audited_at: String,
}

/// Appends each consumed record as one JSON line.
pub struct FileAuditStore {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl FileAuditStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditStore for FileAuditStore {
    fn record_batch(&mut self, batch: &[SourceRecord]) -> Result<()> {
        let audited_at = Utc::now().to_rfc3339();
        for record in batch {
            let line = serde_json::to_string(&AuditLine {
                record,
                audited_at: audited_at.clone(),
            })?;
            writeln!(self.writer, "{line}")
                .map_err(|err| RebuildError::Audit(format!("{}: {err}", self.path.display())))?;
        }
        self.writer
            .flush()
            .map_err(|err| RebuildError::Audit(format!("{}: {err}", self.path.display())))
    }

    fn close(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|err| RebuildError::Audit(format!("{}: {err}", self.path.display())))
    }
}
