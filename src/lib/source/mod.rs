use std::{path::PathBuf, time::Duration};

use sha2::{Digest, Sha256};

use crate::{
    error::{RebuildError, Result},
    record::SourceRecord,
};

mod file;
pub use file::{FileLog, FileSubscription};
mod memory;
pub use memory::{MemoryLog, MemorySubscription};

/// A consumer-group subscription to a partitioned score update log.
///
/// `poll` returns an empty batch when nothing became available within the
/// timeout. Positions advance as records are returned; `commit` persists
/// them for the group.
pub trait EventSource: Send {
    fn name(&self) -> &'static str;
    fn poll(&mut self, timeout: Duration, max_records: usize) -> Result<Vec<SourceRecord>>;
    fn commit(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceAddress {
    File(PathBuf),
    Memory,
}

impl SourceAddress {
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if let Some(path) = trimmed.strip_prefix("file://") {
            if path.is_empty() {
                return Err(RebuildError::Config(
                    "file source address requires a directory path".into(),
                ));
            }
            return Ok(Self::File(PathBuf::from(path)));
        }
        if trimmed == "memory://" {
            return Ok(Self::Memory);
        }
        Err(RebuildError::Config(format!(
            "unsupported source bootstrap address '{input}' (expected file://<dir> or memory://)"
        )))
    }
}

/// Opens a subscription for `topic` on behalf of `group`, resuming at the
/// group's committed offsets.
pub fn subscribe(
    address: &SourceAddress,
    topic: &str,
    group: &str,
) -> Result<Box<dyn EventSource>> {
    match address {
        SourceAddress::File(dir) => {
            let log = FileLog::open(dir, topic)
                .map_err(|err| RebuildError::connection("event source", err))?;
            let subscription = log
                .subscribe(group)
                .map_err(|err| RebuildError::connection("event source", err))?;
            Ok(Box::new(subscription))
        }
        SourceAddress::Memory => Ok(Box::new(MemoryLog::new(topic, 1).subscribe(group))),
    }
}

/// Stable key-to-partition assignment shared by every log implementation.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % u64::from(partitions.max(1))) as u32
}
