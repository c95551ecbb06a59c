use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use super::{EventSource, partition_for};
use crate::{
    error::{RebuildError, Result},
    record::SourceRecord,
};

/// In-process partitioned log with consumer-group offsets.
///
/// Clones share the same log, so a test can keep appending while a
/// subscription is being polled.
#[derive(Clone)]
pub struct MemoryLog {
    topic: Arc<str>,
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<LogState>,
    appended: Condvar,
}

struct LogState {
    partitions: Vec<Partition>,
    group_offsets: HashMap<String, Vec<u64>>,
}

#[derive(Default)]
struct Partition {
    entries: Vec<Entry>,
    next_offset: u64,
}

struct Entry {
    offset: u64,
    key: Option<String>,
    value: String,
}

impl MemoryLog {
    pub fn new(topic: impl AsRef<str>, partitions: u32) -> Self {
        let partitions = (0..partitions.max(1)).map(|_| Partition::default()).collect();
        Self {
            topic: Arc::from(topic.as_ref()),
            shared: Arc::new(Shared {
                state: Mutex::new(LogState {
                    partitions,
                    group_offsets: HashMap::new(),
                }),
                appended: Condvar::new(),
            }),
        }
    }

    /// Appends a keyed record and returns its `(partition, offset)`.
    pub fn append(&self, key: &str, value: &str) -> (u32, u64) {
        let mut state = self.shared.state.lock();
        let partition = partition_for(key, state.partitions.len() as u32);
        let offset = state.push(partition, Some(key.to_string()), value.to_string());
        drop(state);
        self.shared.appended.notify_all();
        (partition, offset)
    }

    /// Appends a record without a key. Such records are rejected at
    /// aggregation time and exist to model producer mistakes.
    pub fn append_unkeyed(&self, partition: u32, value: &str) -> u64 {
        let mut state = self.shared.state.lock();
        let partition = partition.min(state.partitions.len() as u32 - 1);
        let offset = state.push(partition, None, value.to_string());
        drop(state);
        self.shared.appended.notify_all();
        offset
    }

    /// Keeps only the newest entry per key in every partition. Offsets of
    /// surviving entries are unchanged.
    pub fn compact(&self) -> usize {
        let mut state = self.shared.state.lock();
        let mut removed = 0;
        for partition in state.partitions.iter_mut() {
            let mut latest: BTreeMap<&str, u64> = BTreeMap::new();
            for entry in &partition.entries {
                if let Some(key) = entry.key.as_deref() {
                    latest.insert(key, entry.offset);
                }
            }
            let keep: Vec<bool> = partition
                .entries
                .iter()
                .map(|entry| match entry.key.as_deref() {
                    Some(key) => latest.get(key) == Some(&entry.offset),
                    None => true,
                })
                .collect();
            let before = partition.entries.len();
            let mut flags = keep.into_iter();
            partition
                .entries
                .retain(|_| flags.next().unwrap_or(true));
            removed += before - partition.entries.len();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.shared
            .state
            .lock()
            .partitions
            .iter()
            .map(|partition| partition.entries.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn committed_offset(&self, group: &str, partition: u32) -> Option<u64> {
        self.shared
            .state
            .lock()
            .group_offsets
            .get(group)
            .and_then(|offsets| offsets.get(partition as usize).copied())
    }

    pub fn subscribe(&self, group: &str) -> MemorySubscription {
        let state = self.shared.state.lock();
        let positions = state
            .group_offsets
            .get(group)
            .cloned()
            .unwrap_or_else(|| vec![0; state.partitions.len()]);
        drop(state);
        MemorySubscription {
            log: self.clone(),
            group: group.to_string(),
            positions,
            closed: false,
        }
    }
}

impl LogState {
    fn push(&mut self, partition: u32, key: Option<String>, value: String) -> u64 {
        let partition = &mut self.partitions[partition as usize];
        let offset = partition.next_offset;
        partition.entries.push(Entry { offset, key, value });
        partition.next_offset += 1;
        offset
    }

    fn read(&self, positions: &mut [u64], max_records: usize) -> Vec<SourceRecord> {
        let mut batch = Vec::new();
        for (index, partition) in self.partitions.iter().enumerate() {
            if batch.len() >= max_records {
                break;
            }
            let position = positions[index];
            let start = partition
                .entries
                .partition_point(|entry| entry.offset < position);
            for entry in &partition.entries[start..] {
                if batch.len() >= max_records {
                    break;
                }
                batch.push(SourceRecord {
                    partition: index as u32,
                    offset: entry.offset,
                    key: entry.key.clone(),
                    value: entry.value.clone(),
                });
                positions[index] = entry.offset + 1;
            }
        }
        batch
    }
}

pub struct MemorySubscription {
    log: MemoryLog,
    group: String,
    positions: Vec<u64>,
    closed: bool,
}

impl EventSource for MemorySubscription {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn poll(&mut self, timeout: Duration, max_records: usize) -> Result<Vec<SourceRecord>> {
        if self.closed {
            return Err(RebuildError::Source(format!(
                "subscription to {} was closed",
                self.log.topic
            )));
        }

        let deadline = Instant::now() + timeout;
        let mut state = self.log.shared.state.lock();
        loop {
            let batch = state.read(&mut self.positions, max_records);
            if !batch.is_empty() {
                return Ok(batch);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(batch);
            }
            self.log
                .shared
                .appended
                .wait_for(&mut state, deadline - now);
        }
    }

    fn commit(&mut self) -> Result<()> {
        let mut state = self.log.shared.state.lock();
        state
            .group_offsets
            .insert(self.group.clone(), self.positions.clone());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
