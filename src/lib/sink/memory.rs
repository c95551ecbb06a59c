use std::{collections::BTreeMap, sync::Arc};

use parking_lot::Mutex;

use super::{SnapshotSink, SnapshotTransaction};
use crate::{
    error::{RebuildError, Result},
    record::SnapshotRow,
};

/// In-process snapshot table. Clones share state, which lets callers
/// inspect what a pipeline committed after the pipeline has been consumed.
#[derive(Clone, Default)]
pub struct MemorySink {
    store: Arc<Mutex<MemoryStore>>,
}

#[derive(Default)]
struct MemoryStore {
    rows: BTreeMap<String, i64>,
    failing_commits: usize,
    failing_executes: usize,
    commits: usize,
    rollbacks: usize,
    upserts_executed: usize,
    closed: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = SnapshotRow>,
    {
        let sink = Self::new();
        sink.store.lock().rows = rows
            .into_iter()
            .map(|row| (row.player_id, row.score))
            .collect();
        sink
    }

    /// Makes the next `count` commits fail after their batch was executed.
    pub fn fail_next_commits(&self, count: usize) {
        self.store.lock().failing_commits = count;
    }

    /// Makes the next `count` batch executions fail before any staged row
    /// reaches the transaction.
    pub fn fail_next_executes(&self, count: usize) {
        self.store.lock().failing_executes = count;
    }

    pub fn scores(&self) -> BTreeMap<String, i64> {
        self.store.lock().rows.clone()
    }

    pub fn commits(&self) -> usize {
        self.store.lock().commits
    }

    pub fn rollbacks(&self) -> usize {
        self.store.lock().rollbacks
    }

    pub fn upserts_executed(&self) -> usize {
        self.store.lock().upserts_executed
    }

    /// Whether `close` has been called on any clone of this sink.
    pub fn is_closed(&self) -> bool {
        self.store.lock().closed
    }
}

impl SnapshotSink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn begin(&mut self) -> Result<Box<dyn SnapshotTransaction + '_>> {
        Ok(Box::new(MemoryTransaction {
            store: &self.store,
            staged: Vec::new(),
            executed: BTreeMap::new(),
        }))
    }

    fn rows(&mut self) -> Result<Vec<SnapshotRow>> {
        let mut rows: Vec<SnapshotRow> = self
            .store
            .lock()
            .rows
            .iter()
            .map(|(player, score)| SnapshotRow::new(player.clone(), *score))
            .collect();
        rows.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.player_id.cmp(&b.player_id)));
        Ok(rows)
    }

    fn close(&mut self) -> Result<()> {
        self.store.lock().closed = true;
        Ok(())
    }
}

struct MemoryTransaction<'a> {
    store: &'a Mutex<MemoryStore>,
    staged: Vec<SnapshotRow>,
    executed: BTreeMap<String, i64>,
}

impl SnapshotTransaction for MemoryTransaction<'_> {
    fn upsert(&mut self, row: SnapshotRow) {
        self.staged.push(row);
    }

    fn execute_batch(&mut self) -> Result<usize> {
        {
            let mut store = self.store.lock();
            if store.failing_executes > 0 {
                store.failing_executes -= 1;
                return Err(RebuildError::SinkCommit(
                    "memory sink rejected the batch".into(),
                ));
            }
        }
        let count = self.staged.len();
        for row in self.staged.drain(..) {
            self.executed.insert(row.player_id, row.score);
        }
        self.store.lock().upserts_executed += count;
        Ok(count)
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.execute_batch()?;
        let shared = self.store;
        let mut store = shared.lock();
        if store.failing_commits > 0 {
            store.failing_commits -= 1;
            store.rollbacks += 1;
            return Err(RebuildError::SinkCommit(
                "memory sink rejected the commit".into(),
            ));
        }
        let executed = std::mem::take(&mut self.executed);
        store.rows.extend(executed);
        store.commits += 1;
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        self.store.lock().rollbacks += 1;
        Ok(())
    }
}
