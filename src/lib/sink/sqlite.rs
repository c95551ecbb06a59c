use std::{
    fs,
    path::{Path, PathBuf},
};

use rusqlite::{Connection, Transaction, params};

use super::{SnapshotSink, SnapshotTransaction, table_identifier};
use crate::{
    error::{RebuildError, Result},
    record::SnapshotRow,
};

pub struct SqliteSink {
    path: PathBuf,
    conn: Connection,
    table: String,
}

impl SqliteSink {
    pub fn open(path: &Path, table: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .map_err(|err| RebuildError::connection("snapshot sink", err))?;
            }
        }

        let conn =
            Connection::open(path).map_err(|err| RebuildError::connection("snapshot sink", err))?;
        let table = table_identifier(table);
        let create_sql = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                player_id TEXT PRIMARY KEY,
                score INTEGER NOT NULL
            )"
        );
        conn.execute(&create_sql, [])
            .map_err(|err| RebuildError::connection("snapshot sink", err))?;

        Ok(Self {
            path: path.to_path_buf(),
            conn,
            table,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotSink for SqliteSink {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn begin(&mut self) -> Result<Box<dyn SnapshotTransaction + '_>> {
        let tx = self
            .conn
            .transaction()
            .map_err(|err| RebuildError::SinkCommit(err.to_string()))?;
        Ok(Box::new(SqliteTransaction {
            tx,
            upsert_sql: format!(
                "INSERT INTO {table} (player_id, score) VALUES (?1, ?2) \
                 ON CONFLICT(player_id) DO UPDATE SET score = excluded.score",
                table = self.table
            ),
            staged: Vec::new(),
        }))
    }

    fn rows(&mut self) -> Result<Vec<SnapshotRow>> {
        let sql = format!(
            "SELECT player_id, score FROM {} ORDER BY score DESC, player_id ASC",
            self.table
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|err| RebuildError::Sink(err.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(SnapshotRow {
                    player_id: row.get(0)?,
                    score: row.get(1)?,
                })
            })
            .map_err(|err| RebuildError::Sink(err.to_string()))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|err| RebuildError::Sink(err.to_string()))?;
        Ok(rows)
    }

    fn close(&mut self) -> Result<()> {
        self.conn
            .cache_flush()
            .map_err(|err| RebuildError::Sink(err.to_string()))
    }
}

struct SqliteTransaction<'a> {
    tx: Transaction<'a>,
    upsert_sql: String,
    staged: Vec<SnapshotRow>,
}

impl SnapshotTransaction for SqliteTransaction<'_> {
    fn upsert(&mut self, row: SnapshotRow) {
        self.staged.push(row);
    }

    fn execute_batch(&mut self) -> Result<usize> {
        if self.staged.is_empty() {
            return Ok(0);
        }
        let mut stmt = self
            .tx
            .prepare_cached(&self.upsert_sql)
            .map_err(|err| RebuildError::SinkCommit(err.to_string()))?;
        let mut executed = 0;
        for row in self.staged.drain(..) {
            stmt.execute(params![row.player_id, row.score])
                .map_err(|err| RebuildError::SinkCommit(err.to_string()))?;
            executed += 1;
        }
        Ok(executed)
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.execute_batch()?;
        self.tx
            .commit()
            .map_err(|err| RebuildError::SinkCommit(err.to_string()))
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        self.tx
            .rollback()
            .map_err(|err| RebuildError::SinkCommit(err.to_string()))
    }
}
