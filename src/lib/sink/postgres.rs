use postgres::{Client, NoTls, Transaction};

use super::{SnapshotSink, SnapshotTransaction, table_identifier};
use crate::{
    error::{RebuildError, Result},
    record::SnapshotRow,
};

pub struct PostgresSink {
    client: Option<Client>,
    table: String,
}

impl PostgresSink {
    pub fn connect(connection_string: &str, table: &str) -> Result<Self> {
        let mut client = Client::connect(connection_string, NoTls)
            .map_err(|err| RebuildError::connection("snapshot sink", err))?;
        let table = table_identifier(table);
        let create_sql = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                player_id TEXT NOT NULL,
                score BIGINT NOT NULL,
                PRIMARY KEY (player_id)
            )"
        );
        client
            .batch_execute(&create_sql)
            .map_err(|err| RebuildError::connection("snapshot sink", err))?;
        Ok(Self {
            client: Some(client),
            table,
        })
    }

    fn client(&mut self) -> Result<&mut Client> {
        self.client
            .as_mut()
            .ok_or_else(|| RebuildError::Sink("postgres sink is closed".into()))
    }
}

impl SnapshotSink for PostgresSink {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn begin(&mut self) -> Result<Box<dyn SnapshotTransaction + '_>> {
        let upsert_sql = format!(
            "INSERT INTO {table} (player_id, score) VALUES ($1, $2) \
             ON CONFLICT (player_id) DO UPDATE SET score = EXCLUDED.score",
            table = self.table
        );
        let tx = self
            .client()?
            .transaction()
            .map_err(|err| RebuildError::SinkCommit(err.to_string()))?;
        Ok(Box::new(PostgresTransaction {
            tx,
            upsert_sql,
            staged: Vec::new(),
        }))
    }

    fn rows(&mut self) -> Result<Vec<SnapshotRow>> {
        let sql = format!(
            "SELECT player_id, score FROM {} ORDER BY score DESC, player_id ASC",
            self.table
        );
        let rows = self
            .client()?
            .query(sql.as_str(), &[])
            .map_err(|err| RebuildError::Sink(err.to_string()))?;
        rows.iter()
            .map(|row| {
                Ok(SnapshotRow {
                    player_id: row
                        .try_get(0)
                        .map_err(|err| RebuildError::Sink(err.to_string()))?,
                    score: row
                        .try_get(1)
                        .map_err(|err| RebuildError::Sink(err.to_string()))?,
                })
            })
            .collect()
    }

    /// Terminates the session. Later calls are no-ops; other operations
    /// fail once the sink is closed.
    fn close(&mut self) -> Result<()> {
        match self.client.take() {
            Some(client) => client
                .close()
                .map_err(|err| RebuildError::Sink(err.to_string())),
            None => Ok(()),
        }
    }
}

struct PostgresTransaction<'a> {
    tx: Transaction<'a>,
    upsert_sql: String,
    staged: Vec<SnapshotRow>,
}

impl SnapshotTransaction for PostgresTransaction<'_> {
    fn upsert(&mut self, row: SnapshotRow) {
        self.staged.push(row);
    }

    fn execute_batch(&mut self) -> Result<usize> {
        if self.staged.is_empty() {
            return Ok(0);
        }
        let statement = self
            .tx
            .prepare(&self.upsert_sql)
            .map_err(|err| RebuildError::SinkCommit(err.to_string()))?;
        let mut executed = 0;
        for row in self.staged.drain(..) {
            self.tx
                .execute(&statement, &[&row.player_id, &row.score])
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
