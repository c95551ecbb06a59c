use std::{collections::HashMap, fmt, time::Duration};

use tracing::{debug, error, info, warn};

use crate::{
    aggregate,
    audit::{self, AuditStore},
    config::{Config, DEFAULT_MAX_POLL_RECORDS, DEFAULT_POLL_TIMEOUT_MS},
    error::Result,
    record::{ParseFailure, SnapshotRow, SourceRecord},
    sink::{self, SnapshotSink},
    source::{self, EventSource},
    telemetry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineState {
    #[default]
    Init,
    Running,
    Done,
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "init",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    pub poll_timeout: Duration,
    pub max_poll_records: usize,
    /// Total tries per cycle, so `1` fails fast on the first commit error.
    pub commit_attempts: u32,
    /// Consecutive empty polls that end the run.
    pub empty_polls_to_finish: u32,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
            max_poll_records: DEFAULT_MAX_POLL_RECORDS,
            commit_attempts: 1,
            empty_polls_to_finish: 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildReport {
    pub state: PipelineState,
    pub cycles: usize,
    pub records_polled: usize,
    pub rows_upserted: usize,
    pub commit_retries: usize,
    pub players: usize,
    pub parse_failures: Vec<ParseFailure>,
}

/// Drains the score update log into the snapshot sink, one atomic
/// poll cycle at a time, until the source reports it has caught up.
pub struct RebuildPipeline {
    source: Box<dyn EventSource>,
    sink: Box<dyn SnapshotSink>,
    audit: Option<Box<dyn AuditStore>>,
    options: PipelineOptions,
    state: PipelineState,
    committed_best: HashMap<String, i64>,
}

impl RebuildPipeline {
    pub fn new(
        source: Box<dyn EventSource>,
        sink: Box<dyn SnapshotSink>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            source,
            sink,
            audit: None,
            options,
            state: PipelineState::Init,
            committed_best: HashMap::new(),
        }
    }

    pub fn with_audit(mut self, audit: Box<dyn AuditStore>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Opens the audit store, the source subscription and the sink
    /// described by `config`. Any failure here leaves nothing running.
    pub fn connect(config: &Config) -> Result<Self> {
        config.validate()?;

        let audit = match config.audit_address()? {
            Some(address) => Some(audit::open(&address)?),
            None => None,
        };
        let source = source::subscribe(
            &config.source_address()?,
            &config.topic,
            &config.consumer_group_id,
        )?;
        let sink = sink::open(&config.sink_uri()?, &config.snapshot_table)?;
        info!(
            source = source.name(),
            sink = sink.name(),
            topic = %config.topic,
            group = %config.consumer_group_id,
            audit = audit.is_some(),
            "connected rebuild pipeline"
        );

        let pipeline = Self::new(source, sink, config.pipeline_options());
        Ok(match audit {
            Some(audit) => pipeline.with_audit(audit),
            None => pipeline,
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Runs poll cycles until the source is exhausted or a fatal error
    /// occurs. Source, sink and audit store are closed on every path.
    pub fn run(mut self) -> Result<RebuildReport> {
        self.state = PipelineState::Running;
        let mut report = RebuildReport::default();
        let outcome = self.drive(&mut report);

        self.state = match outcome {
            Ok(()) => PipelineState::Done,
            Err(_) => PipelineState::Failed,
        };
        report.state = self.state;
        report.players = self.committed_best.len();
        self.close_all();

        match outcome {
            Ok(()) => {
                info!(
                    cycles = report.cycles,
                    records = report.records_polled,
                    rows = report.rows_upserted,
                    players = report.players,
                    parse_failures = report.parse_failures.len(),
                    "snapshot rebuild completed"
                );
                Ok(report)
            }
            Err(err) => {
                error!(
                    cycles = report.cycles,
                    rows = report.rows_upserted,
                    "snapshot rebuild failed: {err}"
                );
                Err(err)
            }
        }
    }

    fn drive(&mut self, report: &mut RebuildReport) -> Result<()> {
        let mut idle_polls = 0;
        loop {
            let batch = self
                .source
                .poll(self.options.poll_timeout, self.options.max_poll_records)?;
            if batch.is_empty() {
                idle_polls += 1;
                if idle_polls >= self.options.empty_polls_to_finish.max(1) {
                    debug!(idle_polls, "source caught up");
                    return Ok(());
                }
                continue;
            }
            idle_polls = 0;
            self.run_cycle(batch, report)?;
        }
    }

    fn run_cycle(&mut self, batch: Vec<SourceRecord>, report: &mut RebuildReport) -> Result<()> {
        report.cycles += 1;
        report.records_polled += batch.len();
        telemetry::record_poll(self.source.name(), batch.len());

        if let Some(audit) = self.audit.as_mut() {
            if let Err(err) = audit.record_batch(&batch) {
                warn!(cycle = report.cycles, "failed to write raw audit copy: {err}");
            }
        }

        let reduction = aggregate::reduce(&batch);
        for failure in &reduction.rejected {
            warn!(
                partition = failure.partition,
                offset = failure.offset,
                key = ?failure.key,
                "skipping malformed score update: {}",
                failure.error
            );
        }
        telemetry::record_parse_failures(reduction.rejected.len());
        report.parse_failures.extend(reduction.rejected);

        let rows: Vec<SnapshotRow> = reduction
            .scores
            .into_iter()
            .filter(|(player, score)| {
                self.committed_best
                    .get(player)
                    .is_none_or(|best| score > best)
            })
            .map(|(player, score)| SnapshotRow::new(player, score))
            .collect();

        let written = if rows.is_empty() {
            0
        } else {
            self.commit_rows(&rows, report)?
        };
        for row in rows {
            self.committed_best.insert(row.player_id, row.score);
        }
        report.rows_upserted += written;

        self.source.commit()?;
        debug!(
            cycle = report.cycles,
            records = batch.len(),
            rows = written,
            "committed poll cycle"
        );
        Ok(())
    }

    fn commit_rows(&mut self, rows: &[SnapshotRow], report: &mut RebuildReport) -> Result<usize> {
        let attempts = self.options.commit_attempts.max(1);
        let mut attempt = 1;
        loop {
            match write_rows(self.sink.as_mut(), rows) {
                Ok(written) => {
                    telemetry::record_commit(self.sink.name(), written);
                    return Ok(written);
                }
                Err(err) => {
                    telemetry::record_commit_failure(self.sink.name());
                    if attempt >= attempts {
                        return Err(err);
                    }
                    warn!(attempt, attempts, "snapshot commit failed, retrying: {err}");
                    report.commit_retries += 1;
                    attempt += 1;
                }
            }
        }
    }

    fn close_all(&mut self) {
        if let Err(err) = self.source.close() {
            warn!(source = self.source.name(), "failed to close event source: {err}");
        }
        if let Err(err) = self.sink.close() {
            warn!(sink = self.sink.name(), "failed to close snapshot sink: {err}");
        }
        if let Some(audit) = self.audit.as_mut() {
            if let Err(err) = audit.close() {
                warn!("failed to close audit store: {err}");
            }
        }
    }
}

/// Stages, executes and commits `rows` as one transaction.
fn write_rows(sink: &mut dyn SnapshotSink, rows: &[SnapshotRow]) -> Result<usize> {
    let mut tx = sink.begin()?;
    for row in rows {
        tx.upsert(row.clone());
    }
    let executed = match tx.execute_batch() {
        Ok(executed) => executed,
        Err(err) => {
            if let Err(rollback_err) = tx.rollback() {
                warn!("rollback after failed batch also failed: {rollback_err}");
            }
            return Err(err);
        }
    };
    tx.commit()?;
    Ok(executed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::RebuildError,
        sink::MemorySink,
        source::MemoryLog,
    };

    fn options() -> PipelineOptions {
        PipelineOptions {
            poll_timeout: Duration::ZERO,
            max_poll_records: 2,
            ..PipelineOptions::default()
        }
    }

    #[test]
    fn lower_score_in_later_cycle_does_not_regress_snapshot() {
        let log = MemoryLog::new("score_updates", 1);
        log.append("alice", "100");
        log.append("bob", "10");
        log.append("alice", "40");

        let sink = MemorySink::new();
        let report = RebuildPipeline::new(
            Box::new(log.subscribe("rebuilder")),
            Box::new(sink.clone()),
            options(),
        )
        .run()
        .unwrap();

        assert_eq!(report.state, PipelineState::Done);
        assert_eq!(report.cycles, 2);
        assert_eq!(report.rows_upserted, 2);
        assert_eq!(sink.scores()["alice"], 100);
        assert_eq!(sink.commits(), 1);
    }

    #[test]
    fn retries_commit_when_attempts_allow() {
        let log = MemoryLog::new("score_updates", 1);
        log.append("alice", "5");
        let sink = MemorySink::new();
        sink.fail_next_commits(1);

        let report = RebuildPipeline::new(
            Box::new(log.subscribe("rebuilder")),
            Box::new(sink.clone()),
            PipelineOptions {
                commit_attempts: 2,
                ..options()
            },
        )
        .run()
        .unwrap();

        assert_eq!(report.commit_retries, 1);
        assert_eq!(sink.scores()["alice"], 5);
    }

    #[test]
    fn fails_fast_with_a_single_commit_attempt() {
        let log = MemoryLog::new("score_updates", 1);
        log.append("alice", "5");
        let sink = MemorySink::new();
        sink.fail_next_commits(1);

        let err = RebuildPipeline::new(
            Box::new(log.subscribe("rebuilder")),
            Box::new(sink.clone()),
            options(),
        )
        .run()
        .unwrap_err();

        assert!(matches!(err, RebuildError::SinkCommit(_)));
        assert!(sink.scores().is_empty());
        assert!(sink.is_closed());
        assert_eq!(log.committed_offset("rebuilder", 0), None);
    }

    #[test]
    fn new_pipeline_starts_in_init() {
        let log = MemoryLog::new("score_updates", 1);
        let pipeline = RebuildPipeline::new(
            Box::new(log.subscribe("rebuilder")),
            Box::new(MemorySink::new()),
            options(),
        );
        assert_eq!(pipeline.state(), PipelineState::Init);
    }
}
