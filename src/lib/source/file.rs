use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{EventSource, partition_for};
use crate::{
    error::{RebuildError, Result},
    record::SourceRecord,
};

const PARTITION_PREFIX: &str = "partition-";
const PARTITION_SUFFIX: &str = ".jsonl";
const IDLE_BACKOFF: Duration = Duration::from_millis(25);

#[derive(Serialize, Deserialize)]
struct LogLine {
    #[serde(default)]
    key: Option<String>,
    value: String,
}

#[derive(Serialize, Deserialize)]
struct OffsetFile {
    group: String,
    offsets: BTreeMap<u32, u64>,
    committed_at: DateTime<Utc>,
}

/// Directory-backed partitioned log. Each partition is a JSON-lines file
/// under `<root>/<topic>/` and a record's offset is its line number.
#[derive(Debug, Clone)]
pub struct FileLog {
    topic: String,
    topic_dir: PathBuf,
}

impl FileLog {
    /// Opens the log rooted at `root`. The root directory must already
    /// exist; a topic without partitions simply has nothing to read yet.
    pub fn open(root: &Path, topic: &str) -> Result<Self> {
        if !root.is_dir() {
            return Err(RebuildError::Source(format!(
                "log directory {} does not exist",
                root.display()
            )));
        }
        Ok(Self {
            topic: topic.to_string(),
            topic_dir: root.join(topic),
        })
    }

    /// Opens the log, creating the topic with `partitions` empty partition
    /// files when it does not exist yet.
    pub fn create(root: &Path, topic: &str, partitions: u32) -> Result<Self> {
        let topic_dir = root.join(topic);
        fs::create_dir_all(&topic_dir).map_err(|err| io_error(&topic_dir, err))?;
        let log = Self {
            topic: topic.to_string(),
            topic_dir,
        };
        if log.partitions()?.is_empty() {
            for partition in 0..partitions.max(1) {
                let path = log.partition_path(partition);
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .map_err(|err| io_error(&path, err))?;
            }
        }
        Ok(log)
    }

    pub fn partitions(&self) -> Result<Vec<u32>> {
        if !self.topic_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut partitions = Vec::new();
        let entries = fs::read_dir(&self.topic_dir).map_err(|err| io_error(&self.topic_dir, err))?;
        for entry in entries {
            let entry = entry.map_err(|err| io_error(&self.topic_dir, err))?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if let Some(partition) = name
                .strip_prefix(PARTITION_PREFIX)
                .and_then(|rest| rest.strip_suffix(PARTITION_SUFFIX))
                .and_then(|id| id.parse::<u32>().ok())
            {
                partitions.push(partition);
            }
        }
        partitions.sort_unstable();
        Ok(partitions)
    }

    /// Appends a keyed record to the partition owning `key` and returns its
    /// `(partition, offset)`.
    pub fn append(&self, key: &str, value: &str) -> Result<(u32, u64)> {
        let partitions = self.partitions()?;
        if partitions.is_empty() {
            return Err(RebuildError::Source(format!(
                "topic {} has no partitions",
                self.topic
            )));
        }
        let partition = partitions[partition_for(key, partitions.len() as u32) as usize];
        let path = self.partition_path(partition);
        let offset = count_lines(&path)?;

        let mut line = serde_json::to_string(&LogLine {
            key: Some(key.to_string()),
            value: value.to_string(),
        })?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| io_error(&path, err))?;
        file.write_all(line.as_bytes())
            .map_err(|err| io_error(&path, err))?;
        Ok((partition, offset))
    }

    pub fn committed_offsets(&self, group: &str) -> Result<BTreeMap<u32, u64>> {
        let path = self.offsets_path(group);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = fs::read_to_string(&path).map_err(|err| io_error(&path, err))?;
        let file: OffsetFile = serde_json::from_str(&contents)?;
        Ok(file.offsets)
    }

    pub fn subscribe(&self, group: &str) -> Result<FileSubscription> {
        let mut subscription = FileSubscription {
            log: self.clone(),
            group: group.to_string(),
            committed: self.committed_offsets(group)?,
            readers: Vec::new(),
            closed: false,
        };
        subscription.refresh_partitions()?;
        debug!(
            topic = %self.topic,
            group,
            partitions = subscription.readers.len(),
            "subscribed to file log"
        );
        Ok(subscription)
    }

    fn partition_path(&self, partition: u32) -> PathBuf {
        self.topic_dir
            .join(format!("{PARTITION_PREFIX}{partition}{PARTITION_SUFFIX}"))
    }

    fn offsets_path(&self, group: &str) -> PathBuf {
        self.topic_dir.join(format!("{group}.offsets.json"))
    }
}

struct PartitionReader {
    partition: u32,
    path: PathBuf,
    reader: BufReader<File>,
    next_offset: u64,
    pending: Vec<u8>,
}

impl PartitionReader {
    fn open(partition: u32, path: PathBuf, start: u64) -> Result<Self> {
        let file = File::open(&path).map_err(|err| io_error(&path, err))?;
        let mut reader = Self {
            partition,
            path,
            reader: BufReader::new(file),
            next_offset: 0,
            pending: Vec::new(),
        };
        while reader.next_offset < start {
            if reader.next_line()?.is_none() {
                warn!(
                    partition,
                    committed = start,
                    available = reader.next_offset,
                    "committed offset is beyond the end of the partition"
                );
                break;
            }
        }
        Ok(reader)
    }

    /// Returns the next complete line as raw bytes, leaving a partially
    /// written line buffered until its newline arrives.
    fn next_line(&mut self) -> Result<Option<Vec<u8>>> {
        let read = self
            .reader
            .read_until(b'\n', &mut self.pending)
            .map_err(|err| io_error(&self.path, err))?;
        if read == 0 || self.pending.last() != Some(&b'\n') {
            return Ok(None);
        }
        let mut line = std::mem::take(&mut self.pending);
        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        self.next_offset += 1;
        Ok(Some(line))
    }

    fn read_into(&mut self, batch: &mut Vec<SourceRecord>, max_records: usize) -> Result<()> {
        while batch.len() < max_records {
            let offset = self.next_offset;
            let Some(line) = self.next_line()? else {
                break;
            };
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let line = match String::from_utf8(line) {
                Ok(line) => line,
                Err(err) => {
                    let value = String::from_utf8_lossy(err.as_bytes()).into_owned();
                    warn!(
                        partition = self.partition,
                        offset,
                        "partition line is not valid UTF-8"
                    );
                    batch.push(SourceRecord {
                        partition: self.partition,
                        offset,
                        key: None,
                        value,
                    });
                    continue;
                }
            };
            let record = match serde_json::from_str::<LogLine>(&line) {
                Ok(decoded) => SourceRecord {
                    partition: self.partition,
                    offset,
                    key: decoded.key,
                    value: decoded.value,
                },
                Err(_) => SourceRecord {
                    partition: self.partition,
                    offset,
                    key: None,
                    value: line,
                },
            };
            batch.push(record);
        }
        Ok(())
    }
}

pub struct FileSubscription {
    log: FileLog,
    group: String,
    committed: BTreeMap<u32, u64>,
    readers: Vec<PartitionReader>,
    closed: bool,
}

impl FileSubscription {
    pub fn positions(&self) -> BTreeMap<u32, u64> {
        self.readers
            .iter()
            .map(|reader| (reader.partition, reader.next_offset))
            .collect()
    }

    fn refresh_partitions(&mut self) -> Result<()> {
        for partition in self.log.partitions()? {
            if self
                .readers
                .iter()
                .any(|reader| reader.partition == partition)
            {
                continue;
            }
            let start = self.committed.get(&partition).copied().unwrap_or(0);
            let path = self.log.partition_path(partition);
            self.readers.push(PartitionReader::open(partition, path, start)?);
        }
        Ok(())
    }

    fn read_available(&mut self, max_records: usize) -> Result<Vec<SourceRecord>> {
        let mut batch = Vec::new();
        for reader in self.readers.iter_mut() {
            if batch.len() >= max_records {
                break;
            }
            reader.read_into(&mut batch, max_records)?;
        }
        Ok(batch)
    }
}

impl EventSource for FileSubscription {
    fn name(&self) -> &'static str {
        "file"
    }

    fn poll(&mut self, timeout: Duration, max_records: usize) -> Result<Vec<SourceRecord>> {
        if self.closed {
            return Err(RebuildError::Source(format!(
                "subscription to {} was closed",
                self.log.topic
            )));
        }

        let deadline = Instant::now() + timeout;
        loop {
            self.refresh_partitions()?;
            let batch = self.read_available(max_records)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(batch);
            }
            thread::sleep(IDLE_BACKOFF.min(deadline - now));
        }
    }

    fn commit(&mut self) -> Result<()> {
        if self.readers.is_empty() {
            return Ok(());
        }
        let positions = self.positions();
        let path = self.log.offsets_path(&self.group);
        let tmp_path = path.with_extension("json.tmp");
        let payload = serde_json::to_vec_pretty(&OffsetFile {
            group: self.group.clone(),
            offsets: positions.clone(),
            committed_at: Utc::now(),
        })?;
        fs::write(&tmp_path, payload).map_err(|err| io_error(&tmp_path, err))?;
        fs::rename(&tmp_path, &path).map_err(|err| io_error(&path, err))?;
        self.committed = positions;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.readers.clear();
        self.closed = true;
        Ok(())
    }
}

fn count_lines(path: &Path) -> Result<u64> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(io_error(path, err)),
    };
    let mut reader = BufReader::new(file);
    let mut count = 0;
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        let read = reader
            .read_until(b'\n', &mut buffer)
            .map_err(|err| io_error(path, err))?;
        if read == 0 || buffer.last() != Some(&b'\n') {
            return Ok(count);
        }
        count += 1;
    }
}

fn io_error(path: &Path, err: std::io::Error) -> RebuildError {
    RebuildError::Source(format!("{}: {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appended_records_are_polled_with_line_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::create(dir.path(), "score_updates", 1).unwrap();
        assert_eq!(log.append("alice", "10").unwrap(), (0, 0));
        assert_eq!(log.append("bob", "20").unwrap(), (0, 1));

        let mut subscription = log.subscribe("rebuilder").unwrap();
        let batch = subscription.poll(Duration::ZERO, 10).unwrap();
        assert_eq!(
            batch,
            vec![
                SourceRecord::new(0, 0, "alice", "10"),
                SourceRecord::new(0, 1, "bob", "20"),
            ]
        );
        assert!(subscription.poll(Duration::ZERO, 10).unwrap().is_empty());
    }

    #[test]
    fn committed_offsets_survive_resubscription() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::create(dir.path(), "score_updates", 2).unwrap();
        for (player, score) in [("alice", "1"), ("bob", "2"), ("carol", "3")] {
            log.append(player, score).unwrap();
        }

        let mut first = log.subscribe("rebuilder").unwrap();
        assert_eq!(first.poll(Duration::ZERO, 10).unwrap().len(), 3);
        first.commit().unwrap();
        first.close().unwrap();

        let total: u64 = log.committed_offsets("rebuilder").unwrap().values().sum();
        assert_eq!(total, 3);

        log.append("dave", "4").unwrap();
        let mut second = log.subscribe("rebuilder").unwrap();
        let batch = second.poll(Duration::ZERO, 10).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].key.as_deref(), Some("dave"));
    }

    #[test]
    fn undecodable_lines_surface_without_a_key() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::create(dir.path(), "score_updates", 1).unwrap();
        let path = log.partition_path(0);
        fs::write(&path, "garbage\n{\"key\":\"alice\",\"value\":\"5\"}\n").unwrap();

        let mut subscription = log.subscribe("rebuilder").unwrap();
        let batch = subscription.poll(Duration::ZERO, 10).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].key, None);
        assert_eq!(batch[0].value, "garbage");
        assert_eq!(batch[1].offset, 1);
    }

    #[test]
    fn invalid_utf8_line_surfaces_without_a_key() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::create(dir.path(), "score_updates", 1).unwrap();
        let path = log.partition_path(0);
        let mut contents = b"{\"key\":\"alice\",\"value\":\"10\"}\n".to_vec();
        contents.extend_from_slice(b"{\"key\":\"bob\",\"value\":\"\xff\xfe\"}\n");
        contents.extend_from_slice(b"{\"key\":\"carol\",\"value\":\"7\"}\n");
        fs::write(&path, contents).unwrap();

        let mut subscription = log.subscribe("rebuilder").unwrap();
        let batch = subscription.poll(Duration::ZERO, 10).unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0], SourceRecord::new(0, 0, "alice", "10"));
        assert_eq!(batch[1].key, None);
        assert_eq!(batch[1].offset, 1);
        assert!(batch[1].value.contains('\u{FFFD}'));
        assert_eq!(batch[2], SourceRecord::new(0, 2, "carol", "7"));

        subscription.commit().unwrap();
        assert_eq!(
            log.committed_offsets("rebuilder").unwrap(),
            BTreeMap::from([(0, 3)])
        );
    }

    #[test]
    fn multibyte_character_split_across_writes_is_reassembled() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::create(dir.path(), "score_updates", 1).unwrap();
        let path = log.partition_path(0);
        let line = "{\"key\":\"zo\u{eb}\",\"value\":\"3\"}\n".as_bytes();
        let split = line.iter().position(|byte| *byte == 0xc3).unwrap() + 1;
        fs::write(&path, &line[..split]).unwrap();

        let mut subscription = log.subscribe("rebuilder").unwrap();
        assert!(subscription.poll(Duration::ZERO, 10).unwrap().is_empty());

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&line[split..]).unwrap();
        let batch = subscription.poll(Duration::ZERO, 10).unwrap();
        assert_eq!(batch, vec![SourceRecord::new(0, 0, "zo\u{eb}", "3")]);
    }

    #[test]
    fn partial_trailing_line_waits_for_newline() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::create(dir.path(), "score_updates", 1).unwrap();
        let path = log.partition_path(0);
        fs::write(&path, "{\"key\":\"alice\",\"value\":\"5\"}\n{\"key\":\"bo").unwrap();

        let mut subscription = log.subscribe("rebuilder").unwrap();
        assert_eq!(subscription.poll(Duration::ZERO, 10).unwrap().len(), 1);
        assert!(subscription.poll(Duration::ZERO, 10).unwrap().is_empty());

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"b\",\"value\":\"7\"}\n").unwrap();
        let batch = subscription.poll(Duration::ZERO, 10).unwrap();
        assert_eq!(batch, vec![SourceRecord::new(0, 1, "bob", "7")]);
    }

    #[test]
    fn open_requires_existing_root() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        assert!(matches!(
            FileLog::open(&missing, "score_updates"),
            Err(RebuildError::Source(_))
        ));
    }

    #[test]
    fn missing_topic_polls_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::open(dir.path(), "score_updates").unwrap();
        let mut subscription = log.subscribe("rebuilder").unwrap();
        assert!(
            subscription
                .poll(Duration::from_millis(30), 10)
                .unwrap()
                .is_empty()
        );
    }
}
