//! Authoritative read-back of a committed partition.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{HarnessError, Result};

/// One message of the committed log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedRecord {
    pub offset: i64,
    pub key: String,
    pub op: u64,
}

impl CommittedRecord {
    pub fn new(offset: i64, key: impl Into<String>, op: u64) -> Self {
        CommittedRecord {
            offset,
            key: key.into(),
            op,
        }
    }
}

/// A single ordered consumer of one partition, positioned at its beginning.
///
/// Implementations must use committed-only isolation: an offset that is not
/// yet committed must never be returned. An empty batch means "nothing right
/// now"; only [`CommittedLogSource::exhausted`] says "end of log".
pub trait CommittedLogSource: Send {
    fn poll(&mut self, timeout: Duration) -> Result<Vec<CommittedRecord>>;

    /// Whether every committed record has already been returned, i.e. the
    /// consumer sits at the high watermark. Sources that can't tell say no.
    fn exhausted(&self) -> bool {
        false
    }
}

/// Serves a fixed set of records in batches.
#[derive(Debug)]
pub struct MemoryLogSource {
    records: VecDeque<CommittedRecord>,
    batch: usize,
    empty_polls: u32,
}

impl MemoryLogSource {
    pub fn new(records: Vec<CommittedRecord>) -> Self {
        MemoryLogSource {
            records: records.into(),
            batch: 64,
            empty_polls: 0,
        }
    }

    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    /// Answer the first `n` polls with nothing, like a consumer that is
    /// still fetching metadata.
    pub fn with_empty_polls(mut self, n: u32) -> Self {
        self.empty_polls = n;
        self
    }
}

impl Default for MemoryLogSource {
    fn default() -> Self {
        MemoryLogSource::new(Vec::new())
    }
}

impl CommittedLogSource for MemoryLogSource {
    fn poll(&mut self, _timeout: Duration) -> Result<Vec<CommittedRecord>> {
        if self.empty_polls > 0 {
            self.empty_polls -= 1;
            return Ok(Vec::new());
        }
        let n = self.batch.min(self.records.len());
        Ok(self.records.drain(..n).collect())
    }

    fn exhausted(&self) -> bool {
        self.empty_polls == 0 && self.records.is_empty()
    }
}

/// Reads a dump of the partition: one `offset \t key \t op` per line.
pub struct FileLogSource {
    inner: MemoryLogSource,
}

impl FileLogSource {
    pub fn open(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let mut records = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            records.push(parse_dump_line(idx + 1, line)?);
        }
        Ok(FileLogSource {
            inner: MemoryLogSource::new(records),
        })
    }
}

fn parse_dump_line(line_no: usize, line: &str) -> Result<CommittedRecord> {
    let parts: Vec<&str> = line.split('\t').collect();
    if parts.len() != 3 {
        return Err(HarnessError::infra(format!(
            "committed log dump line {}: expected 3 fields, got {}",
            line_no,
            parts.len()
        )));
    }
    let offset = parts[0]
        .parse()
        .map_err(|_| HarnessError::infra(format!("committed log dump line {}: bad offset", line_no)))?;
    let op = parts[2]
        .parse()
        .map_err(|_| HarnessError::infra(format!("committed log dump line {}: bad op", line_no)))?;
    Ok(CommittedRecord::new(offset, parts[1], op))
}

impl CommittedLogSource for FileLogSource {
    fn poll(&mut self, timeout: Duration) -> Result<Vec<CommittedRecord>> {
        self.inner.poll(timeout)
    }

    fn exhausted(&self) -> bool {
        self.inner.exhausted()
    }
}
