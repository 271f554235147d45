//! Replay of a workload log and cross-check against the committed log.

use std::collections::{HashMap, HashSet};
use std::thread;
use std::time::Duration;

use tracing::{debug, error};

use super::log::{LogLine, State};
use super::source::CommittedLogSource;
use super::{OracleStats, RereadPolicy, Violation, ViolationKind};
use crate::error::{HarnessError, Result};

/// One client write attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Write {
    pub key: String,
    pub op: u64,
    /// Assigned offset once the write is confirmed.
    pub offset: Option<i64>,
    pub started_us: i64,
    pub finished_us: Option<i64>,
    /// Highest confirmed offset known when the write was sent.
    pub max_offset: i64,
}

/// Replays one workload log. All state is local to the instance.
#[derive(Debug)]
pub struct LogPlayer {
    curr_state: HashMap<u64, State>,
    key: HashMap<u64, String>,
    last_write: HashMap<u64, Write>,
    ts_us: Option<i64>,
    line_no: usize,

    /// Highest confirmed offset seen so far (causal high-water mark).
    max_offset: i64,
    first_offset: Option<i64>,
    last_offset: Option<i64>,
    seen_ops: HashSet<u64>,

    ok_writes: HashMap<i64, Write>,
    err_writes: HashMap<u64, Write>,

    violations: Vec<Violation>,
    stats: OracleStats,
}

impl Default for LogPlayer {
    fn default() -> Self {
        Self::new()
    }
}

impl LogPlayer {
    pub fn new() -> Self {
        LogPlayer {
            curr_state: HashMap::new(),
            key: HashMap::new(),
            last_write: HashMap::new(),
            ts_us: None,
            line_no: 0,
            max_offset: -1,
            first_offset: None,
            last_offset: None,
            seen_ops: HashSet::new(),
            ok_writes: HashMap::new(),
            err_writes: HashMap::new(),
            violations: Vec::new(),
            stats: OracleStats::default(),
        }
    }

    pub fn has_violation(&self) -> bool {
        !self.violations.is_empty()
    }

    pub fn into_parts(self) -> (Vec<Violation>, OracleStats) {
        (self.violations, self.stats)
    }

    fn violation(&mut self, kind: ViolationKind, description: String) {
        error!(target: "consistency", "{}", description);
        self.violations.push(Violation { kind, description });
    }

    /// Replay one complete line.
    pub fn apply(&mut self, line: &str) -> Result<()> {
        self.line_no += 1;
        let line_no = self.line_no;
        let parsed = LogLine::parse(line_no, line)?;
        self.stats.lines += 1;

        self.ts_us = Some(match self.ts_us {
            None => parsed.delta_us,
            Some(ts) => ts
                .checked_add(parsed.delta_us)
                .ok_or_else(|| HarnessError::malformed(line_no, "timestamp overflow"))?,
        });

        match parsed.state {
            State::Event | State::Log => return Ok(()),
            State::Violation => {
                let message = parsed.args.join("\t");
                self.violation(ViolationKind::ReportedByWorkload, message);
                return Ok(());
            }
            _ => {}
        }

        let thread_id = parsed
            .thread_id
            .ok_or_else(|| HarnessError::malformed(line_no, "missing thread id"))?;
        match self.curr_state.get(&thread_id).copied() {
            None => {
                if parsed.state != State::Started {
                    return Err(HarnessError::malformed(
                        line_no,
                        format!("first logged command of a new thread should be started, got: \"{}\"", parsed.state),
                    ));
                }
                let key = parsed.arg(line_no, 0, "key")?;
                self.key.insert(thread_id, key.to_string());
            }
            Some(curr) => {
                if !curr.can_transition_to(parsed.state) {
                    return Err(HarnessError::malformed(
                        line_no,
                        format!("unknown transition {} -> {}", curr, parsed.state),
                    ));
                }
            }
        }
        self.curr_state.insert(thread_id, parsed.state);

        self.writing_apply(line_no, thread_id, &parsed)
    }

    fn writing_apply(&mut self, line_no: usize, thread_id: u64, line: &LogLine<'_>) -> Result<()> {
        let now = self.ts_us.unwrap_or_default();
        match line.state {
            State::Sending => {
                let op: u64 = line.parse_arg(line_no, 0, "op")?;
                if !self.seen_ops.insert(op) {
                    return Err(HarnessError::malformed(line_no, format!("operation id {} reused", op)));
                }
                let key = self
                    .key
                    .get(&thread_id)
                    .cloned()
                    .ok_or_else(|| HarnessError::malformed(line_no, "send before started"))?;
                self.stats.writes_sent += 1;
                self.last_write.insert(
                    thread_id,
                    Write {
                        key,
                        op,
                        offset: None,
                        started_us: now,
                        finished_us: None,
                        max_offset: self.max_offset,
                    },
                );
            }
            State::Ok => {
                let offset: i64 = line.parse_arg(line_no, 0, "offset")?;
                let mut write = self
                    .last_write
                    .remove(&thread_id)
                    .ok_or_else(|| HarnessError::malformed(line_no, "ok without a pending write"))?;
                self.first_offset = Some(self.first_offset.map_or(offset, |o| o.min(offset)));
                self.last_offset = Some(self.last_offset.map_or(offset, |o| o.max(offset)));
                write.offset = Some(offset);
                write.finished_us = Some(now);
                if offset <= write.max_offset {
                    self.violation(
                        ViolationKind::StaleOffset,
                        format!(
                            "message got lesser offset that was known ({}) before it's written: {}={}@{}",
                            write.max_offset, write.key, write.op, offset
                        ),
                    );
                }
                self.max_offset = self.max_offset.max(offset);
                let duplicate = self.ok_writes.get(&offset).map(|known| {
                    format!(
                        "message got already assigned offset: {}={} vs {}={} @ {}",
                        write.key, write.op, known.key, known.op, offset
                    )
                });
                if let Some(description) = duplicate {
                    self.violation(ViolationKind::DuplicateOffset, description);
                }
                self.stats.writes_confirmed += 1;
                self.ok_writes.insert(offset, write);
            }
            State::Error | State::Timeout => {
                if let Some(mut write) = self.last_write.remove(&thread_id) {
                    write.finished_us = Some(now);
                    self.stats.writes_uncertain += 1;
                    self.err_writes.insert(write.op, write);
                }
            }
            State::Started | State::Event | State::Violation | State::Log => {}
        }
        Ok(())
    }

    /// Read the committed log back and reconcile every pending write.
    pub fn reread_and_check(&mut self, source: &mut dyn CommittedLogSource, policy: &RereadPolicy) -> Result<()> {
        if self.has_violation() {
            return Ok(());
        }
        let (first_offset, last_offset) = match (self.first_offset, self.last_offset) {
            (Some(first), Some(last)) => (first, last),
            _ => {
                debug!(target: "consistency", "no confirmed writes, skipping re-read");
                return Ok(());
            }
        };

        let mut retries = policy.attempts;
        let mut prev_offset: i64 = -1;
        let mut is_active = true;
        while is_active {
            if retries == 0 {
                return Err(HarnessError::SourceUnreachable {
                    attempts: policy.attempts,
                });
            }
            let records = source.poll(policy.poll_timeout)?;
            if records.is_empty() {
                if source.exhausted() {
                    debug!(target: "consistency", "committed log ends at {}, expected up to {}", prev_offset, last_offset);
                    break;
                }
                retries -= 1;
                if !policy.empty_poll_backoff.is_zero() {
                    thread::sleep(policy.empty_poll_backoff);
                }
                continue;
            }
            retries = policy.attempts;

            for record in records {
                self.stats.records_reread += 1;
                let offset = record.offset;
                if offset <= prev_offset {
                    self.violation(
                        ViolationKind::NonMonotonicOffset,
                        format!("offsets must increase; observed {} after {}", offset, prev_offset),
                    );
                }
                prev_offset = offset;

                if offset < first_offset {
                    continue;
                }

                let (key, op) = (record.key, record.op);
                if let Some(write) = self.ok_writes.remove(&offset) {
                    if write.op != op || write.key != key {
                        self.violation(
                            ViolationKind::Mismatch,
                            format!(
                                "read message {}={}@{} doesn't match written message {}={}@{}",
                                key, op, offset, write.key, write.op, offset
                            ),
                        );
                    }
                } else if let Some(write) = self.err_writes.remove(&op) {
                    if write.key != key {
                        self.violation(
                            ViolationKind::Mismatch,
                            format!(
                                "read message {}={}@{} doesn't match written message {}={}",
                                key, op, offset, write.key, write.op
                            ),
                        );
                    }
                    if offset <= write.max_offset {
                        self.violation(
                            ViolationKind::StaleOffset,
                            format!(
                                "message got lesser offset that was known ({}) before it's written: {}={}@{}",
                                write.max_offset, write.key, write.op, offset
                            ),
                        );
                    }
                } else {
                    self.violation(
                        ViolationKind::UnknownMessage,
                        format!("read unknown message {}={}@{}", key, op, offset),
                    );
                }

                if offset >= last_offset {
                    is_active = false;
                    break;
                }
            }
        }

        let mut lost: Vec<(i64, Write)> = self.ok_writes.drain().collect();
        lost.sort_by_key(|(offset, _)| *offset);
        for (offset, write) in lost {
            self.violation(
                ViolationKind::LostWrite,
                format!("lost message found {}={}@{}", write.key, write.op, offset),
            );
        }
        Ok(())
    }
}
