//! Write-consistency oracle.
//!
//! Replays a workload's write-attempt log, then reads the partition's
//! committed log back and proves or disproves that:
//! - every acknowledged write is present at its acknowledged offset
//! - no write got an offset older than one already observed when it was sent
//! - the committed log holds nothing the client never attempted
//! - committed offsets strictly increase

pub mod consistency;
pub mod log;
pub mod player;
pub mod source;


use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::chaos::severity::Severity;
use crate::error::Result;

use player::LogPlayer;
pub use source::{CommittedLogSource, FileLogSource};

/// File name of the diagnostic artifact kept next to the workload log.
pub const DIAGNOSTICS_FILE: &str = "consistency.log";

/// Kinds of consistency violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// A write got an offset not newer than one observed before it was sent.
    StaleOffset,
    /// Two confirmed writes claim the same offset.
    DuplicateOffset,
    /// The committed log went backwards or repeated an offset.
    NonMonotonicOffset,
    /// The committed message differs from what the client wrote there.
    Mismatch,
    /// The committed log holds a message nobody attempted.
    UnknownMessage,
    /// A confirmed write is missing from the committed log.
    LostWrite,
    /// The workload flagged the anomaly itself.
    ReportedByWorkload,
}

/// A consistency violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub description: String,
}

/// Counters gathered while validating.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OracleStats {
    pub lines: u64,
    pub writes_sent: u64,
    pub writes_confirmed: u64,
    pub writes_uncertain: u64,
    pub records_reread: u64,
}

/// How hard the re-read tries before giving up on the source.
#[derive(Debug, Clone)]
pub struct RereadPolicy {
    /// Consecutive empty polls tolerated.
    pub attempts: u32,
    pub poll_timeout: Duration,
    pub empty_poll_backoff: Duration,
}

impl Default for RereadPolicy {
    fn default() -> Self {
        RereadPolicy {
            attempts: 5,
            poll_timeout: Duration::from_secs(10),
            empty_poll_backoff: Duration::from_secs(5),
        }
    }
}

/// Verdict of one validation run.
#[derive(Debug, Clone, Serialize)]
pub struct OracleReport {
    pub result: Severity,
    pub violations: Vec<Violation>,
    pub stats: OracleStats,
    /// Why the log could not be judged (UNKNOWN only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OracleReport {
    fn unknown(error: String, violations: Vec<Violation>, stats: OracleStats) -> Self {
        OracleReport {
            result: Severity::Unknown,
            violations,
            stats,
            error: Some(error),
        }
    }

    pub fn has(&self, kind: ViolationKind) -> bool {
        self.violations.iter().any(|v| v.kind == kind)
    }
}

fn replay(player: &mut LogPlayer, reader: &mut dyn BufRead) -> Result<()> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        if !line.ends_with('\n') {
            // torn tail of a killed workload
            debug!(target: "consistency", "ignoring unterminated last line {:?}", line);
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }
        player.apply(&line)?;
    }
}

/// Validate a workload log against the committed log.
///
/// Malformed input and an unreachable source yield `UNKNOWN`; any violation
/// yields `FAILED`.
pub fn validate(
    reader: &mut dyn BufRead,
    source: &mut dyn CommittedLogSource,
    policy: &RereadPolicy,
) -> OracleReport {
    let mut player = LogPlayer::new();
    let outcome = replay(&mut player, reader).and_then(|_| player.reread_and_check(source, policy));
    let (violations, stats) = player.into_parts();
    match outcome {
        Ok(()) => OracleReport {
            result: if violations.is_empty() {
                Severity::Passed
            } else {
                Severity::Failed
            },
            violations,
            stats,
            error: None,
        },
        Err(e) => {
            warn!(target: "consistency", "can't validate workload log: {}", e);
            OracleReport::unknown(e.to_string(), violations, stats)
        }
    }
}

/// Validate `<node_dir>/workload.log`, keeping a diagnostic artifact in
/// `<node_dir>/consistency.log` unless the verdict is PASSED.
pub fn validate_node_dir(
    node_dir: &Path,
    source: &mut dyn CommittedLogSource,
    policy: &RereadPolicy,
) -> OracleReport {
    let log_path = node_dir.join("workload.log");
    let report = match fs::File::open(&log_path) {
        Ok(file) => validate(&mut BufReader::new(file), source, policy),
        Err(e) => OracleReport::unknown(
            format!("can't open {}: {}", log_path.display(), e),
            Vec::new(),
            OracleStats::default(),
        ),
    };
    info!(target: "consistency", "{}: {} ({} violations)", log_path.display(), report.result, report.violations.len());

    let artifact = node_dir.join(DIAGNOSTICS_FILE);
    if report.result == Severity::Passed {
        let _ = fs::remove_file(&artifact);
    } else if let Err(e) = write_artifact(&artifact, &report) {
        warn!(target: "consistency", "can't write {}: {}", artifact.display(), e);
    }
    report
}

fn write_artifact(path: &Path, report: &OracleReport) -> Result<()> {
    let mut text = String::new();
    if let Some(err) = &report.error {
        text.push_str(&format!("error: {}\n", err));
    }
    for v in &report.violations {
        text.push_str(&format!("{:?}: {}\n", v.kind, v.description));
    }
    text.push_str(&serde_json::to_string_pretty(&report.stats)?);
    text.push('\n');
    fs::write(path, text)?;
    Ok(())
}
