//! Harness error taxonomy.
//!
//! Errors here describe failures of the harness or of its inputs. A proven
//! consistency violation is never an error: it is a `Severity::Failed`
//! verdict produced by a check.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Everything that can abort an experiment, a check, or the suite.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Unknown workload/fault/check name or an invalid combination.
    /// Raised during validation, before any cluster state is touched.
    #[error("configuration error: {0}")]
    Config(String),

    /// A control operation did not converge within its bound.
    /// The requested change may still converge later.
    #[error("timed out after {elapsed:?}: {what}")]
    Timeout { what: String, elapsed: Duration },

    /// The workload log cannot be trusted (bad token, bad field,
    /// illegal state transition).
    #[error("malformed workload log at line {line}: {reason}")]
    MalformedLog { line: usize, reason: String },

    /// The committed log could not be read back.
    #[error("committed log unreachable after {attempts} empty polls")]
    SourceUnreachable { attempts: u32 },

    /// A remote collaborator failed (log fetch, node unreachable, ...).
    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    /// The experiment failed and the configuration asked to stop the run.
    #[error("experiment {experiment_id} failed with exit_on_violation set")]
    ViolationHalt { experiment_id: String },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl HarnessError {
    pub fn config(msg: impl Into<String>) -> Self {
        HarnessError::Config(msg.into())
    }

    pub fn infra(msg: impl Into<String>) -> Self {
        HarnessError::Infrastructure(msg.into())
    }

    pub fn timeout(what: impl Into<String>, elapsed: Duration) -> Self {
        HarnessError::Timeout {
            what: what.into(),
            elapsed,
        }
    }

    pub fn malformed(line: usize, reason: impl Into<String>) -> Self {
        HarnessError::MalformedLog {
            line,
            reason: reason.into(),
        }
    }

    /// Whether the error came from validation, i.e. nothing was touched yet.
    pub fn is_config(&self) -> bool {
        matches!(self, HarnessError::Config(_))
    }
}
