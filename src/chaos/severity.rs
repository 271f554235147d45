//! Verdict lattice.
//!
//! `Passed < Unknown < Hang < Failed`. Verdicts are folded with
//! [`Severity::more_severe`] across checks, nodes and repeated runs; the
//! order of folding never matters.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome of a check, an experiment, or a whole suite.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    #[default]
    Passed,
    Unknown,
    Hang,
    Failed,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Passed,
        Severity::Unknown,
        Severity::Hang,
        Severity::Failed,
    ];

    /// The worse of the two verdicts.
    pub fn more_severe(self, other: Severity) -> Severity {
        self.max(other)
    }

    /// The better of the two verdicts.
    pub fn least_severe(self, other: Severity) -> Severity {
        self.min(other)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Passed => "PASSED",
            Severity::Unknown => "UNKNOWN",
            Severity::Hang => "HANG",
            Severity::Failed => "FAILED",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
