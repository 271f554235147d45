//! Workload log format.
//!
//! Each line is `thread_id \t elapsed_delta_us \t command \t args...`. The
//! first line carries an absolute timestamp, every later one the delta since
//! the previous line.

use std::fmt;

use crate::error::{HarnessError, Result};

/// Per-thread state driven by the command column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Started,
    Sending,
    Ok,
    Error,
    Timeout,
    /// Phase boundary emitted by the orchestrator.
    Event,
    /// Anomaly detected by the workload itself.
    Violation,
    /// Free-form diagnostics.
    Log,
}

impl State {
    pub fn from_token(token: &str) -> Option<State> {
        Some(match token {
            "started" => State::Started,
            "send" => State::Sending,
            "ok" => State::Ok,
            "err" => State::Error,
            "time" => State::Timeout,
            "event" => State::Event,
            "violation" => State::Violation,
            "log" => State::Log,
            _ => return None,
        })
    }

    pub fn token(self) -> &'static str {
        match self {
            State::Started => "started",
            State::Sending => "send",
            State::Ok => "ok",
            State::Error => "err",
            State::Timeout => "time",
            State::Event => "event",
            State::Violation => "violation",
            State::Log => "log",
        }
    }

    /// Pseudo-states carry no write semantics and never change thread state.
    pub fn is_pseudo(self) -> bool {
        matches!(self, State::Event | State::Violation | State::Log)
    }

    /// Whether `next` may follow `self` on the same thread.
    pub fn can_transition_to(self, next: State) -> bool {
        match self {
            State::Started | State::Ok | State::Error | State::Timeout => next == State::Sending,
            State::Sending => matches!(next, State::Ok | State::Error | State::Timeout),
            State::Event | State::Violation | State::Log => false,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// One parsed line. `thread_id` is only parsed for non-pseudo commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine<'a> {
    pub thread_id: Option<u64>,
    pub delta_us: i64,
    pub state: State,
    pub args: Vec<&'a str>,
}

impl<'a> LogLine<'a> {
    pub fn parse(line_no: usize, line: &'a str) -> Result<LogLine<'a>> {
        let parts: Vec<&str> = line.trim_end_matches(['\r', '\n']).split('\t').collect();
        if parts.len() < 3 {
            return Err(HarnessError::malformed(line_no, format!("expected at least 3 fields in {:?}", line)));
        }
        let state = State::from_token(parts[2])
            .ok_or_else(|| HarnessError::malformed(line_no, format!("unknown cmd \"{}\"", parts[2])))?;
        let delta_us = parts[1]
            .parse()
            .map_err(|_| HarnessError::malformed(line_no, format!("bad timestamp \"{}\"", parts[1])))?;
        let thread_id = if state.is_pseudo() {
            None
        } else {
            Some(
                parts[0]
                    .parse()
                    .map_err(|_| HarnessError::malformed(line_no, format!("bad thread id \"{}\"", parts[0])))?,
            )
        };
        Ok(LogLine {
            thread_id,
            delta_us,
            state,
            args: parts[3..].to_vec(),
        })
    }

    /// The `idx`-th argument, or a malformed-log error naming `what`.
    pub fn arg(&self, line_no: usize, idx: usize, what: &str) -> Result<&'a str> {
        self.args
            .get(idx)
            .copied()
            .ok_or_else(|| HarnessError::malformed(line_no, format!("{} command without {}", self.state, what)))
    }

    pub fn parse_arg<T: std::str::FromStr>(&self, line_no: usize, idx: usize, what: &str) -> Result<T> {
        let raw = self.arg(line_no, idx, what)?;
        raw.parse()
            .map_err(|_| HarnessError::malformed(line_no, format!("bad {} \"{}\"", what, raw)))
    }
}

/// Format one line the way workload adapters emit it.
pub fn format_line(thread_id: u64, delta_us: i64, state: State, args: &[&str]) -> String {
    let mut line = format!("{}\t{}\t{}", thread_id, delta_us, state.token());
    for arg in args {
        line.push('\t');
        line.push_str(arg);
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        assert!(State::Started.can_transition_to(State::Sending));
        assert!(!State::Started.can_transition_to(State::Ok));
        assert!(State::Sending.can_transition_to(State::Timeout));
        assert!(!State::Sending.can_transition_to(State::Sending));
        assert!(State::Error.can_transition_to(State::Sending));
        assert!(!State::Ok.can_transition_to(State::Ok));
    }

    #[test]
    fn test_parse_line() {
        let line = LogLine::parse(1, "3\t120\tok\t42\n").unwrap();
        assert_eq!(line.thread_id, Some(3));
        assert_eq!(line.delta_us, 120);
        assert_eq!(line.state, State::Ok);
        assert_eq!(line.parse_arg::<i64>(1, 0, "offset").unwrap(), 42);
    }

    #[test]
    fn test_pseudo_state_skips_thread_id() {
        let line = LogLine::parse(1, "-\t5\tevent\tinjecting").unwrap();
        assert_eq!(line.thread_id, None);
        assert_eq!(line.args, vec!["injecting"]);
    }

    #[test]
    fn test_unknown_command_is_malformed() {
        let err = LogLine::parse(7, "0\t1\tfrobnicate").unwrap_err();
        assert!(matches!(err, HarnessError::MalformedLog { line: 7, .. }));
    }

    #[test]
    fn test_format_roundtrips_through_parse() {
        let text = format_line(1, 10, State::Started, &["key-1"]);
        let line = LogLine::parse(1, &text).unwrap();
        assert_eq!(line.state, State::Started);
        assert_eq!(line.args, vec!["key-1"]);
    }
}
