//! Tracing setup: text or JSON console output plus per-experiment log files.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Once};

use clap::ValueEnum;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{prelude::*, EnvFilter};

use crate::error::{HarnessError, Result};

static INIT: Once = Once::new();

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber once: a stderr layer in `log_format` plus a
/// text layer feeding `sink`, which the suite driver points at the current
/// experiment's `log` file.
pub fn init(log_format: LogFormat, sink: ExperimentLogSink) -> Result<()> {
    let mut init_result: Option<Result<()>> = None;
    INIT.call_once(|| {
        let sink_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_writer(sink)
            .with_filter(build_env_filter());
        let registry = tracing_subscriber::registry().with(sink_layer);
        let result = match log_format {
            LogFormat::Text => {
                let fmt_layer = tracing_subscriber::fmt::layer()
                    .with_writer(io::stderr)
                    .with_target(true)
                    .with_level(true)
                    .compact()
                    .with_filter(build_env_filter());
                registry.with(fmt_layer).try_init()
            }
            LogFormat::Json => {
                let fmt_layer = tracing_subscriber::fmt::layer()
                    .with_writer(io::stderr)
                    .with_target(true)
                    .with_level(true)
                    .json()
                    .with_filter(build_env_filter());
                registry.with(fmt_layer).try_init()
            }
        };
        init_result = Some(result.map_err(|e| HarnessError::infra(format!("can't install tracing subscriber: {}", e))));
    });
    init_result.unwrap_or(Ok(()))
}

/// A log destination that can be re-pointed at runtime. Writes are dropped
/// while nothing is attached.
#[derive(Clone, Default)]
pub struct ExperimentLogSink {
    file: Arc<Mutex<Option<File>>>,
}

impl ExperimentLogSink {
    pub fn new() -> Self {
        ExperimentLogSink::default()
    }

    /// Start appending to `path`, creating its parent directory.
    pub fn attach(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        *self.file.lock() = Some(file);
        Ok(())
    }

    /// Flush and close the current file.
    pub fn detach(&self) {
        if let Some(mut file) = self.file.lock().take() {
            let _ = file.flush();
        }
    }

    pub fn is_attached(&self) -> bool {
        self.file.lock().is_some()
    }
}

pub struct SinkWriter {
    file: Arc<Mutex<Option<File>>>,
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.lock().as_mut() {
            Some(file) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.lock().as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for ExperimentLogSink {
    type Writer = SinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SinkWriter {
            file: self.file.clone(),
        }
    }
}
