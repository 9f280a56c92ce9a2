//! Diagnostic sink for the proxy server.
//!
//! Appends raw protocol traffic to a file so a misbehaving proxy can be inspected
//! after the fact. Purely a side channel: write failures are logged and dropped.

use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::bridge::protocol::Response;
use crate::config::DiagnosticsConfig;

pub struct DiagnosticLog {
    sink: Option<(PathBuf, Mutex<File>)>,
}

impl DiagnosticLog {
    /// Sink that records nothing.
    pub fn disabled() -> Self {
        Self { sink: None }
    }

    /// Open the sink in append mode if the config enables it.
    pub fn open(config: &DiagnosticsConfig) -> io::Result<Self> {
        if !config.enabled {
            return Ok(Self::disabled());
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.path)?;
        tracing::debug!(path = %config.path.display(), "Diagnostic log opened");
        Ok(Self {
            sink: Some((config.path.clone(), Mutex::new(file))),
        })
    }

    /// Like [`open`](Self::open), but falls back to a disabled sink on failure.
    pub fn open_or_disabled(config: &DiagnosticsConfig) -> Self {
        match Self::open(config) {
            Ok(log) => log,
            Err(e) => {
                tracing::warn!(
                    path = %config.path.display(),
                    error = %e,
                    "Failed to open diagnostic log, continuing without it"
                );
                Self::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.sink.as_ref().map(|(path, _)| path.as_path())
    }

    /// Append a lifecycle marker such as `Starting`.
    pub fn mark(&self, event: &str) {
        self.write_line(format_args!("{event}"));
    }

    /// Append `label: detail`.
    pub fn record(&self, label: &str, detail: impl Display) {
        self.write_line(format_args!("{label}: {detail}"));
    }

    /// Append a human-readable summary of an execution result.
    pub fn record_response(&self, response: &Response) {
        if !self.is_enabled() {
            return;
        }
        self.record(
            "result",
            format_args!(
                "pid={} status={} stdout={:?} stderr={:?}",
                response.pid,
                response.status,
                String::from_utf8_lossy(&response.stdout),
                String::from_utf8_lossy(&response.stderr),
            ),
        );
    }

    fn write_line(&self, line: std::fmt::Arguments<'_>) {
        let Some((path, file)) = &self.sink else {
            return;
        };
        let mut file = match file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let result = writeln!(file, "{line}").and_then(|_| file.flush());
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "Failed to write diagnostic log");
        }
    }
}
