#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Structured JSON logging for training runs.
//!
//! Every record is one JSON line in the run's log file. Records at or above the
//! console threshold are echoed to stderr as a compact human-readable line.

use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Log severity level, ordered from least to most severe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Debug information.
    Debug,
    /// Informational events.
    Info,
    /// Warning indicator.
    Warn,
    /// Error indicator.
    Error,
}

impl LogLevel {
    /// Upper-case label used in console output.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

/// Structured log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Timestamp in ISO8601.
    pub timestamp: DateTime<Utc>,
    /// Module emitting the log.
    pub module: String,
    /// Severity.
    pub level: LogLevel,
    /// Human-readable message.
    pub message: String,
    /// Run index the record belongs to, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<usize>,
    /// Arbitrary JSON payload for metrics/fields.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl LogRecord {
    /// Creates a record with the provided info.
    #[must_use]
    pub fn new(module: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            module: module.into(),
            level,
            message: message.into(),
            run: None,
            metadata: serde_json::Map::new(),
        }
    }

    /// Tags the record with a run index.
    #[must_use]
    pub fn with_run(mut self, run: usize) -> Self {
        self.run = Some(run);
        self
    }

    /// Copies the fields of a JSON object into the metadata map. Non-object values are
    /// stored under `data`.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        match metadata {
            serde_json::Value::Object(map) => self.metadata.extend(map),
            serde_json::Value::Null => {}
            other => {
                self.metadata.insert("data".into(), other);
            }
        }
        self
    }

    fn console_line(&self) -> String {
        let run = self.run.map(|run| format!(" run={run}")).unwrap_or_default();
        let fields = if self.metadata.is_empty() {
            String::new()
        } else {
            format!(" {}", serde_json::Value::Object(self.metadata.clone()))
        };
        format!(
            "{} - {} - {}{} - {}{}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.module,
            self.level.label(),
            run,
            self.message,
            fields
        )
    }
}

/// Thread-safe JSON logger with append-only semantics.
#[derive(Debug)]
pub struct JsonLogger {
    path: PathBuf,
    writer: Mutex<File>,
    file_level: LogLevel,
    console_level: Option<LogLevel>,
}

impl JsonLogger {
    /// Creates or opens a logger at the desired path. Every level is written to the file and
    /// nothing is echoed to the console.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(file),
            file_level: LogLevel::Debug,
            console_level: None,
        })
    }

    /// Drops records below `level` instead of writing them to the file.
    #[must_use]
    pub fn with_file_level(mut self, level: LogLevel) -> Self {
        self.file_level = level;
        self
    }

    /// Echoes records at or above `level` to stderr.
    #[must_use]
    pub fn with_console_level(mut self, level: LogLevel) -> Self {
        self.console_level = Some(level);
        self
    }

    /// Writes a log record as JSON line.
    pub fn log(&self, record: &LogRecord) -> Result<()> {
        if self
            .console_level
            .is_some_and(|threshold| record.level >= threshold)
        {
            eprintln!("{}", record.console_line());
        }
        if record.level < self.file_level {
            return Ok(());
        }
        let mut writer = self.writer.lock();
        serde_json::to_writer(&mut *writer, record)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    /// Returns the underlying file path (useful for tests).
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Reads every record from a JSON-lines log file, skipping blank lines.
pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<LogRecord>> {
    let contents = fs::read_to_string(path)?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(anyhow::Error::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn writes_json_lines() {
        let dir = tempdir().unwrap();
        let logger = JsonLogger::new(dir.path().join("test.log")).unwrap();
        logger
            .log(&LogRecord::new("module", LogLevel::Info, "hello"))
            .unwrap();
        let content = fs::read_to_string(logger.path()).unwrap();
        assert!(content.contains("\"message\":\"hello\""));
    }

    #[test]
    fn file_level_filters_records() {
        let dir = tempdir().unwrap();
        let logger = JsonLogger::new(dir.path().join("run.log"))
            .unwrap()
            .with_file_level(LogLevel::Info);
        logger
            .log(&LogRecord::new("trainer", LogLevel::Debug, "batch"))
            .unwrap();
        logger
            .log(
                &LogRecord::new("trainer", LogLevel::Warn, "slow epoch")
                    .with_run(2)
                    .with_metadata(json!({ "epoch": 4 })),
            )
            .unwrap();
        let records = read_records(logger.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].run, Some(2));
        assert_eq!(records[0].metadata["epoch"], json!(4));
    }

    #[test]
    fn levels_are_ordered_by_severity() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Warn < LogLevel::Error);
    }
}
