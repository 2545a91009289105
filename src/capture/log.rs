//! Append-only JSON-lines capture log.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::capture::event::NetworkEvent;
use crate::error::CaptureError;

/// File name of the capture log inside a bundle.
pub const CAPTURE_LOG_FILE: &str = "capture.jsonl";

/// One line of the capture log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CaptureRecord {
    Start {
        at: DateTime<Utc>,
    },
    Event(NetworkEvent),
    Unparsed {
        at: DateTime<Utc>,
        line: String,
    },
    Stop {
        at: DateTime<Utc>,
        complete: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default)]
        out_of_window: u64,
    },
}

/// Writer side of the capture log. Only the recorder appends to it.
pub struct CaptureLogWriter {
    inner: tokio::io::BufWriter<tokio::fs::File>,
    path: PathBuf,
}

impl CaptureLogWriter {
    /// Create a fresh log, refusing to reuse an existing file.
    pub async fn create(path: &Path) -> Result<Self, CaptureError> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        Ok(Self {
            inner: tokio::io::BufWriter::new(file),
            path: path.to_path_buf(),
        })
    }

    /// Reopen an existing log for appending.
    pub async fn reopen(path: &Path) -> Result<Self, CaptureError> {
        let file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            inner: tokio::io::BufWriter::new(file),
            path: path.to_path_buf(),
        })
    }

    pub async fn append(&mut self, record: &CaptureRecord) -> Result<(), CaptureError> {
        let mut line = serde_json::to_string(record)
            .map_err(|e| CaptureError::Recorder(format!("failed to encode record: {}", e)))?;
        line.push('\n');
        self.inner.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Flush buffered records and sync them to disk.
    pub async fn flush_durable(&mut self) -> Result<(), CaptureError> {
        self.inner.flush().await?;
        self.inner.get_ref().sync_all().await?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A line of the log that is not a valid record.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedLine {
    pub line_number: usize,
    pub content: String,
}

/// Read side of a capture log. Every call to `records` replays from the start.
#[derive(Debug, Clone)]
pub struct CaptureLog {
    path: PathBuf,
}

impl CaptureLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lazily iterate over the records in log order. Lines that are not
    /// valid UTF-8 or not a valid record come back as [`MalformedLine`];
    /// only read failures are errors.
    pub fn records(
        &self,
    ) -> std::io::Result<impl Iterator<Item = std::io::Result<Result<CaptureRecord, MalformedLine>>>>
    {
        let reader = BufReader::new(File::open(&self.path)?);
        Ok(reader
            .split(b'\n')
            .enumerate()
            .filter_map(|(index, line)| match line {
                Ok(bytes) => decode_line(index + 1, &bytes).map(Ok),
                Err(e) => Some(Err(e)),
            }))
    }
}

/// Decode one raw line. Blank lines yield `None`.
fn decode_line(line_number: usize, bytes: &[u8]) -> Option<Result<CaptureRecord, MalformedLine>> {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    let malformed = || MalformedLine {
        line_number,
        content: String::from_utf8_lossy(bytes).into_owned(),
    };
    let Ok(content) = std::str::from_utf8(bytes) else {
        return Some(Err(malformed()));
    };
    if content.trim().is_empty() {
        return None;
    }
    Some(serde_json::from_str::<CaptureRecord>(content).map_err(|_| malformed()))
}
