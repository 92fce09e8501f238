// Compile progress tracing
// Append-only JSONL trace of per-store events during a compile run

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("Trace file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed trace line {line}: {source}")]
    Malformed {
        line: usize,
        source: serde_json::Error,
    },

    #[error("Trace entry not serializable: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Stage of a store's compile job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStage {
    Start,
    Append,
    Shuffle,
    Complete,
    Skipped,
    Failed,
}

/// One line of the trace file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    /// RFC 3339 timestamp
    pub timestamp: String,

    /// Output path of the store this entry concerns
    pub store: String,

    pub stage: TraceStage,

    /// Fraction of the stage completed, clamped to [0.0, 1.0]
    pub progress: f32,

    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl TraceEntry {
    pub fn new(store: &Path, stage: TraceStage, progress: f32, message: impl Into<String>) -> Self {
        TraceEntry {
            timestamp: Utc::now().to_rfc3339(),
            store: store.display().to_string(),
            stage,
            progress: progress.clamp(0.0, 1.0),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// One JSONL record, trailing newline included
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Appends entries to a JSONL file. Safe to share between worker threads;
/// each entry is written whole.
pub struct TraceWriter {
    file_path: PathBuf,
    lock: Mutex<()>,
}

impl TraceWriter {
    pub fn new(file_path: PathBuf) -> Self {
        TraceWriter {
            file_path,
            lock: Mutex::new(()),
        }
    }

    /// Append one entry, creating the file if needed
    pub fn write(&self, entry: &TraceEntry) -> Result<(), TraceError> {
        let record = entry.to_json_line()?;
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)?
            .write_all(record.as_bytes())?;
        Ok(())
    }

    /// Append an entry, logging instead of failing. Tracing never aborts a job.
    pub fn record(&self, entry: TraceEntry) {
        if let Err(e) = self.write(&entry) {
            log::warn!("Failed to write trace entry to {}: {}", self.file_path.display(), e);
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }
}

/// Read all entries of a JSONL trace file
pub fn read_trace_file(path: &Path) -> Result<Vec<TraceEntry>, TraceError> {
    let reader = BufReader::new(File::open(path)?);

    let mut entries = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry = serde_json::from_str(&line).map_err(|source| TraceError::Malformed {
            line: index + 1,
            source,
        })?;
        entries.push(entry);
    }
    Ok(entries)
}
