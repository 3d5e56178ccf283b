//! Append-only NDJSON transcript for one session.
//!
//! Each line is a single [`TranscriptEntry`]. The file lives under the
//! configured storage root as `session-<id>.ndjson`.

use std::fs::{DirBuilder, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TranscriptError {
    #[error("failed to create transcript directory {}: {}", .0.display(), .1)]
    CreateDir(PathBuf, #[source] std::io::Error),

    #[error("failed to open transcript {}: {}", .0.display(), .1)]
    Open(PathBuf, #[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Stdin,
    Stdout,
    Status,
}

/// One line of the transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub timestamp: String,
    pub direction: Direction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TranscriptEntry {
    /// A base64-encoded byte record (`stdin` or `stdout`).
    pub fn bytes(direction: Direction, at: DateTime<Utc>, data_b64: String) -> Self {
        Self {
            timestamp: rfc3339(at),
            direction,
            encoding: Some("base64".to_string()),
            data: Some(data_b64),
            message: None,
        }
    }

    pub fn status(at: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self {
            timestamp: rfc3339(at),
            direction: Direction::Status,
            encoding: None,
            data: None,
            message: Some(message.into()),
        }
    }
}

/// RFC3339 with nanosecond precision so lines written within the same
/// second still sort in insertion order.
pub fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Path of the transcript for session `id` under `root`.
pub fn transcript_path(root: &Path, id: &str) -> PathBuf {
    root.join(format!("session-{id}.ndjson"))
}

/// Buffered append-only writer.
///
/// Not internally synchronized; the owning session serializes access
/// behind its transcript lock.
pub struct TranscriptWriter {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl TranscriptWriter {
    /// Create the storage root if needed (0755) and open the session file
    /// for append (0640).
    pub fn open(root: &Path, id: &str) -> Result<Self, TranscriptError> {
        let mut dir = DirBuilder::new();
        dir.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            dir.mode(0o755);
        }
        dir.create(root)
            .map_err(|e| TranscriptError::CreateDir(root.to_path_buf(), e))?;

        let path = transcript_path(root, id);
        let mut opts = OpenOptions::new();
        opts.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o640);
        }
        let file = opts
            .open(&path)
            .map_err(|e| TranscriptError::Open(path.clone(), e))?;

        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }

    /// Append one entry. Encode or write failures drop the entry; the
    /// newline is only written after the JSON itself made it out.
    pub fn append(&mut self, entry: &TranscriptEntry) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let line = match serde_json::to_vec(entry) {
            Ok(line) => line,
            Err(e) => {
                tracing::debug!(?e, "dropping unencodable transcript entry");
                return;
            }
        };
        if writer.write_all(&line).is_ok() {
            let _ = writer.write_all(b"\n");
        }
    }

    /// Flush and close. Later appends are ignored.
    pub fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                tracing::warn!(path = %self.path.display(), ?e, "failed to flush transcript");
            }
        }
    }
}

impl Drop for TranscriptWriter {
    fn drop(&mut self) {
        self.close();
    }
}

/// Read back every entry of a transcript. Used by tests and tooling; the
/// server itself never reads transcripts.
pub fn read_entries(path: &Path) -> std::io::Result<Vec<TranscriptEntry>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}
