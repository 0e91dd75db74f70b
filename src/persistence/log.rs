//! Append-only event journal with crash-safe replay.
//!
//! One JSON object per line. A crash mid-write can leave a partial last line;
//! replay drops it.
//!
//! Task and lock entries are synced as they are written. Status entries are
//! left to the next `sync` call.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use super::fsync::fsync_file;
use crate::events::{Event, EventPayload};

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EventLogError>;

/// One journaled event.
///
/// Example JSON:
/// ```json
/// {"seq":7,"ts":"2024-01-15T10:00:00Z","stack":"shop/web","emitted_at":"...","subject":"lock","locked":true,"lock":{...}}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Monotonic sequence number.
    pub seq: u64,

    /// When the entry was written.
    pub ts: DateTime<Utc>,

    #[serde(flatten)]
    pub event: Event,
}

impl JournalEntry {
    /// Entries that must be durable before the journal moves on.
    pub fn is_critical(&self) -> bool {
        matches!(
            self.event.payload,
            EventPayload::Task { .. } | EventPayload::Lock { .. }
        )
    }
}

/// An append-only event journal.
pub struct EventLog {
    file: File,
    next_seq: u64,
}

impl EventLog {
    /// Opens the journal for appending. Replays it first, so a damaged tail
    /// is cut off and numbering continues after the last intact entry.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let (_, next_seq) = Self::replay(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(EventLog { file, next_seq })
    }

    /// Appends an event under the next sequence number.
    pub fn append(&mut self, event: Event) -> Result<JournalEntry> {
        let entry = JournalEntry {
            seq: self.next_seq,
            ts: Utc::now(),
            event,
        };

        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        if entry.is_critical() {
            fsync_file(&self.file)?;
        }
        self.next_seq = entry.seq + 1;
        Ok(entry)
    }

    /// Syncs the journal to disk.
    pub fn sync(&self) -> io::Result<()> {
        fsync_file(&self.file)
    }

    /// Sequence number the next append will receive.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Reads every intact entry and cuts the file back to the last one.
    ///
    /// Returns the entries and the next sequence number; a missing file is an
    /// empty journal. Reading stops at the first line that does not parse or
    /// whose `seq` is not above its predecessor's, and everything from that
    /// line on is truncated away.
    pub fn replay(path: impl AsRef<Path>) -> Result<(Vec<JournalEntry>, u64)> {
        let path = path.as_ref();
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata()?.len();

        let mut reader = BufReader::new(file);
        let mut entries: Vec<JournalEntry> = Vec::new();
        let mut intact: u64 = 0;
        let mut line = String::new();

        loop {
            line.clear();
            let read = reader.read_line(&mut line)?;
            if read == 0 {
                break;
            }
            let text = line.trim();
            if !text.is_empty() {
                let Ok(entry) = serde_json::from_str::<JournalEntry>(text) else {
                    break;
                };
                if entries.last().is_some_and(|prev| entry.seq <= prev.seq) {
                    break;
                }
                entries.push(entry);
            }
            intact += read as u64;
        }

        if intact < len {
            warn!(path = %path.display(), kept = intact, dropped = len - intact, "truncating damaged journal tail");
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(intact)?;
            fsync_file(&file)?;
        }

        let next_seq = entries.last().map_or(0, |e| e.seq + 1);
        Ok((entries, next_seq))
    }
}
