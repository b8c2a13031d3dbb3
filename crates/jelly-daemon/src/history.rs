//! Append-only history journal with mmap-based snapshot reads.
//!
//! Writes go through a single [`HistoryStore`] owned by the core task, one
//! JSON line per entry, flushed per append so a snapshot taken right after
//! always sees the entry. Snapshots memory-map the file and walk backwards
//! for the last N lines, so replaying a long-lived journal never reads the
//! whole file into memory.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::debug;

use jelly_proto::HistoryEntry;
use jelly_types::JellyError;

/// Default number of entries replayed on client registration.
pub const DEFAULT_SNAPSHOT_LIMIT: usize = 80;

/// Single-writer journal handle.
pub struct HistoryStore {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl HistoryStore {
    /// Open or create the journal for appending.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, JellyError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path,
        })
    }

    /// Append one entry as a JSON line and flush.
    pub fn append(&mut self, entry: &HistoryEntry) -> Result<(), JellyError> {
        let json = serde_json::to_string(entry)
            .map_err(|e| JellyError::Fatal(format!("failed to serialize history entry: {e}")))?;
        self.writer.write_all(json.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    /// The last `limit` entries in original order.
    ///
    /// Malformed lines are skipped silently; a missing file yields an empty
    /// list. Only called at client registration.
    pub fn read_snapshot(&self, limit: usize) -> Vec<HistoryEntry> {
        read_snapshot_at(&self.path, limit)
    }

    /// Path to the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Snapshot read decoupled from the writer handle.
pub fn read_snapshot_at(path: &Path, limit: usize) -> Vec<HistoryEntry> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return Vec::new(),
    };
    let len = match file.metadata() {
        Ok(m) => m.len(),
        Err(_) => return Vec::new(),
    };
    if len == 0 {
        return Vec::new();
    }

    // SAFETY: read-only mapping of an append-only file. Bytes already
    // written are never modified in place; appends land beyond the mapping
    // boundary and are simply not visible to this snapshot.
    let mmap = match unsafe { Mmap::map(&file) } {
        Ok(m) => m,
        Err(e) => {
            debug!(error = %e, "failed to map history journal");
            return Vec::new();
        }
    };
    let data = match std::str::from_utf8(mmap.as_ref()) {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };

    let mut entries: Vec<HistoryEntry> = Vec::with_capacity(limit.min(256));
    let mut end = data.len();
    if end > 0 && data.as_bytes()[end - 1] == b'\n' {
        end -= 1;
    }

    // Walk lines newest-first until we have `limit` parseable entries.
    while entries.len() < limit && end > 0 {
        let start = data[..end].rfind('\n').map(|i| i + 1).unwrap_or(0);
        let line = &data[start..end];
        if !line.is_empty() {
            match serde_json::from_str::<HistoryEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(_) => debug!("skipping malformed history line"),
            }
        }
        end = if start > 0 { start - 1 } else { 0 };
    }

    entries.reverse();
    entries
}
