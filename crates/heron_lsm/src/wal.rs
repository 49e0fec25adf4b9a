//! Append-only batch log backing the tree store.
//!
//! Record format: `[len: u32 LE][crc32: u32 LE][bincode(LogEntry)]`. A
//! truncated or corrupt tail stops replay with a warning; everything before
//! it is recovered. The log is the durable authority — the in-memory map is
//! rebuilt from it on open.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use heron_common::error::{HeronError, HeronResult};
use heron_common::types::SequenceNumber;

use crate::batch::WriteBatch;

const LOG_FILENAME: &str = "store.wal";

/// One durable record: a batch plus the sequence number it was assigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub sequence: SequenceNumber,
    pub batch: WriteBatch,
}

/// Append-only writer over the store's batch log.
pub struct BatchLog {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl BatchLog {
    /// Open (or create) the log in `dir` and replay all intact records.
    pub fn open(dir: &Path) -> HeronResult<(Self, Vec<LogEntry>)> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILENAME);

        let entries = if path.exists() {
            let mut raw = Vec::new();
            File::open(&path)?.read_to_end(&mut raw)?;
            parse_entries(&raw)
        } else {
            Vec::new()
        };

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok((
            Self {
                writer: BufWriter::new(file),
                path,
            },
            entries,
        ))
    }

    /// Append one record and flush it to the OS. `sync` additionally forces
    /// the data to stable storage.
    pub fn append(&mut self, entry: &LogEntry, sync: bool) -> HeronResult<()> {
        let data = bincode::serialize(entry)
            .map_err(|e| HeronError::Internal(format!("log serialization: {e}")))?;
        let len = data.len() as u32;
        let checksum = crc32fast::hash(&data);

        self.writer.write_all(&len.to_le_bytes())?;
        self.writer.write_all(&checksum.to_le_bytes())?;
        self.writer.write_all(&data)?;
        self.writer.flush()?;
        if sync {
            self.writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Force buffered records to stable storage.
    pub fn sync(&mut self) -> HeronResult<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Re-read the whole log from disk. Serves `updates_since` requests that
    /// reach further back than the in-memory tail.
    pub fn read_all(&self) -> HeronResult<Vec<LogEntry>> {
        let mut raw = Vec::new();
        File::open(&self.path)?.read_to_end(&mut raw)?;
        Ok(parse_entries(&raw))
    }
}

fn parse_entries(data: &[u8]) -> Vec<LogEntry> {
    let mut entries = Vec::new();
    let mut pos = 0;

    while pos + 8 <= data.len() {
        let len = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
            as usize;
        let checksum =
            u32::from_le_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]]);
        pos += 8;

        if pos + len > data.len() {
            tracing::warn!(position = pos, "batch log truncated, stopping replay");
            break;
        }

        let record = &data[pos..pos + len];
        if crc32fast::hash(record) != checksum {
            tracing::warn!(position = pos, "batch log checksum mismatch, stopping replay");
            break;
        }

        match bincode::deserialize::<LogEntry>(record) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                tracing::warn!(position = pos, error = %e, "batch log entry unreadable, stopping replay");
                break;
            }
        }
        pos += len;
    }

    entries
}
