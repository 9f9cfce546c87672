//! JSON-lines backed AuditLog implementation
//!
//! One `SequencedEntry` per line. The file is opened in append mode and every
//! write goes through a single mutex, so appends from concurrently running
//! stages never interleave. A log file is assumed to have one writing process
//! at a time.
//!
//! A line only counts once its trailing newline is on disk. A final line
//! without one is the remains of an interrupted append and is dropped when the
//! log is opened for writing.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::storage_traits::{AuditEntry, AuditLog, SequencedEntry, StorageResult};

struct WriterState {
    /// `None` for logs opened with [`JsonlAuditLog::open_read_only`].
    file: Option<File>,
    next_seq: u64,
    /// File length after the last complete append.
    len: u64,
}

/// File-backed implementation of [`AuditLog`].
pub struct JsonlAuditLog {
    path: PathBuf,
    state: Mutex<WriterState>,
}

impl JsonlAuditLog {
    /// Open (or create) the log at `path`, creating parent directories.
    ///
    /// Existing entries are scanned once to continue the sequence. A torn
    /// final line is truncated away; a corrupt complete line fails the open
    /// rather than being silently skipped.
    pub async fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StorageError::io(parent, e))?;
            }
        }

        let scan = scan(&path).await?;
        let next_seq = scan.next_seq();

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StorageError::io(&path, e))?;

        if scan.torn > 0 {
            warn!(
                path = %path.display(),
                bytes = scan.torn,
                "dropping incomplete final line from audit log"
            );
            file.set_len(scan.complete_len)
                .await
                .map_err(|e| StorageError::io(&path, e))?;
        }

        info!(path = %path.display(), next_seq, "audit log opened");

        Ok(Self {
            path,
            state: Mutex::new(WriterState {
                file: Some(file),
                next_seq,
                len: scan.complete_len,
            }),
        })
    }

    /// Open an existing log for queries only.
    ///
    /// Nothing is created or repaired; a missing file is an error and
    /// [`AuditLog::append`] fails with [`StorageError::ReadOnly`].
    pub async fn open_read_only(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Err(e) = tokio::fs::metadata(&path).await {
            return Err(StorageError::io(&path, e));
        }

        let scan = scan(&path).await?;
        if scan.torn > 0 {
            warn!(path = %path.display(), bytes = scan.torn, "ignoring incomplete final line");
        }

        Ok(Self {
            state: Mutex::new(WriterState {
                file: None,
                next_seq: scan.next_seq(),
                len: scan.complete_len,
            }),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditLog for JsonlAuditLog {
    async fn append(&self, entry: AuditEntry) -> StorageResult<u64> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(file) = state.file.as_mut() else {
            return Err(StorageError::ReadOnly {
                path: self.path.clone(),
            });
        };
        let seq = state.next_seq;
        let kind = entry.kind();

        let mut line = serde_json::to_vec(&SequencedEntry { seq, entry })?;
        line.push(b'\n');

        if let Err(e) = write_line(file, &line).await {
            // Cut back to the last complete line so the next append starts clean.
            if let Err(undo) = file.set_len(state.len).await {
                warn!(path = %self.path.display(), error = %undo, "failed to truncate partial append");
            }
            return Err(StorageError::io(&self.path, e));
        }

        state.len += line.len() as u64;
        state.next_seq += 1;
        debug!(seq, kind, "audit entry appended");
        Ok(seq)
    }

    async fn entries(&self) -> StorageResult<Vec<SequencedEntry>> {
        // Hold the writer lock so a half-written line is never observed.
        let _state = self.state.lock().await;
        Ok(scan(&self.path).await?.entries)
    }
}

async fn write_line(file: &mut File, line: &[u8]) -> std::io::Result<()> {
    file.write_all(line).await?;
    file.sync_data().await
}

struct Scan {
    entries: Vec<SequencedEntry>,
    /// Byte length up to and including the last newline.
    complete_len: u64,
    /// Bytes after the last newline.
    torn: usize,
}

impl Scan {
    fn next_seq(&self) -> u64 {
        self.entries.last().map(|e| e.seq + 1).unwrap_or(1)
    }
}

async fn scan(path: &Path) -> StorageResult<Scan> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Scan {
                entries: Vec::new(),
                complete_len: 0,
                torn: 0,
            })
        }
        Err(e) => return Err(StorageError::io(path, e)),
    };

    let end = bytes
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |idx| idx + 1);
    let (complete, tail) = bytes.split_at(end);

    let content = std::str::from_utf8(complete).map_err(|e| StorageError::Corrupt {
        line: complete[..e.valid_up_to()]
            .iter()
            .filter(|b| **b == b'\n')
            .count()
            + 1,
        reason: e.to_string(),
    })?;

    let entries = content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str::<SequencedEntry>(line).map_err(|e| StorageError::Corrupt {
                line: idx + 1,
                reason: e.to_string(),
            })
        })
        .collect::<StorageResult<Vec<_>>>()?;

    Ok(Scan {
        entries,
        complete_len: complete.len() as u64,
        torn: tail.len(),
    })
}
