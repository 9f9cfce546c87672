//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryAuditLog`, which satisfies the `AuditLog` contract without
//! touching the filesystem.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::storage_traits::*;

/// In-memory audit log backed by a `Vec<SequencedEntry>`.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<SequencedEntry>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries appended so far.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn append(&self, entry: AuditEntry) -> StorageResult<u64> {
        let mut entries = self.entries.lock().unwrap();
        let seq = entries.len() as u64 + 1;
        entries.push(SequencedEntry { seq, entry });
        Ok(seq)
    }

    async fn entries(&self) -> StorageResult<Vec<SequencedEntry>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.clone())
    }
}
