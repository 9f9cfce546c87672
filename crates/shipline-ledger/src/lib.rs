//! Shipline Ledger: append-only audit storage for deployment runs
//!
//! Every stage attempt the pipeline engine or rollback coordinator makes is
//! written here exactly once. Nothing is edited or removed; corrections and
//! rollbacks are new entries that reference the original.
//!
//! ## Key Components
//!
//! - `AuditLog`: the storage trait (append + queries by run and environment)
//! - `JsonlAuditLog`: one JSON object per line, for the operator CLI
//! - `fakes::MemoryAuditLog`: in-memory implementation for tests

mod error;
pub mod fakes;
pub mod jsonl;
pub mod storage_traits;

pub use error::StorageError;
pub use jsonl::JsonlAuditLog;
pub use storage_traits::{
    ArtifactRef, AttemptKind, AttemptOutcome, AuditEntry, AuditLog, ContentDigest, RunId,
    RunRecord, RunStatus, SequencedEntry, SkippedStage, StageAttemptRecord, StorageResult,
};
