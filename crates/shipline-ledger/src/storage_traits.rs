//! Storage trait definitions for Shipline
//!
//! - `AuditLog`: append-only record of run lifecycle and stage attempts
//! - `AuditEntry`: the closed set of things that can be recorded
//! - `RunRecord`: a run reassembled from its entries
//!
//! All traits are async and backend-agnostic. An in-memory fake is provided
//! for testing via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Identifiers and artifacts
// ---------------------------------------------------------------------------

/// Lowercase SHA-256 hex identifying a deployed artifact.
///
/// Built by [`ContentDigest::from_bytes`] or checked by `TryFrom<String>`;
/// deserialization goes through the same check, so a digest read back from
/// the audit log is always 64 hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct ContentDigest(String);

impl ContentDigest {
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        ContentDigest(hex::encode(Sha256::digest(data)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for tables.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(digest: String) -> std::result::Result<Self, Self::Error> {
        let valid = digest.len() == 64 && digest.bytes().all(|b| b.is_ascii_hexdigit());
        if !valid {
            return Err(StorageError::InvalidDigest { digest });
        }
        Ok(ContentDigest(digest.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for a pipeline or rollback run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random RunId
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The deployable unit a run pushes to an environment.
///
/// The digest identifies the (revision, path) pair so that a later rollback
/// can prove it is restoring exactly what an earlier attempt deployed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Path handed to the external deploy command.
    pub path: String,
    /// Source revision the artifact was built from.
    pub revision: String,
    /// SHA-256 over revision and path.
    pub digest: ContentDigest,
}

impl ArtifactRef {
    pub fn new(path: impl Into<String>, revision: impl Into<String>) -> Self {
        let path = path.into();
        let revision = revision.into();
        let mut material = Vec::with_capacity(path.len() + revision.len() + 1);
        material.extend_from_slice(revision.as_bytes());
        material.push(0);
        material.extend_from_slice(path.as_bytes());
        Self {
            digest: ContentDigest::from_bytes(&material),
            path,
            revision,
        }
    }
}

// ---------------------------------------------------------------------------
// Attempts
// ---------------------------------------------------------------------------

/// What an attempt was trying to do to its environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptKind {
    /// Check-only deploy; nothing is changed in the environment.
    Validate,
    Deploy,
    /// Re-deploy of a previously successful artifact.
    Rollback,
}

impl std::fmt::Display for AttemptKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AttemptKind::Validate => "validate",
            AttemptKind::Deploy => "deploy",
            AttemptKind::Rollback => "rollback",
        };
        f.write_str(s)
    }
}

/// Classified result of one external command invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    /// The command ran and reported a structured, deterministic failure.
    ApplicationFailure,
    /// Unreachable target, malformed output, or a non-JSON crash.
    InfrastructureFailure,
    /// The hard wall-clock limit expired or the run was cancelled.
    Timeout,
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Succeeded)
    }

    /// Only transient outcomes are worth another attempt.
    pub fn retry_eligible(&self) -> bool {
        matches!(
            self,
            AttemptOutcome::InfrastructureFailure | AttemptOutcome::Timeout
        )
    }
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AttemptOutcome::Succeeded => "succeeded",
            AttemptOutcome::ApplicationFailure => "application_failure",
            AttemptOutcome::InfrastructureFailure => "infrastructure_failure",
            AttemptOutcome::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// A single stage attempt as recorded in the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageAttemptRecord {
    /// Unique id of this record; rollbacks reference it via `restores`.
    pub record_id: String,
    pub run_id: RunId,
    pub stage: String,
    pub environment: String,
    pub kind: AttemptKind,
    /// 1-based, strictly increasing per (run, stage).
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    /// Rendered command line (credential reference only, never a secret).
    pub command: Vec<String>,
    pub artifact: ArtifactRef,
    /// Process exit code, if the process exited on its own.
    pub exit_code: Option<i32>,
    /// Structured output captured from the command.
    pub output: serde_json::Value,
    /// Human-readable classification detail.
    pub detail: String,
    pub retry_eligible: bool,
    /// For rollbacks: the record id of the attempt whose artifact was restored.
    pub restores: Option<String>,
}

impl StageAttemptRecord {
    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    RolledBack,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::RolledBack
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

/// Everything that can be written to the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEntry {
    RunStarted {
        run_id: RunId,
        revision: String,
        /// `None` for operator-initiated rollback runs.
        branch: Option<String>,
        actor: String,
        artifact: ArtifactRef,
        /// Stage names in dispatch order.
        stages: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    StageAttempt(StageAttemptRecord),
    StageSkipped {
        run_id: RunId,
        stage: String,
        environment: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    RunFinished {
        run_id: RunId,
        status: RunStatus,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
}

impl AuditEntry {
    pub fn run_id(&self) -> &RunId {
        match self {
            AuditEntry::RunStarted { run_id, .. }
            | AuditEntry::StageSkipped { run_id, .. }
            | AuditEntry::RunFinished { run_id, .. } => run_id,
            AuditEntry::StageAttempt(record) => &record.run_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            AuditEntry::RunStarted { timestamp, .. }
            | AuditEntry::StageSkipped { timestamp, .. }
            | AuditEntry::RunFinished { timestamp, .. } => *timestamp,
            AuditEntry::StageAttempt(record) => record.finished_at,
        }
    }

    /// The environment this entry touched, if any.
    pub fn environment(&self) -> Option<&str> {
        match self {
            AuditEntry::StageAttempt(record) => Some(record.environment.as_str()),
            AuditEntry::StageSkipped { environment, .. } => Some(environment.as_str()),
            _ => None,
        }
    }

    /// Short kind label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AuditEntry::RunStarted { .. } => "run_started",
            AuditEntry::StageAttempt(_) => "stage_attempt",
            AuditEntry::StageSkipped { .. } => "stage_skipped",
            AuditEntry::RunFinished { .. } => "run_finished",
        }
    }
}

/// An entry together with the sequence number the log assigned to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencedEntry {
    /// Monotonic, 1-based, assigned at append time.
    pub seq: u64,
    pub entry: AuditEntry,
}

/// A stage that was not executed, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedStage {
    pub stage: String,
    pub environment: String,
    pub reason: String,
}

/// A run reassembled from its audit entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub revision: String,
    pub branch: Option<String>,
    pub actor: String,
    pub artifact: ArtifactRef,
    pub stages: Vec<String>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    /// Attempts in append (completion) order.
    pub attempts: Vec<StageAttemptRecord>,
    pub skipped: Vec<SkippedStage>,
}

impl RunRecord {
    /// Fold a run's entries (in sequence order) into a record.
    ///
    /// Returns `StorageError::RunNotFound` if no `RunStarted` entry exists.
    pub fn from_entries(run_id: &RunId, entries: &[SequencedEntry]) -> StorageResult<Self> {
        let mut record: Option<RunRecord> = None;

        for sequenced in entries.iter().filter(|e| e.entry.run_id() == run_id) {
            match &sequenced.entry {
                AuditEntry::RunStarted {
                    revision,
                    branch,
                    actor,
                    artifact,
                    stages,
                    timestamp,
                    ..
                } => {
                    record = Some(RunRecord {
                        run_id: run_id.clone(),
                        revision: revision.clone(),
                        branch: branch.clone(),
                        actor: actor.clone(),
                        artifact: artifact.clone(),
                        stages: stages.clone(),
                        status: RunStatus::Running,
                        started_at: *timestamp,
                        finished_at: None,
                        duration_ms: None,
                        attempts: Vec::new(),
                        skipped: Vec::new(),
                    });
                }
                AuditEntry::StageAttempt(attempt) => {
                    if let Some(r) = record.as_mut() {
                        r.attempts.push(attempt.clone());
                    }
                }
                AuditEntry::StageSkipped {
                    stage,
                    environment,
                    reason,
                    ..
                } => {
                    if let Some(r) = record.as_mut() {
                        r.skipped.push(SkippedStage {
                            stage: stage.clone(),
                            environment: environment.clone(),
                            reason: reason.clone(),
                        });
                    }
                }
                AuditEntry::RunFinished {
                    status,
                    duration_ms,
                    timestamp,
                    ..
                } => {
                    if let Some(r) = record.as_mut() {
                        r.status = *status;
                        r.duration_ms = Some(*duration_ms);
                        r.finished_at = Some(*timestamp);
                    }
                }
            }
        }

        record.ok_or_else(|| StorageError::RunNotFound {
            run_id: run_id.0.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// AuditLog
// ---------------------------------------------------------------------------

/// Append-only audit log.
///
/// Guarantees:
/// - `append` is the only write and is atomic with respect to other appends.
/// - Sequence numbers are 1-based and strictly increasing in append order.
/// - Entries are never edited or removed.
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Append an entry, returning the sequence number assigned to it.
    async fn append(&self, entry: AuditEntry) -> StorageResult<u64>;

    /// All entries in sequence order.
    async fn entries(&self) -> StorageResult<Vec<SequencedEntry>>;

    /// Entries belonging to one run, in sequence order.
    async fn entries_for_run(&self, run_id: &RunId) -> StorageResult<Vec<SequencedEntry>> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter(|e| e.entry.run_id() == run_id)
            .collect())
    }

    /// Stage attempts made against an environment, in sequence order.
    async fn attempts_for_environment(
        &self,
        environment: &str,
    ) -> StorageResult<Vec<StageAttemptRecord>> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter_map(|e| match e.entry {
                AuditEntry::StageAttempt(record) if record.environment == environment => {
                    Some(record)
                }
                _ => None,
            })
            .collect())
    }

    /// Reassemble a run from its entries.
    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        let entries = self.entries_for_run(run_id).await?;
        RunRecord::from_entries(run_id, &entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_digest_is_deterministic() {
        let a = ArtifactRef::new("force-app", "abc123");
        let b = ArtifactRef::new("force-app", "abc123");
        assert_eq!(a.digest, b.digest);
    }

    #[test]
    fn test_artifact_digest_depends_on_revision() {
        let a = ArtifactRef::new("force-app", "abc123");
        let b = ArtifactRef::new("force-app", "def456");
        assert_ne!(a.digest, b.digest);
    }

    #[test]
    fn test_retry_eligibility() {
        assert!(AttemptOutcome::InfrastructureFailure.retry_eligible());
        assert!(AttemptOutcome::Timeout.retry_eligible());
        assert!(!AttemptOutcome::ApplicationFailure.retry_eligible());
        assert!(!AttemptOutcome::Succeeded.retry_eligible());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::RolledBack.is_terminal());
    }

    #[test]
    fn test_digest_try_from_rejects_short() {
        assert!(ContentDigest::try_from("abc".to_string()).is_err());
        let ok = ContentDigest::from_bytes(b"x").as_str().to_uppercase();
        assert!(ContentDigest::try_from(ok).is_ok());
    }

    #[test]
    fn test_digest_deserialize_is_validated() {
        let bad: std::result::Result<ContentDigest, _> = serde_json::from_str("\"abc\"");
        assert!(bad.unwrap_err().to_string().contains("invalid content digest"));

        let digest = ContentDigest::from_bytes(b"force-app");
        let upper = serde_json::to_string(&digest.as_str().to_uppercase()).unwrap();
        let back: ContentDigest = serde_json::from_str(&upper).unwrap();
        assert_eq!(back, digest);
    }

    #[test]
    fn test_entry_serializes_with_type_tag() {
        let entry = AuditEntry::RunFinished {
            run_id: RunId("r1".to_string()),
            status: RunStatus::RolledBack,
            duration_ms: 12,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "run_finished");
        assert_eq!(json["status"], "rolled_back");
    }

    #[test]
    fn test_from_entries_without_start_is_not_found() {
        let run_id = RunId("missing".to_string());
        let err = RunRecord::from_entries(&run_id, &[]).unwrap_err();
        assert!(matches!(err, StorageError::RunNotFound { .. }));
    }
}
