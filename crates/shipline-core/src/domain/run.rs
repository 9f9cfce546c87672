//! Runs, trigger events and per-stage state.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipline_ledger::{ArtifactRef, RunId, RunStatus, StageAttemptRecord};

/// The push / pull-request event that starts a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub branch: String,
    pub revision: String,
    pub actor: String,
}

impl TriggerEvent {
    pub fn new(
        branch: impl Into<String>,
        revision: impl Into<String>,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            branch: branch.into(),
            revision: revision.into(),
            actor: actor.into(),
        }
    }
}

/// Typed context stage gates are evaluated against.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub event: Option<TriggerEvent>,
    /// Stage names or environment ids an operator has approved for this run.
    approvals: HashSet<String>,
}

impl RunContext {
    pub fn new(event: TriggerEvent) -> Self {
        Self {
            event: Some(event),
            approvals: HashSet::new(),
        }
    }

    pub fn approve(mut self, target: impl Into<String>) -> Self {
        self.approvals.insert(target.into());
        self
    }

    pub fn branch(&self) -> &str {
        self.event.as_ref().map(|e| e.branch.as_str()).unwrap_or("")
    }

    pub fn revision(&self) -> &str {
        self.event.as_ref().map(|e| e.revision.as_str()).unwrap_or("")
    }

    pub fn actor(&self) -> &str {
        self.event.as_ref().map(|e| e.actor.as_str()).unwrap_or("")
    }

    /// Approved either by stage name or by environment id.
    pub fn is_approved(&self, stage: &str, environment: &str) -> bool {
        self.approvals.contains(stage) || self.approvals.contains(environment)
    }
}

/// Per-stage state machine position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    /// Retries exhausted or a non-retryable failure.
    Failed,
    /// Gate not met; counts neither as success nor failure.
    Skipped { reason: String },
}

impl StageStatus {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, StageStatus::Pending | StageStatus::Running)
    }

    /// Pending moves to Running or Skipped; Running moves to Succeeded or
    /// Failed. Resolved states are final.
    pub fn can_advance_to(&self, next: &StageStatus) -> bool {
        matches!(
            (self, next),
            (StageStatus::Pending, StageStatus::Running)
                | (StageStatus::Pending, StageStatus::Skipped { .. })
                | (StageStatus::Running, StageStatus::Succeeded)
                | (StageStatus::Running, StageStatus::Failed)
        )
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageStatus::Pending => write!(f, "pending"),
            StageStatus::Running => write!(f, "running"),
            StageStatus::Succeeded => write!(f, "succeeded"),
            StageStatus::Failed => write!(f, "failed"),
            StageStatus::Skipped { reason } => write!(f, "skipped ({reason})"),
        }
    }
}

/// Final state of one stage within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageState {
    pub name: String,
    pub environment: String,
    pub status: StageStatus,
    pub attempts: u32,
}

/// One pipeline execution and its outcome.
#[derive(Debug, Clone)]
pub struct Run {
    pub run_id: RunId,
    pub revision: String,
    pub branch: String,
    pub artifact: ArtifactRef,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Stage states in dispatch (topological) order.
    pub stages: Vec<StageState>,
    /// Every attempt this run made, rollbacks included, in completion order.
    pub attempts: Vec<StageAttemptRecord>,
}

impl Run {
    pub fn stage(&self, name: &str) -> Option<&StageState> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn attempts_for(&self, stage: &str) -> impl Iterator<Item = &StageAttemptRecord> {
        let stage = stage.to_string();
        self.attempts.iter().filter(move |a| a.stage == stage)
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// CLI exit code for `run`: 0 on success, 1 for any pipeline failure.
    pub fn exit_code(&self) -> u8 {
        if self.succeeded() {
            0
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_approval_by_stage_or_environment() {
        let ctx = RunContext::new(TriggerEvent::new("main", "abc", "ops")).approve("prod");
        assert!(ctx.is_approved("deploy-prod", "prod"));
        assert!(!ctx.is_approved("deploy-uat", "uat"));

        let ctx = RunContext::new(TriggerEvent::new("main", "abc", "ops")).approve("deploy-uat");
        assert!(ctx.is_approved("deploy-uat", "uat"));
    }

    #[test]
    fn test_stage_status_resolution() {
        assert!(!StageStatus::Pending.is_resolved());
        assert!(!StageStatus::Running.is_resolved());
        assert!(StageStatus::Succeeded.is_resolved());
        assert!(StageStatus::Failed.is_resolved());
        assert!(StageStatus::Skipped {
            reason: "x".into()
        }
        .is_resolved());
    }

    #[test]
    fn test_stage_transitions() {
        let skipped = StageStatus::Skipped {
            reason: "trigger not met".into(),
        };
        assert!(StageStatus::Pending.can_advance_to(&StageStatus::Running));
        assert!(StageStatus::Pending.can_advance_to(&skipped));
        assert!(StageStatus::Running.can_advance_to(&StageStatus::Succeeded));
        assert!(StageStatus::Running.can_advance_to(&StageStatus::Failed));

        assert!(!StageStatus::Pending.can_advance_to(&StageStatus::Succeeded));
        assert!(!StageStatus::Running.can_advance_to(&skipped));
        assert!(!StageStatus::Succeeded.can_advance_to(&StageStatus::Failed));
        assert!(!skipped.can_advance_to(&StageStatus::Running));
    }

    #[test]
    fn test_context_accessors() {
        let ctx = RunContext::new(TriggerEvent::new("develop", "rev1", "alice"));
        assert_eq!(ctx.branch(), "develop");
        assert_eq!(ctx.revision(), "rev1");
        assert_eq!(ctx.actor(), "alice");
    }
}
