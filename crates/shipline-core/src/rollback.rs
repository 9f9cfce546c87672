//! Rollback coordinator.
//!
//! Restores an environment to the artifact of its most recent successful
//! deploy attempt, as recorded in the audit log. Rollback attempts themselves
//! never count as known-good, so rolling back twice with no deploy in between
//! restores the same artifact both times.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use shipline_ledger::{
    AttemptKind, AttemptOutcome, AuditEntry, AuditLog, RunId, RunStatus, StageAttemptRecord,
};
use tracing::{info, Instrument};

use crate::cancel::CancelToken;
use crate::domain::{Result, ShiplineError};
use crate::executor::CommandExecutor;
use crate::metrics::METRICS;
use crate::obs;
use crate::registry::EnvironmentRegistry;
use crate::retry::{run_with_retries, AttemptPlan, RetryPolicy};

/// Outcome of restoring one environment.
#[derive(Debug, Clone, Serialize)]
pub struct RollbackReport {
    pub run_id: RunId,
    pub environment: String,
    /// The successful deploy attempt whose artifact was re-deployed.
    pub restored: StageAttemptRecord,
    /// Rollback attempts made, in order.
    pub attempts: Vec<StageAttemptRecord>,
    pub status: RunStatus,
}

impl RollbackReport {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::RolledBack
    }

    /// CLI exit code for `rollback`: 0 restored, 1 rollback attempts failed.
    pub fn exit_code(&self) -> u8 {
        if self.succeeded() {
            0
        } else {
            1
        }
    }
}

pub struct RollbackCoordinator {
    registry: Arc<EnvironmentRegistry>,
    executor: Arc<CommandExecutor>,
    audit: Arc<dyn AuditLog>,
    retry: RetryPolicy,
    timeout: Option<Duration>,
}

impl RollbackCoordinator {
    pub fn new(
        registry: Arc<EnvironmentRegistry>,
        executor: Arc<CommandExecutor>,
        audit: Arc<dyn AuditLog>,
    ) -> Self {
        Self {
            registry,
            executor,
            audit,
            retry: RetryPolicy::default(),
            timeout: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The most recent successful deploy attempt against `environment`.
    ///
    /// Fails with `UnknownEnvironment` for unregistered ids and with
    /// `NoKnownGoodState` when no deploy ever succeeded there.
    pub async fn last_known_good(&self, environment: &str) -> Result<StageAttemptRecord> {
        self.registry.resolve(environment)?;
        self.audit
            .attempts_for_environment(environment)
            .await?
            .into_iter()
            .rev()
            .find(|a| a.kind == AttemptKind::Deploy && a.outcome == AttemptOutcome::Succeeded)
            .ok_or_else(|| ShiplineError::NoKnownGoodState {
                environment: environment.to_string(),
            })
    }

    /// Operator-initiated rollback, recorded as its own run.
    ///
    /// The precondition is checked before anything is appended: an environment
    /// with no known-good state leaves the audit log untouched.
    pub async fn rollback(
        &self,
        environment: &str,
        actor: &str,
        cancel: &CancelToken,
    ) -> Result<RollbackReport> {
        let restored = self.last_known_good(environment).await?;
        let run_id = RunId::new();
        let span = obs::run_span(&run_id.0);
        self.rollback_run(run_id, environment, actor, restored, cancel)
            .instrument(span)
            .await
    }

    async fn rollback_run(
        &self,
        run_id: RunId,
        environment: &str,
        actor: &str,
        restored: StageAttemptRecord,
        cancel: &CancelToken,
    ) -> Result<RollbackReport> {
        let start = Instant::now();
        let stage = format!("rollback:{environment}");
        self.audit
            .append(AuditEntry::RunStarted {
                run_id: run_id.clone(),
                revision: restored.artifact.revision.clone(),
                branch: None,
                actor: actor.to_string(),
                artifact: restored.artifact.clone(),
                stages: vec![stage.clone()],
                timestamp: Utc::now(),
            })
            .await?;
        info!(
            environment,
            revision = %restored.artifact.revision,
            restores = %restored.record_id,
            "rolling back environment"
        );

        let attempts = self.restore(&run_id, &stage, &restored, cancel).await?;
        let status = final_status(&attempts);

        let duration_ms = start.elapsed().as_millis() as u64;
        self.audit
            .append(AuditEntry::RunFinished {
                run_id: run_id.clone(),
                status,
                duration_ms,
                timestamp: Utc::now(),
            })
            .await?;
        obs::emit_run_finished(&run_id.0, &status.to_string(), duration_ms);
        METRICS.inc_runs_finished();
        METRICS.flush();

        Ok(RollbackReport {
            run_id,
            environment: environment.to_string(),
            restored,
            attempts,
            status,
        })
    }

    /// Rollback inside an existing pipeline run, labelled `stage`.
    pub(crate) async fn restore_within(
        &self,
        run_id: &RunId,
        stage: &str,
        environment: &str,
        cancel: &CancelToken,
    ) -> Result<RollbackReport> {
        let restored = self.last_known_good(environment).await?;
        let attempts = self.restore(run_id, stage, &restored, cancel).await?;
        let status = final_status(&attempts);
        Ok(RollbackReport {
            run_id: run_id.clone(),
            environment: environment.to_string(),
            restored,
            attempts,
            status,
        })
    }

    async fn restore(
        &self,
        run_id: &RunId,
        stage: &str,
        restored: &StageAttemptRecord,
        cancel: &CancelToken,
    ) -> Result<Vec<StageAttemptRecord>> {
        let env = self.registry.resolve(&restored.environment)?;
        let attempts = run_with_retries(
            &self.executor,
            self.audit.as_ref(),
            AttemptPlan {
                run_id,
                stage,
                environment: env,
                artifact: &restored.artifact,
                kind: AttemptKind::Rollback,
                policy: &self.retry,
                timeout: self.timeout.unwrap_or(self.executor.default_timeout()),
                restores: Some(restored.record_id.as_str()),
            },
            cancel,
        )
        .await?;

        let success = final_status(&attempts) == RunStatus::RolledBack;
        METRICS.inc_rollbacks();
        obs::emit_rollback_executed(&run_id.0, &env.id, &restored.record_id, success);
        Ok(attempts)
    }
}

fn final_status(attempts: &[StageAttemptRecord]) -> RunStatus {
    match attempts.last() {
        Some(a) if a.outcome.is_success() => RunStatus::RolledBack,
        _ => RunStatus::Failed,
    }
}
