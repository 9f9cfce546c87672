//! Structured lifecycle events for runs, attempts and rollbacks.
//!
//! Every event carries an `event = "..."` field so log pipelines can filter on
//! it regardless of message text. Run-scoped work is instrumented with
//! [`run_span`] rather than an entered guard, since it crosses `.await` points.

use shipline_ledger::StageAttemptRecord;
use tracing::{info, warn, Span};

/// Span tagging every event of a run with its `run_id`.
pub fn run_span(run_id: &str) -> Span {
    tracing::info_span!("shipline.run", run_id = %run_id)
}

pub fn emit_run_started(run_id: &str, revision: &str, branch: &str, stages: usize) {
    info!(
        event = "run.started",
        run_id = %run_id,
        revision = %revision,
        branch = %branch,
        stages = stages,
    );
}

pub fn emit_attempt_recorded(record: &StageAttemptRecord, seq: u64) {
    info!(
        event = "stage.attempt",
        run_id = %record.run_id,
        stage = %record.stage,
        environment = %record.environment,
        kind = %record.kind,
        attempt = record.attempt,
        outcome = %record.outcome,
        duration_ms = record.duration_ms(),
        seq = seq,
    );
}

pub fn emit_stage_skipped(run_id: &str, stage: &str, reason: &str) {
    info!(event = "stage.skipped", run_id = %run_id, stage = %stage, reason = %reason);
}

pub fn emit_retry_scheduled(run_id: &str, stage: &str, next_attempt: u32, delay_ms: u64) {
    info!(
        event = "stage.retry_scheduled",
        run_id = %run_id,
        stage = %stage,
        next_attempt = next_attempt,
        delay_ms = delay_ms,
    );
}

pub fn emit_rollback_executed(run_id: &str, environment: &str, restores: &str, success: bool) {
    info!(
        event = "rollback.executed",
        run_id = %run_id,
        environment = %environment,
        restores = %restores,
        success = success,
    );
}

pub fn emit_run_finished(run_id: &str, status: &str, duration_ms: u64) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        status = %status,
        duration_ms = duration_ms,
    );
}

/// Audit append failed; the run cannot be trusted to continue.
pub fn emit_audit_error(run_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "audit.append_failed", run_id = %run_id, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_create() {
        let span = run_span("test-run-id");
        let _guard = span.enter();
        emit_stage_skipped("test-run-id", "deploy-prod", "approval required");
    }
}
