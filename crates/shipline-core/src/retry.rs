//! Retry policy and the per-stage attempt loop.
//!
//! Each attempt is appended to the audit log before the next decision is made,
//! so the log always reflects every invocation even if the process dies
//! mid-backoff.

use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use shipline_ledger::{
    ArtifactRef, AttemptKind, AuditEntry, AuditLog, RunId, StageAttemptRecord, StorageResult,
};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::domain::Environment;
use crate::executor::CommandExecutor;
use crate::metrics::METRICS;
use crate::obs;

/// How many times a stage may be attempted and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first. Zero behaves as one.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each one after.
    pub backoff_base_ms: u64,
    /// Upper bound on any single delay.
    pub backoff_max_ms: u64,
    /// Randomise each delay within `[d/2, d]`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let exp = self
            .backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_max_ms);
        if !self.jitter || exp < 2 {
            return Duration::from_millis(exp);
        }
        let half = exp / 2;
        let jittered = half + rand::thread_rng().gen_range(0..=exp - half);
        Duration::from_millis(jittered)
    }
}

/// One stage's worth of attempts against a single environment.
pub(crate) struct AttemptPlan<'a> {
    pub run_id: &'a RunId,
    pub stage: &'a str,
    pub environment: &'a Environment,
    pub artifact: &'a ArtifactRef,
    pub kind: AttemptKind,
    pub policy: &'a RetryPolicy,
    pub timeout: Duration,
    /// Record id of the attempt being restored (rollbacks only).
    pub restores: Option<&'a str>,
}

/// Attempt a stage until it succeeds, fails non-retryably, exhausts its
/// policy, or the run is cancelled. Returns every attempt in order.
///
/// Only audit failures surface as `Err`; the caller must stop the run.
pub(crate) async fn run_with_retries(
    executor: &CommandExecutor,
    audit: &dyn AuditLog,
    plan: AttemptPlan<'_>,
    cancel: &CancelToken,
) -> StorageResult<Vec<StageAttemptRecord>> {
    let max_attempts = plan.policy.attempts();
    let mut records = Vec::new();

    for attempt in 1..=max_attempts {
        let started_at = Utc::now();
        let result = executor
            .execute(
                plan.environment,
                plan.artifact,
                plan.kind,
                plan.timeout,
                cancel,
            )
            .await;
        let finished_at = Utc::now();

        let record = StageAttemptRecord {
            record_id: uuid::Uuid::new_v4().to_string(),
            run_id: plan.run_id.clone(),
            stage: plan.stage.to_string(),
            environment: plan.environment.id.clone(),
            kind: plan.kind,
            attempt,
            started_at,
            finished_at,
            outcome: result.outcome,
            command: result.command,
            artifact: plan.artifact.clone(),
            exit_code: result.exit_code,
            output: result.output,
            detail: result.detail,
            retry_eligible: result.outcome.retry_eligible(),
            restores: plan.restores.map(str::to_string),
        };

        let seq = audit
            .append(AuditEntry::StageAttempt(record.clone()))
            .await
            .inspect_err(|e| obs::emit_audit_error(&plan.run_id.0, e))?;
        METRICS.inc_attempts();
        obs::emit_attempt_recorded(&record, seq);

        let outcome = record.outcome;
        records.push(record);

        if outcome.is_success() || !outcome.retry_eligible() || attempt == max_attempts {
            break;
        }
        if cancel.is_cancelled() {
            debug!(stage = plan.stage, "run cancelled, not retrying");
            break;
        }

        let delay = plan.policy.delay_for(attempt);
        METRICS.inc_retries();
        obs::emit_retry_scheduled(
            &plan.run_id.0,
            plan.stage,
            attempt + 1,
            delay.as_millis() as u64,
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {
                debug!(stage = plan.stage, "run cancelled during backoff");
                break;
            }
        }
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CredentialRef, Tier};
    use crate::executor::{DeployCommand, DeployRequest, ExecError, RawOutput};
    use async_trait::async_trait;
    use shipline_ledger::fakes::MemoryAuditLog;
    use shipline_ledger::AttemptOutcome;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_default_policy() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_attempts, 3);
        assert_eq!(p.backoff_base_ms, 1_000);
        assert_eq!(p.backoff_max_ms, 30_000);
        assert!(p.jitter);
    }

    #[test]
    fn test_delay_doubles_and_caps_without_jitter() {
        let p = RetryPolicy {
            max_attempts: 10,
            backoff_base_ms: 100,
            backoff_max_ms: 500,
            jitter: false,
        };
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(400));
        assert_eq!(p.delay_for(4), Duration::from_millis(500));
        assert_eq!(p.delay_for(60), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let p = RetryPolicy {
            max_attempts: 5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            jitter: true,
        };
        for _ in 0..100 {
            let d = p.delay_for(2).as_millis();
            assert!((1_000..=2_000).contains(&d), "delay {d} out of range");
        }
    }

    #[test]
    fn test_zero_attempts_means_one() {
        let p = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        assert_eq!(p.attempts(), 1);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let p: RetryPolicy = toml::from_str("max_attempts = 5").unwrap();
        assert_eq!(p.max_attempts, 5);
        assert_eq!(p.backoff_base_ms, 1_000);
    }

    /// Replays a fixed list of raw outputs, one per invocation.
    struct Scripted {
        outputs: Mutex<VecDeque<RawOutput>>,
    }

    impl Scripted {
        fn new(outputs: Vec<RawOutput>) -> Self {
            Self {
                outputs: Mutex::new(outputs.into()),
            }
        }
    }

    #[async_trait]
    impl DeployCommand for Scripted {
        fn describe(&self, request: &DeployRequest) -> Vec<String> {
            vec!["deploy".into(), request.environment.clone()]
        }

        async fn invoke(&self, _request: &DeployRequest) -> Result<RawOutput, ExecError> {
            self.outputs
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| {
                    ExecError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "script exhausted",
                    ))
                })
        }
    }

    fn ok() -> RawOutput {
        RawOutput {
            exit_code: Some(0),
            stdout: r#"{"status":0,"result":{}}"#.into(),
            stderr: String::new(),
        }
    }

    fn app_failure() -> RawOutput {
        RawOutput {
            exit_code: Some(1),
            stdout: r#"{"status":1,"result":{"details":[{"problem":"bad"}]}}"#.into(),
            stderr: String::new(),
        }
    }

    fn crash() -> RawOutput {
        RawOutput {
            exit_code: Some(137),
            stdout: String::new(),
            stderr: "connection reset".into(),
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff_base_ms: 1,
            backoff_max_ms: 5,
            jitter: false,
        }
    }

    async fn attempt_with(
        outputs: Vec<RawOutput>,
        policy: RetryPolicy,
    ) -> (Vec<StageAttemptRecord>, MemoryAuditLog) {
        let executor = CommandExecutor::new(
            Arc::new(Scripted::new(outputs)),
            Duration::from_secs(5),
        );
        let audit = MemoryAuditLog::new();
        let env = Environment::new("qa", Tier::Qa, CredentialRef::new("qa-alias"));
        let artifact = ArtifactRef::new("force-app", "rev1");
        let run_id = RunId::new();
        let records = run_with_retries(
            &executor,
            &audit,
            AttemptPlan {
                run_id: &run_id,
                stage: "deploy-qa",
                environment: &env,
                artifact: &artifact,
                kind: AttemptKind::Deploy,
                policy: &policy,
                timeout: Duration::from_secs(5),
                restores: None,
            },
            &CancelToken::new(),
        )
        .await
        .unwrap();
        (records, audit)
    }

    #[tokio::test]
    async fn test_infrastructure_failure_is_retried_until_success() {
        let (records, audit) = attempt_with(vec![crash(), crash(), ok()], fast_policy(3)).await;
        assert_eq!(records.len(), 3);
        assert_eq!(
            records.iter().map(|r| r.attempt).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(records[0].retry_eligible);
        assert_eq!(records[2].outcome, AttemptOutcome::Succeeded);
        assert_eq!(audit.len(), 3);
    }

    #[tokio::test]
    async fn test_application_failure_is_not_retried() {
        let (records, _) = attempt_with(vec![app_failure(), ok()], fast_policy(3)).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, AttemptOutcome::ApplicationFailure);
        assert!(!records[0].retry_eligible);
    }

    #[tokio::test]
    async fn test_attempts_never_exceed_policy() {
        let (records, _) =
            attempt_with(vec![crash(), crash(), crash(), ok()], fast_policy(2)).await;
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| !r.outcome.is_success()));
    }

    #[tokio::test]
    async fn test_cancelled_run_does_not_retry() {
        let executor = CommandExecutor::new(
            Arc::new(Scripted::new(vec![crash(), ok()])),
            Duration::from_secs(5),
        );
        let audit = MemoryAuditLog::new();
        let env = Environment::new("qa", Tier::Qa, CredentialRef::new("qa-alias"));
        let artifact = ArtifactRef::new("force-app", "rev1");
        let run_id = RunId::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let policy = fast_policy(3);

        let records = run_with_retries(
            &executor,
            &audit,
            AttemptPlan {
                run_id: &run_id,
                stage: "deploy-qa",
                environment: &env,
                artifact: &artifact,
                kind: AttemptKind::Deploy,
                policy: &policy,
                timeout: Duration::from_secs(5),
                restores: None,
            },
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, AttemptOutcome::Timeout);
        assert_eq!(records[0].detail, "cancelled");
    }
}
