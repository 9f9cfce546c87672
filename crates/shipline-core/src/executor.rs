//! Command executor: one external deploy invocation per call.
//!
//! The executor owns the hard wall-clock limit and the classification of raw
//! process output into [`AttemptOutcome`]s. The command itself sits behind the
//! [`DeployCommand`] trait so tests can script outcomes; production uses
//! [`crate::process::ProcessCommand`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shipline_ledger::{ArtifactRef, AttemptKind, AttemptOutcome};
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::domain::{CredentialRef, Environment, TestLevel};

/// Everything the external command needs for one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployRequest {
    pub environment: String,
    pub credential: CredentialRef,
    pub artifact: ArtifactRef,
    pub test_level: TestLevel,
    pub kind: AttemptKind,
}

impl DeployRequest {
    pub fn for_environment(env: &Environment, artifact: &ArtifactRef, kind: AttemptKind) -> Self {
        Self {
            environment: env.id.clone(),
            credential: env.credential.clone(),
            artifact: artifact.clone(),
            test_level: env.test_level,
            kind,
        }
    }
}

/// What came back from the process, before classification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Failures to run the command at all. Always classified as infrastructure.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("io error while running command: {0}")]
    Io(#[from] std::io::Error),
}

/// The external deploy command boundary.
#[async_trait]
pub trait DeployCommand: Send + Sync {
    /// Rendered command line for the audit log.
    fn describe(&self, request: &DeployRequest) -> Vec<String>;

    /// Run the command to completion. Dropping the returned future must stop
    /// the underlying process and anything it spawned.
    async fn invoke(&self, request: &DeployRequest) -> Result<RawOutput, ExecError>;
}

/// Classified result of one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub outcome: AttemptOutcome,
    pub exit_code: Option<i32>,
    /// Parsed JSON output, or the raw streams when the output was not JSON.
    pub output: Value,
    pub detail: String,
    pub duration: Duration,
    pub command: Vec<String>,
}

/// Runs deploy commands with a hard timeout and classifies their output.
pub struct CommandExecutor {
    command: Arc<dyn DeployCommand>,
    default_timeout: Duration,
}

impl CommandExecutor {
    pub fn new(command: Arc<dyn DeployCommand>, default_timeout: Duration) -> Self {
        Self {
            command,
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Invoke the deploy command once against `environment`.
    ///
    /// On timeout or cancellation the in-flight invocation is dropped (which
    /// kills the process) and the result is `Timeout`. Never returns an error:
    /// every failure mode is an outcome.
    pub async fn execute(
        &self,
        environment: &Environment,
        artifact: &ArtifactRef,
        kind: AttemptKind,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> ExecutionResult {
        let request = DeployRequest::for_environment(environment, artifact, kind);
        let command = self.command.describe(&request);
        let start = Instant::now();

        debug!(environment = %environment.id, kind = %kind, ?command, "invoking deploy command");

        let classified = tokio::select! {
            biased;
            _ = cancel.cancelled() => Classified {
                outcome: AttemptOutcome::Timeout,
                exit_code: None,
                output: Value::Null,
                detail: "cancelled".to_string(),
            },
            res = tokio::time::timeout(timeout, self.command.invoke(&request)) => match res {
                Ok(Ok(raw)) => classify(&raw),
                Ok(Err(e)) => Classified {
                    outcome: AttemptOutcome::InfrastructureFailure,
                    exit_code: None,
                    output: json!({ "error": e.to_string() }),
                    detail: e.to_string(),
                },
                Err(_) => Classified {
                    outcome: AttemptOutcome::Timeout,
                    exit_code: None,
                    output: Value::Null,
                    detail: format!("timed out after {}s", timeout.as_secs_f64()),
                },
            },
        };

        if !classified.outcome.is_success() {
            warn!(
                environment = %environment.id,
                outcome = %classified.outcome,
                detail = %classified.detail,
                "deploy command did not succeed"
            );
        }

        ExecutionResult {
            outcome: classified.outcome,
            exit_code: classified.exit_code,
            output: classified.output,
            detail: classified.detail,
            duration: start.elapsed(),
            command,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Classified {
    outcome: AttemptOutcome,
    exit_code: Option<i32>,
    output: Value,
    detail: String,
}

/// Classify raw command output.
///
/// Recognised JSON shape: `{"status": <int>, "result": {"details": [...]}}`.
/// - exit 0 and `status == 0`: success
/// - non-zero `status` with an object `result`: application failure
/// - anything else (no JSON, missing `status`, inconsistent exit/status):
///   infrastructure failure
fn classify(raw: &RawOutput) -> Classified {
    let parsed = serde_json::from_str::<Value>(raw.stdout.trim())
        .ok()
        .filter(Value::is_object);

    let Some(json) = parsed else {
        let detail = match raw.exit_code {
            Some(0) => "malformed output: expected a JSON object".to_string(),
            Some(code) => format!("exited with code {code} without JSON output"),
            None => "terminated by signal without JSON output".to_string(),
        };
        return Classified {
            outcome: AttemptOutcome::InfrastructureFailure,
            exit_code: raw.exit_code,
            output: json!({
                "stdout": raw.stdout,
                "stderr": raw.stderr,
            }),
            detail: with_stderr_tail(detail, &raw.stderr),
        };
    };

    let status = json.get("status").and_then(Value::as_i64);
    let has_result = json.get("result").map(Value::is_object).unwrap_or(false);

    let (outcome, detail) = match status {
        Some(0) if raw.exit_code == Some(0) => {
            (AttemptOutcome::Succeeded, "succeeded".to_string())
        }
        Some(s) if s != 0 && has_result => (
            AttemptOutcome::ApplicationFailure,
            application_detail(s, &json),
        ),
        Some(0) => (
            AttemptOutcome::InfrastructureFailure,
            format!(
                "inconsistent result: status 0 but process exit {:?}",
                raw.exit_code
            ),
        ),
        Some(s) => (
            AttemptOutcome::InfrastructureFailure,
            format!("status {s} without a structured result"),
        ),
        None => (
            AttemptOutcome::InfrastructureFailure,
            "malformed output: missing integer 'status'".to_string(),
        ),
    };

    Classified {
        outcome,
        exit_code: raw.exit_code,
        output: json,
        detail,
    }
}

fn application_detail(status: i64, json: &Value) -> String {
    let details = json
        .pointer("/result/details")
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0);
    let mut detail = format!("status {status}, {details} failure detail(s)");
    if let Some(message) = json.get("message").and_then(Value::as_str) {
        detail.push_str(": ");
        detail.push_str(message);
    }
    detail
}

fn with_stderr_tail(mut detail: String, stderr: &str) -> String {
    let tail = stderr.trim().lines().last().unwrap_or("");
    if !tail.is_empty() {
        detail.push_str(": ");
        detail.push_str(tail);
    }
    detail
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Tier;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn raw(exit_code: Option<i32>, stdout: &str) -> RawOutput {
        RawOutput {
            exit_code,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    #[test]
    fn test_classify_success() {
        let c = classify(&raw(Some(0), r#"{"status":0,"result":{"details":[]}}"#));
        assert_eq!(c.outcome, AttemptOutcome::Succeeded);
        assert_eq!(c.output["status"], 0);
    }

    #[test]
    fn test_classify_application_failure() {
        let c = classify(&raw(
            Some(1),
            r#"{"status":1,"message":"Deploy failed","result":{"details":[{"problem":"x"},{"problem":"y"}]}}"#,
        ));
        assert_eq!(c.outcome, AttemptOutcome::ApplicationFailure);
        assert!(c.detail.contains("2 failure detail(s)"));
        assert!(c.detail.contains("Deploy failed"));
        assert!(!c.outcome.retry_eligible());
    }

    #[test]
    fn test_classify_non_json_failure_is_infrastructure() {
        let mut r = raw(Some(127), "command not found");
        r.stderr = "sh: sf: not found\n".to_string();
        let c = classify(&r);
        assert_eq!(c.outcome, AttemptOutcome::InfrastructureFailure);
        assert!(c.detail.contains("127"));
        assert!(c.detail.contains("sf: not found"));
        assert_eq!(c.output["stdout"], "command not found");
    }

    #[test]
    fn test_classify_malformed_success_output() {
        let c = classify(&raw(Some(0), "Deployed!"));
        assert_eq!(c.outcome, AttemptOutcome::InfrastructureFailure);
        assert!(c.detail.contains("malformed"));
    }

    #[test]
    fn test_classify_missing_status() {
        let c = classify(&raw(Some(0), r#"{"result":{}}"#));
        assert_eq!(c.outcome, AttemptOutcome::InfrastructureFailure);
    }

    #[test]
    fn test_classify_error_without_result() {
        let c = classify(&raw(Some(1), r#"{"status":1,"name":"NoOrgFound"}"#));
        assert_eq!(c.outcome, AttemptOutcome::InfrastructureFailure);
    }

    #[test]
    fn test_classify_status_zero_with_failing_exit() {
        let c = classify(&raw(Some(2), r#"{"status":0,"result":{}}"#));
        assert_eq!(c.outcome, AttemptOutcome::InfrastructureFailure);
    }

    struct SlowCommand {
        dropped: Arc<AtomicBool>,
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl DeployCommand for SlowCommand {
        fn describe(&self, _request: &DeployRequest) -> Vec<String> {
            vec!["slow".to_string()]
        }

        async fn invoke(&self, _request: &DeployRequest) -> Result<RawOutput, ExecError> {
            let _flag = DropFlag(self.dropped.clone());
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(RawOutput::default())
        }
    }

    fn qa() -> Environment {
        Environment::new("qa", Tier::Qa, CredentialRef::new("qa-alias"))
    }

    #[tokio::test]
    async fn test_timeout_abandons_invocation() {
        let dropped = Arc::new(AtomicBool::new(false));
        let executor = CommandExecutor::new(
            Arc::new(SlowCommand {
                dropped: dropped.clone(),
            }),
            Duration::from_secs(60),
        );
        let result = executor
            .execute(
                &qa(),
                &ArtifactRef::new("force-app", "abc"),
                AttemptKind::Deploy,
                Duration::from_millis(50),
                &CancelToken::new(),
            )
            .await;

        assert_eq!(result.outcome, AttemptOutcome::Timeout);
        assert!(result.detail.contains("timed out"));
        assert!(dropped.load(Ordering::SeqCst), "invocation must be dropped");
        assert_eq!(result.command, vec!["slow".to_string()]);
    }

    #[tokio::test]
    async fn test_cancel_forces_timeout() {
        let dropped = Arc::new(AtomicBool::new(false));
        let executor = CommandExecutor::new(
            Arc::new(SlowCommand {
                dropped: dropped.clone(),
            }),
            Duration::from_secs(60),
        );
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = executor
            .execute(
                &qa(),
                &ArtifactRef::new("force-app", "abc"),
                AttemptKind::Deploy,
                Duration::from_secs(30),
                &cancel,
            )
            .await;

        assert_eq!(result.outcome, AttemptOutcome::Timeout);
        assert_eq!(result.detail, "cancelled");
        assert!(dropped.load(Ordering::SeqCst));
    }
}
