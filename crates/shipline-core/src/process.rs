//! Deploy command backed by a real child process.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use shipline_ledger::AttemptKind;
use tokio::process::Command;

use crate::executor::{DeployCommand, DeployRequest, ExecError, RawOutput};

/// Runs a configured program with templated arguments.
///
/// Recognised placeholders in `args` and `validate_args`: `{environment}`,
/// `{credential}`, `{artifact}`, `{test_level}`, `{revision}`. The same values
/// are exported to the child as `SHIPLINE_*` variables.
#[derive(Debug, Clone)]
pub struct ProcessCommand {
    program: String,
    args: Vec<String>,
    /// Appended after `args` for validate-mode attempts.
    validate_args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl ProcessCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            validate_args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn with_validate_args(mut self, args: Vec<String>) -> Self {
        self.validate_args = args;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn render_args(&self, request: &DeployRequest) -> Vec<String> {
        let extra: &[String] = match request.kind {
            AttemptKind::Validate => &self.validate_args,
            AttemptKind::Deploy | AttemptKind::Rollback => &[],
        };
        self.args
            .iter()
            .chain(extra)
            .map(|arg| render(arg, request))
            .collect()
    }
}

fn render(template: &str, request: &DeployRequest) -> String {
    template
        .replace("{environment}", &request.environment)
        .replace("{credential}", request.credential.as_str())
        .replace("{artifact}", &request.artifact.path)
        .replace("{test_level}", request.test_level.platform_flag())
        .replace("{revision}", &request.artifact.revision)
}

#[async_trait]
impl DeployCommand for ProcessCommand {
    fn describe(&self, request: &DeployRequest) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.render_args(request))
            .collect()
    }

    async fn invoke(&self, request: &DeployRequest) -> Result<RawOutput, ExecError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.render_args(request))
            .env("SHIPLINE_ENVIRONMENT", &request.environment)
            .env("SHIPLINE_CREDENTIAL_REF", request.credential.as_str())
            .env("SHIPLINE_ARTIFACT", &request.artifact.path)
            .env("SHIPLINE_REVISION", &request.artifact.revision)
            .env("SHIPLINE_TEST_LEVEL", request.test_level.platform_flag())
            .env("SHIPLINE_MODE", request.kind.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|source| ExecError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let mut group = GroupGuard::new(child.id());
        let output = child.wait_with_output().await?;
        group.disarm();

        Ok(RawOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Kills the child's whole process group when dropped while armed.
///
/// The child leads its own group, so workers it forked are reached too. The
/// guard lives inside the invocation future: a timeout or cancellation drops
/// it before the output is collected.
struct GroupGuard {
    pgid: Option<u32>,
}

impl GroupGuard {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_group(pgid);
        }
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: kill(2) takes plain integers and touches no memory of ours.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        tracing::debug!(pgid, error = %std::io::Error::last_os_error(), "process group already gone");
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::domain::{CredentialRef, Environment, TestLevel, Tier};
    use crate::executor::CommandExecutor;
    use shipline_ledger::{ArtifactRef, AttemptOutcome};
    use std::sync::Arc;
    use std::time::Duration;

    fn qa() -> Environment {
        Environment::new("qa", Tier::Qa, CredentialRef::new("qa-org"))
            .with_test_level(TestLevel::Local)
    }

    fn request(kind: AttemptKind) -> DeployRequest {
        DeployRequest::for_environment(&qa(), &ArtifactRef::new("force-app", "abc123"), kind)
    }

    fn sh(script: &str) -> ProcessCommand {
        ProcessCommand::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    async fn execute(command: ProcessCommand, timeout: Duration) -> crate::executor::ExecutionResult {
        let executor = CommandExecutor::new(Arc::new(command), timeout);
        executor
            .execute(
                &qa(),
                &ArtifactRef::new("force-app", "abc123"),
                AttemptKind::Deploy,
                timeout,
                &CancelToken::new(),
            )
            .await
    }

    #[test]
    fn test_placeholders_are_rendered() {
        let cmd = ProcessCommand::new(
            "sf",
            vec![
                "--target-org".into(),
                "{credential}".into(),
                "--source-dir".into(),
                "{artifact}".into(),
                "--test-level".into(),
                "{test_level}".into(),
                "--tag={environment}@{revision}".into(),
            ],
        )
        .with_validate_args(vec!["--dry-run".into()]);

        let deploy = cmd.describe(&request(AttemptKind::Deploy));
        assert_eq!(
            deploy,
            vec![
                "sf",
                "--target-org",
                "qa-org",
                "--source-dir",
                "force-app",
                "--test-level",
                "RunLocalTests",
                "--tag=qa@abc123"
            ]
        );

        let validate = cmd.describe(&request(AttemptKind::Validate));
        assert_eq!(validate.last().map(String::as_str), Some("--dry-run"));

        let rollback = cmd.describe(&request(AttemptKind::Rollback));
        assert!(!rollback.contains(&"--dry-run".to_string()));
    }

    #[tokio::test]
    async fn test_env_vars_are_exported() {
        let out = sh("printf '%s %s %s' \"$SHIPLINE_CREDENTIAL_REF\" \"$SHIPLINE_TEST_LEVEL\" \"$SHIPLINE_MODE\"")
            .invoke(&request(AttemptKind::Validate))
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(out.stdout, "qa-org RunLocalTests validate");
    }

    #[tokio::test]
    async fn test_json_success() {
        let result = execute(
            sh(r#"echo '{"status":0,"result":{"id":"0Af"}}'"#),
            Duration::from_secs(10),
        )
        .await;
        assert_eq!(result.outcome, AttemptOutcome::Succeeded);
        assert_eq!(result.output["result"]["id"], "0Af");
        assert_eq!(result.command[0], "sh");
    }

    #[tokio::test]
    async fn test_json_application_failure() {
        let result = execute(
            sh(r#"echo '{"status":1,"result":{"details":[{"problem":"Missing field"}]}}'; exit 1"#),
            Duration::from_secs(10),
        )
        .await;
        assert_eq!(result.outcome, AttemptOutcome::ApplicationFailure);
        assert_eq!(result.exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_crash_without_json_is_infrastructure() {
        let result = execute(sh("echo 'ECONNRESET' >&2; exit 3"), Duration::from_secs(10)).await;
        assert_eq!(result.outcome, AttemptOutcome::InfrastructureFailure);
        assert!(result.detail.contains("ECONNRESET"));
    }

    #[tokio::test]
    async fn test_missing_program_is_infrastructure() {
        let result = execute(
            ProcessCommand::new("shipline-definitely-not-installed", vec![]),
            Duration::from_secs(10),
        )
        .await;
        assert_eq!(result.outcome, AttemptOutcome::InfrastructureFailure);
        assert!(result.detail.contains("failed to spawn"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_forked_workers() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("deployed");
        let script = format!(
            r#"(sleep 1; touch '{}') & wait; echo '{{"status":0,"result":{{}}}}'"#,
            marker.display()
        );

        let result = execute(sh(&script), Duration::from_millis(200)).await;
        assert_eq!(result.outcome, AttemptOutcome::Timeout);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists(), "forked worker outlived the timed-out attempt");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_kills_forked_workers() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("deployed");
        let script = format!("(sleep 1; touch '{}') & wait", marker.display());
        let executor = CommandExecutor::new(Arc::new(sh(&script)), Duration::from_secs(10));
        let cancel = CancelToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let result = executor
            .execute(
                &qa(),
                &ArtifactRef::new("force-app", "abc123"),
                AttemptKind::Deploy,
                Duration::from_secs(10),
                &cancel,
            )
            .await;
        assert_eq!(result.outcome, AttemptOutcome::Timeout);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_slow_process_times_out() {
        let result = execute(sh("sleep 5"), Duration::from_millis(200)).await;
        assert_eq!(result.outcome, AttemptOutcome::Timeout);
        assert!(result.duration < Duration::from_secs(4));
    }
}
