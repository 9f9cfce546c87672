//! Shared fixtures: a scripted deploy command and a three-tier registry.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use shipline_core::{
    AttemptKind, CommandExecutor, CredentialRef, DeployCommand, DeployRequest, Environment,
    EnvironmentRegistry, ExecError, RawOutput, RetryPolicy, Tier,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ok,
    /// Structured failure; never retried.
    AppFail,
    /// Non-JSON crash; retried.
    Crash,
    /// Never returns on its own.
    Hang,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub environment: String,
    pub kind: AttemptKind,
    pub revision: String,
}

/// Replies per (environment, kind) in order; `Reply::Ok` once a script runs out.
#[derive(Default)]
pub struct ScriptedCommand {
    scripts: Mutex<HashMap<(String, AttemptKind), VecDeque<Reply>>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedCommand {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, environment: &str, kind: AttemptKind, replies: &[Reply]) {
        self.scripts
            .lock()
            .unwrap()
            .entry((environment.to_string(), kind))
            .or_default()
            .extend(replies.iter().copied());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn next_reply(&self, request: &DeployRequest) -> Reply {
        self.scripts
            .lock()
            .unwrap()
            .get_mut(&(request.environment.clone(), request.kind))
            .and_then(VecDeque::pop_front)
            .unwrap_or(Reply::Ok)
    }
}

#[async_trait]
impl DeployCommand for ScriptedCommand {
    fn describe(&self, request: &DeployRequest) -> Vec<String> {
        vec![
            "deploy".to_string(),
            "--target-org".to_string(),
            request.credential.as_str().to_string(),
            "--source-dir".to_string(),
            request.artifact.path.clone(),
        ]
    }

    async fn invoke(&self, request: &DeployRequest) -> Result<RawOutput, ExecError> {
        self.calls.lock().unwrap().push(Call {
            environment: request.environment.clone(),
            kind: request.kind,
            revision: request.artifact.revision.clone(),
        });

        match self.next_reply(request) {
            Reply::Ok => Ok(RawOutput {
                exit_code: Some(0),
                stdout: r#"{"status":0,"result":{"success":true}}"#.to_string(),
                stderr: String::new(),
            }),
            Reply::AppFail => Ok(RawOutput {
                exit_code: Some(1),
                stdout: r#"{"status":1,"result":{"details":[{"problem":"Invalid field"}]}}"#
                    .to_string(),
                stderr: String::new(),
            }),
            Reply::Crash => Ok(RawOutput {
                exit_code: Some(1),
                stdout: String::new(),
                stderr: "socket hang up".to_string(),
            }),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ExecError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "hung",
                )))
            }
        }
    }
}

pub fn executor(command: Arc<ScriptedCommand>) -> Arc<CommandExecutor> {
    Arc::new(CommandExecutor::new(command, Duration::from_secs(10)))
}

/// qa, uat and an approval-gated prod.
pub fn registry() -> Arc<EnvironmentRegistry> {
    let mut registry = EnvironmentRegistry::new();
    registry
        .register(Environment::new("qa", Tier::Qa, CredentialRef::new("qa-alias")))
        .unwrap();
    registry
        .register(Environment::new("uat", Tier::Uat, CredentialRef::new("uat-alias")))
        .unwrap();
    registry
        .register(
            Environment::new("prod", Tier::Prod, CredentialRef::new("prod-alias"))
                .requiring_approval(),
        )
        .unwrap();
    Arc::new(registry)
}

/// Three attempts, millisecond backoff, no jitter.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        backoff_base_ms: 1,
        backoff_max_ms: 4,
        jitter: false,
    }
}
