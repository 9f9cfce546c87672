//! Pipeline stage definitions.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use shipline_ledger::AttemptKind;

use crate::retry::RetryPolicy;

/// What a stage does to its environment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageMode {
    /// Check-only deploy (the platform's dry-run).
    Validate,
    #[default]
    Deploy,
}

impl StageMode {
    pub fn attempt_kind(&self) -> AttemptKind {
        match self {
            StageMode::Validate => AttemptKind::Validate,
            StageMode::Deploy => AttemptKind::Deploy,
        }
    }
}

/// Branch condition under which a stage runs.
///
/// In TOML: `trigger = "always"`, `trigger = { branch = "develop" }`,
/// `trigger = { branch_prefix = "release/" }` or
/// `trigger = { any_branch = ["main", "master"] }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    #[default]
    Always,
    Branch(String),
    BranchPrefix(String),
    AnyBranch(Vec<String>),
}

impl Trigger {
    pub fn matches(&self, branch: &str) -> bool {
        match self {
            Trigger::Always => true,
            Trigger::Branch(b) => b == branch,
            Trigger::BranchPrefix(prefix) => branch.starts_with(prefix.as_str()),
            Trigger::AnyBranch(branches) => branches.iter().any(|b| b == branch),
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Always => write!(f, "always"),
            Trigger::Branch(b) => write!(f, "branch == {b}"),
            Trigger::BranchPrefix(p) => write!(f, "branch starts with {p}"),
            Trigger::AnyBranch(bs) => write!(f, "branch in [{}]", bs.join(", ")),
        }
    }
}

/// A node in the pipeline graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub name: String,
    /// Stages that must resolve Succeeded before this one may run.
    pub depends_on: Vec<String>,
    /// Target environment id.
    pub environment: String,
    pub mode: StageMode,
    pub trigger: Trigger,
    pub retry: RetryPolicy,
    /// Overrides the executor's default wall-clock limit per attempt.
    pub timeout: Option<Duration>,
    /// On final failure, restore the environment's last known good artifact.
    pub rollback_on_failure: bool,
}

impl Stage {
    fn new(name: impl Into<String>, environment: impl Into<String>, mode: StageMode) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            environment: environment.into(),
            mode,
            trigger: Trigger::Always,
            retry: RetryPolicy::default(),
            timeout: None,
            rollback_on_failure: false,
        }
    }

    /// A real deploy stage.
    pub fn deploy(name: impl Into<String>, environment: impl Into<String>) -> Self {
        Self::new(name, environment, StageMode::Deploy)
    }

    /// A check-only stage.
    pub fn validate(name: impl Into<String>, environment: impl Into<String>) -> Self {
        Self::new(name, environment, StageMode::Validate)
    }

    pub fn after(mut self, upstream: impl Into<String>) -> Self {
        self.depends_on.push(upstream.into());
        self
    }

    pub fn when(mut self, trigger: Trigger) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_rollback_on_failure(mut self) -> Self {
        self.rollback_on_failure = true;
        self
    }
}
