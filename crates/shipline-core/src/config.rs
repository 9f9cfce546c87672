//! TOML configuration: environments, stages, the deploy command and defaults.
//!
//! Credential references are never stored in the document. Each environment
//! names an environment variable (default `SHIPLINE_<ID>_CREDENTIAL`) that
//! must be set when the registry is built.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{
    CredentialRef, Environment, Result, ShiplineError, Stage, StageMode, TestLevel, Tier, Trigger,
};
use crate::process::ProcessCommand;
use crate::registry::EnvironmentRegistry;
use crate::retry::RetryPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "shipline.toml";

fn default_audit_log() -> PathBuf {
    PathBuf::from(".shipline/audit.jsonl")
}

fn default_artifact() -> String {
    "force-app".to_string()
}

fn default_timeout_secs() -> u64 {
    1800
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ShiplineConfig {
    #[serde(default = "default_audit_log")]
    pub audit_log: PathBuf,
    /// Artifact path deployed by `run` unless overridden.
    #[serde(default = "default_artifact")]
    pub artifact: String,
    pub command: CommandConfig,
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub environments: Vec<EnvironmentConfig>,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CommandConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Appended to `args` for validate-mode stages.
    #[serde(default)]
    pub validate_args: Vec<String>,
    /// Per-attempt wall-clock limit unless a stage overrides it.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Defaults {
    #[serde(default)]
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentConfig {
    pub id: String,
    pub tier: Tier,
    #[serde(default)]
    pub test_level: TestLevel,
    #[serde(default)]
    pub approval_required: bool,
    pub refresh_cadence: Option<String>,
    /// Overrides the derived credential variable name.
    pub credential_env: Option<String>,
}

impl EnvironmentConfig {
    pub fn credential_var(&self) -> String {
        self.credential_env
            .clone()
            .unwrap_or_else(|| credential_var_for(&self.id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    pub name: String,
    pub environment: String,
    #[serde(default)]
    pub mode: StageMode,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub trigger: Trigger,
    /// Falls back to `[defaults.retry]`.
    pub retry: Option<RetryPolicy>,
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub rollback_on_failure: bool,
}

/// `qa` -> `SHIPLINE_QA_CREDENTIAL`, `uat-eu` -> `SHIPLINE_UAT_EU_CREDENTIAL`.
pub fn credential_var_for(id: &str) -> String {
    let id: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("SHIPLINE_{id}_CREDENTIAL")
}

impl ShiplineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| ShiplineError::Configuration(format!("invalid config: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ShiplineError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Build the registry, resolving credential references from the process
    /// environment.
    pub fn build_registry(&self) -> Result<EnvironmentRegistry> {
        self.build_registry_with(|var| std::env::var(var).ok())
    }

    /// Build the registry with an explicit variable lookup.
    pub fn build_registry_with<F>(&self, lookup: F) -> Result<EnvironmentRegistry>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut registry = EnvironmentRegistry::new();
        for env in &self.environments {
            let var = env.credential_var();
            let credential = lookup(&var)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| {
                    ShiplineError::Configuration(format!(
                        "environment '{}' needs credential reference variable {var}",
                        env.id
                    ))
                })?;

            let mut environment = Environment::new(&env.id, env.tier, CredentialRef::new(credential))
                .with_test_level(env.test_level);
            if env.approval_required {
                environment = environment.requiring_approval();
            }
            if let Some(cadence) = &env.refresh_cadence {
                environment = environment.with_refresh_cadence(cadence);
            }
            registry.register(environment)?;
        }
        Ok(registry)
    }

    /// Stage definitions with defaults applied.
    pub fn stages(&self) -> Vec<Stage> {
        self.stages
            .iter()
            .map(|s| Stage {
                name: s.name.clone(),
                depends_on: s.depends_on.clone(),
                environment: s.environment.clone(),
                mode: s.mode,
                trigger: s.trigger.clone(),
                retry: s.retry.clone().unwrap_or_else(|| self.defaults.retry.clone()),
                timeout: s.timeout_secs.map(Duration::from_secs),
                rollback_on_failure: s.rollback_on_failure,
            })
            .collect()
    }

    pub fn process_command(&self) -> ProcessCommand {
        let mut cmd = ProcessCommand::new(&self.command.program, self.command.args.clone())
            .with_validate_args(self.command.validate_args.clone());
        if let Some(dir) = &self.command.working_dir {
            cmd = cmd.with_working_dir(dir);
        }
        cmd
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.command.timeout_secs)
    }
}
