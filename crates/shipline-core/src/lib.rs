//! Shipline Core Library
//!
//! Environment registry, command executor, pipeline engine and rollback
//! coordinator. The audit log lives in `shipline-ledger`.

pub mod cancel;
pub mod config;
pub mod domain;
pub mod executor;
pub mod gate;
pub mod graph;
pub mod metrics;
pub mod obs;
pub mod pipeline;
pub mod process;
pub mod registry;
pub mod retry;
pub mod rollback;
pub mod telemetry;

pub use cancel::CancelToken;
pub use config::{ShiplineConfig, DEFAULT_CONFIG_FILE};
pub use domain::{
    CredentialRef, Environment, Result, Run, RunContext, ShiplineError, Stage, StageMode,
    StageState, StageStatus, TestLevel, Tier, Trigger, TriggerEvent,
};
pub use executor::{
    CommandExecutor, DeployCommand, DeployRequest, ExecError, ExecutionResult, RawOutput,
};
pub use gate::{GateDecision, StageGate};
pub use graph::StageGraph;
pub use pipeline::PipelineEngine;
pub use process::ProcessCommand;
pub use registry::EnvironmentRegistry;
pub use retry::RetryPolicy;
pub use rollback::{RollbackCoordinator, RollbackReport};

pub use shipline_ledger::{
    ArtifactRef, AttemptKind, AttemptOutcome, AuditEntry, AuditLog, JsonlAuditLog, RunId,
    RunRecord, RunStatus, StageAttemptRecord,
};
