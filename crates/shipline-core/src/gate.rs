//! Per-stage gate evaluation.
//!
//! A stage runs only when every upstream stage resolved Succeeded, its trigger
//! matches the run's branch, and (for approval-gated environments) an operator
//! approved it. Anything else resolves the stage Skipped with a reason.

use serde::{Deserialize, Serialize};

use crate::domain::{Environment, RunContext, Stage, StageStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    Run,
    Skip { reason: String },
}

pub struct StageGate;

impl StageGate {
    /// Decide whether `stage` may run.
    ///
    /// `upstream` pairs each direct dependency name with its resolved status.
    /// Checks run in order: upstream success, trigger, approval.
    pub fn evaluate(
        stage: &Stage,
        environment: &Environment,
        ctx: &RunContext,
        upstream: &[(&str, &StageStatus)],
    ) -> GateDecision {
        if let Some((name, _)) = upstream
            .iter()
            .find(|(_, status)| !matches!(status, StageStatus::Succeeded))
        {
            return GateDecision::Skip {
                reason: format!("upstream '{name}' did not succeed"),
            };
        }

        if !stage.trigger.matches(ctx.branch()) {
            return GateDecision::Skip {
                reason: format!(
                    "trigger not met: {} (branch '{}')",
                    stage.trigger,
                    ctx.branch()
                ),
            };
        }

        if environment.approval_required && !ctx.is_approved(&stage.name, &environment.id) {
            return GateDecision::Skip {
                reason: "approval required".to_string(),
            };
        }

        GateDecision::Run
    }
}
