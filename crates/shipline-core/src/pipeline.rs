//! Pipeline engine: executes the stage graph for one trigger event.
//!
//! Layers run in topological order. Within a layer every stage whose gate
//! passes is attempted concurrently; the next layer starts only after all of
//! them reached a terminal state, so downstream audit entries always follow
//! their upstreams'.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use shipline_ledger::{
    ArtifactRef, AuditEntry, AuditLog, RunId, RunStatus, StageAttemptRecord,
};
use tracing::{debug, info, warn, Instrument};

use crate::cancel::CancelToken;
use crate::domain::{
    Environment, Result, Run, RunContext, ShiplineError, Stage, StageMode, StageState, StageStatus,
};
use crate::executor::CommandExecutor;
use crate::gate::{GateDecision, StageGate};
use crate::graph::StageGraph;
use crate::metrics::METRICS;
use crate::obs;
use crate::registry::EnvironmentRegistry;
use crate::retry::{run_with_retries, AttemptPlan};
use crate::rollback::RollbackCoordinator;

pub struct PipelineEngine {
    registry: Arc<EnvironmentRegistry>,
    graph: StageGraph,
    executor: Arc<CommandExecutor>,
    audit: Arc<dyn AuditLog>,
    rollback: RollbackCoordinator,
}

impl PipelineEngine {
    /// Build an engine over a validated graph.
    ///
    /// Graph errors (cycles, unknown stages or environments) are returned here
    /// as `Configuration` errors, before any run can start.
    pub fn new(
        registry: Arc<EnvironmentRegistry>,
        stages: Vec<Stage>,
        executor: Arc<CommandExecutor>,
        audit: Arc<dyn AuditLog>,
    ) -> Result<Self> {
        let graph = StageGraph::build(stages, &registry)?;
        let rollback = RollbackCoordinator::new(registry.clone(), executor.clone(), audit.clone());
        Ok(Self {
            registry,
            graph,
            executor,
            audit,
            rollback,
        })
    }

    /// Replace the coordinator used for `rollback_on_failure` stages.
    pub fn with_rollback(mut self, rollback: RollbackCoordinator) -> Self {
        self.rollback = rollback;
        self
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    pub fn registry(&self) -> &EnvironmentRegistry {
        &self.registry
    }

    /// Execute one run for `ctx`.
    ///
    /// Stage failures never surface as `Err`; they end up in the returned
    /// [`Run`]'s status. Only audit log failures abort the run.
    pub async fn run(
        &self,
        ctx: &RunContext,
        artifact: ArtifactRef,
        cancel: &CancelToken,
    ) -> Result<Run> {
        let run_id = RunId::new();
        let span = obs::run_span(&run_id.0);
        self.execute(run_id, ctx, artifact, cancel)
            .instrument(span)
            .await
    }

    async fn execute(
        &self,
        run_id: RunId,
        ctx: &RunContext,
        artifact: ArtifactRef,
        cancel: &CancelToken,
    ) -> Result<Run> {
        let clock = Instant::now();
        let started_at = Utc::now();
        let order: Vec<&Stage> = self.graph.topological();

        self.audit
            .append(AuditEntry::RunStarted {
                run_id: run_id.clone(),
                revision: ctx.revision().to_string(),
                branch: Some(ctx.branch().to_string()),
                actor: ctx.actor().to_string(),
                artifact: artifact.clone(),
                stages: order.iter().map(|s| s.name.clone()).collect(),
                timestamp: started_at,
            })
            .await?;
        obs::emit_run_started(&run_id.0, ctx.revision(), ctx.branch(), order.len());

        let mut statuses: HashMap<&str, StageStatus> = HashMap::new();
        let mut attempt_counts: HashMap<&str, u32> = HashMap::new();
        let mut attempts: Vec<StageAttemptRecord> = Vec::new();
        let mut failed: Vec<&str> = Vec::new();
        let mut rolled_back: Vec<&str> = Vec::new();
        let mut interrupted = false;
        let pending = StageStatus::Pending;

        for layer in self.graph.layers() {
            let mut runnable: Vec<(&Stage, &Environment)> = Vec::new();

            for stage in layer {
                let env = self.registry.resolve(&stage.environment)?;
                let decision = if cancel.is_cancelled() {
                    interrupted = true;
                    GateDecision::Skip {
                        reason: "run cancelled".to_string(),
                    }
                } else {
                    let upstream: Vec<(&str, &StageStatus)> = self
                        .graph
                        .upstream_of(&stage.name)
                        .into_iter()
                        .map(|dep| {
                            let name = dep.name.as_str();
                            (name, statuses.get(name).unwrap_or(&pending))
                        })
                        .collect();
                    StageGate::evaluate(stage, env, ctx, &upstream)
                };

                match decision {
                    GateDecision::Run => runnable.push((stage, env)),
                    GateDecision::Skip { reason } => {
                        self.audit
                            .append(AuditEntry::StageSkipped {
                                run_id: run_id.clone(),
                                stage: stage.name.clone(),
                                environment: env.id.clone(),
                                reason: reason.clone(),
                                timestamp: Utc::now(),
                            })
                            .await?;
                        obs::emit_stage_skipped(&run_id.0, &stage.name, &reason);
                        advance(&mut statuses, &stage.name, StageStatus::Skipped { reason });
                    }
                }
            }

            if runnable.is_empty() {
                continue;
            }
            for (stage, _) in &runnable {
                advance(&mut statuses, &stage.name, StageStatus::Running);
            }
            info!(
                stages = ?runnable.iter().map(|(s, _)| s.name.as_str()).collect::<Vec<_>>(),
                "dispatching layer"
            );

            let results = join_all(runnable.iter().map(|(stage, env)| {
                run_with_retries(
                    &self.executor,
                    self.audit.as_ref(),
                    AttemptPlan {
                        run_id: &run_id,
                        stage: &stage.name,
                        environment: env,
                        artifact: &artifact,
                        kind: stage.mode.attempt_kind(),
                        policy: &stage.retry,
                        timeout: stage.timeout.unwrap_or(self.executor.default_timeout()),
                        restores: None,
                    },
                    cancel,
                )
            }))
            .await;

            let mut layer_failures: Vec<(&Stage, &Environment)> = Vec::new();
            for ((stage, env), result) in runnable.into_iter().zip(results) {
                let records = result?;
                let succeeded = records.last().map(|r| r.outcome.is_success()).unwrap_or(false);
                attempt_counts.insert(stage.name.as_str(), records.len() as u32);
                attempts.extend(records);

                if succeeded {
                    advance(&mut statuses, &stage.name, StageStatus::Succeeded);
                } else {
                    advance(&mut statuses, &stage.name, StageStatus::Failed);
                    failed.push(stage.name.as_str());
                    layer_failures.push((stage, env));
                }
            }

            for (stage, env) in layer_failures {
                if !(stage.rollback_on_failure && stage.mode == StageMode::Deploy) {
                    continue;
                }
                if cancel.is_cancelled() {
                    warn!(stage = %stage.name, "run cancelled, skipping automatic rollback");
                    continue;
                }
                let label = format!("{}:rollback", stage.name);
                match self
                    .rollback
                    .restore_within(&run_id, &label, &env.id, cancel)
                    .await
                {
                    Ok(report) => {
                        if report.succeeded() {
                            rolled_back.push(stage.name.as_str());
                        }
                        attempts.extend(report.attempts);
                    }
                    Err(ShiplineError::NoKnownGoodState { environment }) => {
                        warn!(
                            stage = %stage.name,
                            environment = %environment,
                            "no known good state, automatic rollback not possible"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let status = if !failed.is_empty() {
            if failed.iter().all(|name| rolled_back.contains(name)) {
                RunStatus::RolledBack
            } else {
                RunStatus::Failed
            }
        } else if interrupted {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };

        let finished_at = Utc::now();
        let duration_ms = clock.elapsed().as_millis() as u64;
        self.audit
            .append(AuditEntry::RunFinished {
                run_id: run_id.clone(),
                status,
                duration_ms,
                timestamp: finished_at,
            })
            .await?;
        obs::emit_run_finished(&run_id.0, &status.to_string(), duration_ms);
        METRICS.inc_runs_finished();
        METRICS.flush();

        let stages = order
            .iter()
            .map(|stage| StageState {
                name: stage.name.clone(),
                environment: stage.environment.clone(),
                status: statuses
                    .get(stage.name.as_str())
                    .cloned()
                    .unwrap_or(StageStatus::Pending),
                attempts: attempt_counts.get(stage.name.as_str()).copied().unwrap_or(0),
            })
            .collect();

        Ok(Run {
            run_id,
            revision: ctx.revision().to_string(),
            branch: ctx.branch().to_string(),
            artifact,
            status,
            started_at,
            finished_at: Some(finished_at),
            stages,
            attempts,
        })
    }
}

/// Move `stage` to `next`, refusing moves the stage state machine forbids.
fn advance<'a>(statuses: &mut HashMap<&'a str, StageStatus>, stage: &'a str, next: StageStatus) {
    let pending = StageStatus::Pending;
    let current = statuses.get(stage).unwrap_or(&pending);
    if !current.can_advance_to(&next) {
        warn!(stage, from = %current, to = %next, "ignoring illegal stage transition");
        return;
    }
    debug!(stage, to = %next, "stage transition");
    statuses.insert(stage, next);
}
