//! Execution context and the per-experiment pipeline.
//!
//! The pipeline runs an experiment's stages in order. Each stage is an
//! [`ActivityTask`] handled by the [`PhaseHandler`] registered for its phase.
//! A stage hands off to the next once its completion signal resolves, so a
//! stage's `wait_of_after` holds the rest of the pipeline back. Forward stages
//! (prepare, attack, status) run while the experiment is READY/RUNNING; the
//! experiment is then moved to STOPPING and the recover stages run.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::handler::{PhaseHandler, PhaseHandlers};
use crate::invoker::{InvokerStrategyRegistry, RequestFactory};
use crate::model::{ActivityTaskSpec, ExperimentTaskUpdate, Phase, ResultStatus, RunStatus};
use crate::repository::Repositories;
use crate::task::{ActivityTask, Outcome};
use crate::timer::Timer;

/// Tunables read by the task machinery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub poll_interval: Duration,
    pub max_poll_attempts: Option<u32>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(3_000),
            max_poll_attempts: None,
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            max_poll_attempts: config.reconcile.max_attempts,
        }
    }
}

/// Process-wide services, built once at startup.
#[derive(Clone)]
pub struct EngineServices {
    pub repositories: Repositories,
    pub invokers: Arc<InvokerStrategyRegistry>,
    pub requests: Arc<dyn RequestFactory>,
    pub settings: EngineSettings,
}

/// Everything a stage needs to run, cheap to clone. All engine
/// continuations are spawned on `executor`.
#[derive(Clone)]
pub struct ExecutionContext {
    services: EngineServices,
    handlers: Arc<PhaseHandlers>,
    executor: Handle,
    timer: Timer,
}

impl ExecutionContext {
    pub fn new(services: EngineServices, handlers: PhaseHandlers, executor: Handle) -> Self {
        Self {
            services,
            handlers: Arc::new(handlers),
            timer: Timer::new(executor.clone()),
            executor,
        }
    }

    /// Standard handlers on the current runtime.
    pub fn current(services: EngineServices) -> Self {
        Self::new(services, PhaseHandlers::standard(), Handle::current())
    }

    pub fn services(&self) -> &EngineServices {
        &self.services
    }

    pub fn repositories(&self) -> &Repositories {
        &self.services.repositories
    }

    pub fn invokers(&self) -> &InvokerStrategyRegistry {
        &self.services.invokers
    }

    pub fn requests(&self) -> &dyn RequestFactory {
        self.services.requests.as_ref()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.services.settings
    }

    pub fn handlers(&self) -> &PhaseHandlers {
        &self.handlers
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.executor.spawn(future)
    }
}

/// How one stage ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "message", rename_all = "snake_case")]
pub enum StageOutcome {
    Skipped,
    Succeeded,
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub activity_task_id: i64,
    pub phase: Phase,
    pub scene_code: String,
    #[serde(flatten)]
    pub outcome: StageOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineSummary {
    pub experiment_task_id: i64,
    pub stages: Vec<StageReport>,
    pub result_status: ResultStatus,
}

impl PipelineSummary {
    pub fn failed_stages(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| matches!(s.outcome, StageOutcome::Failed(_)))
            .count()
    }
}

/// Ordered stages of one experiment run.
pub struct ExecutionPipeline {
    experiment_task_id: i64,
    stages: Vec<Arc<ActivityTask>>,
}

impl ExecutionPipeline {
    /// All specs must belong to `experiment_task_id`.
    pub fn new(experiment_task_id: i64, specs: Vec<ActivityTaskSpec>) -> Self {
        Self {
            experiment_task_id,
            stages: specs
                .into_iter()
                .map(|spec| Arc::new(ActivityTask::new(spec)))
                .collect(),
        }
    }

    pub fn stages(&self) -> &[Arc<ActivityTask>] {
        &self.stages
    }

    pub async fn execute(&self, ctx: &ExecutionContext) -> Result<PipelineSummary, EngineError> {
        let experiments = &ctx.repositories().experiments;
        let id = self.experiment_task_id;
        let experiment = experiments
            .select_by_id(id)
            .await?
            .ok_or(EngineError::ExperimentTaskNotFound { id })?;

        if experiment.run_status == RunStatus::Ready {
            experiments
                .update_by_primary_key(
                    id,
                    ExperimentTaskUpdate {
                        run_status: Some(RunStatus::Running),
                        gmt_start: Some(Utc::now()),
                        ..Default::default()
                    },
                )
                .await?;
            info!(experiment_task_id = id, name = %experiment.name, "Experiment started");
        }

        let (recover, forward): (Vec<_>, Vec<_>) = self
            .stages
            .iter()
            .partition(|task| task.phase() == Phase::Recover);

        let mut stages = Vec::with_capacity(self.stages.len());
        for task in forward {
            stages.push(self.fire_execute(ctx, task).await);
        }

        let current = experiments
            .select_by_id(id)
            .await?
            .ok_or(EngineError::ExperimentTaskNotFound { id })?;
        if current.run_status == RunStatus::Running {
            experiments
                .update_by_primary_key(
                    id,
                    ExperimentTaskUpdate {
                        run_status: Some(RunStatus::Stopping),
                        ..Default::default()
                    },
                )
                .await?;
            info!(experiment_task_id = id, "Experiment stopping");
        }

        for task in recover {
            stages.push(self.fire_execute(ctx, task).await);
        }

        let attacks = ctx
            .repositories()
            .records
            .select_by_experiment_task_id(id)
            .await?
            .iter()
            .filter(|r| r.phase == Some(Phase::Attack) && r.is_successful())
            .count();
        let result_status = ResultStatus::from_attack_successes(attacks);
        experiments
            .update_by_primary_key(
                id,
                ExperimentTaskUpdate {
                    run_status: Some(RunStatus::Finished),
                    result_status: Some(result_status),
                    gmt_end: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        info!(
            experiment_task_id = id,
            result_status = result_status.as_str(),
            "Experiment finished"
        );

        Ok(PipelineSummary {
            experiment_task_id: id,
            stages,
            result_status,
        })
    }

    /// Run one stage and wait for its completion signal before handing off.
    /// A stage that cannot even be checked counts as failed; the pipeline
    /// moves on either way.
    async fn fire_execute(&self, ctx: &ExecutionContext, task: &Arc<ActivityTask>) -> StageReport {
        let handler: &dyn PhaseHandler = ctx.handlers().for_phase(task.phase());
        let outcome = match handler.pre_handle(task, ctx).await {
            Ok(true) => {
                handler.handle(task, ctx);
                stage_outcome(task.wait().await)
            }
            Ok(false) => {
                task.skip();
                StageOutcome::Skipped
            }
            Err(err) => {
                task.completion().complete(Err(err.clone()));
                StageOutcome::Failed(err.to_string())
            }
        };
        if let StageOutcome::Failed(message) = &outcome {
            warn!(
                experiment_task_id = task.experiment_task_id(),
                phase = %task.phase(),
                error = %message,
                "Stage failed, continuing"
            );
        }
        StageReport {
            activity_task_id: task.activity_task_id(),
            phase: task.phase(),
            scene_code: task.scene_code().to_string(),
            outcome,
        }
    }
}

fn stage_outcome(outcome: Outcome) -> StageOutcome {
    match outcome {
        Ok(()) => StageOutcome::Succeeded,
        Err(err) => StageOutcome::Failed(err.to_string()),
    }
}

/// Ask a running experiment to stop. Forward stages that have not started
/// yet see STOPPING and skip; recover stages then run. Returns false if the
/// experiment was neither READY nor RUNNING.
pub async fn stop_experiment(
    repositories: &Repositories,
    experiment_task_id: i64,
) -> Result<bool, EngineError> {
    let experiment = repositories
        .experiments
        .select_by_id(experiment_task_id)
        .await?
        .ok_or(EngineError::ExperimentTaskNotFound {
            id: experiment_task_id,
        })?;
    if !matches!(experiment.run_status, RunStatus::Ready | RunStatus::Running) {
        warn!(
            experiment_task_id,
            run_status = experiment.run_status.as_str(),
            "Experiment is not running"
        );
        return Ok(false);
    }
    repositories
        .experiments
        .update_by_primary_key(
            experiment_task_id,
            ExperimentTaskUpdate {
                run_status: Some(RunStatus::Stopping),
                ..Default::default()
            },
        )
        .await?;
    info!(experiment_task_id, "Experiment stop requested");
    Ok(true)
}
