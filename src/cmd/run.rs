//! Experiment execution commands: `chaos-engine run` and `chaos-engine stop`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use chaos_engine::config::EngineConfig;
use chaos_engine::invoker::{AgentRequestFactory, default_registry};
use chaos_engine::pipeline::{
    EngineServices, EngineSettings, ExecutionContext, ExecutionPipeline, stop_experiment,
};
use chaos_engine::plan::ExperimentPlan;

use super::{open_repositories, require_repositories};

pub async fn cmd_run(config: &EngineConfig, plan_path: &Path) -> Result<()> {
    let plan = ExperimentPlan::load(plan_path)?;
    let repositories = open_repositories(config)?;
    let (experiment_task_id, specs) = plan.materialize(&repositories).await?;
    tracing::info!(
        experiment_task_id,
        name = %plan.name,
        stages = specs.len(),
        "Experiment created"
    );

    let services = EngineServices {
        repositories,
        invokers: Arc::new(default_registry(config)),
        requests: Arc::new(AgentRequestFactory::new(config.agent.port)),
        settings: EngineSettings::from_config(config),
    };
    let ctx = ExecutionContext::current(services);
    let summary = ExecutionPipeline::new(experiment_task_id, specs)
        .execute(&ctx)
        .await
        .with_context(|| format!("Experiment {} aborted", experiment_task_id))?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

pub async fn cmd_stop(config: &EngineConfig, experiment_task_id: i64) -> Result<()> {
    let repositories = require_repositories(config)?;
    if stop_experiment(&repositories, experiment_task_id).await? {
        println!("Experiment {} is stopping", experiment_task_id);
    } else {
        println!("Experiment {} is not running", experiment_task_id);
    }
    Ok(())
}
