//! Experiment plans: the JSON document a run starts from.
//!
//! A plan names the experiment and lists its stages in execution order.
//! `materialize` persists the experiment and one READY activity row per
//! stage, and returns the specs the pipeline runs.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::model::{
    ActivityTaskSpec, DeviceMeta, ExperimentActivityTask, ExperimentDimension, ExperimentTask,
    Phase, RunStatus,
};
use crate::repository::Repositories;
use crate::scene::SceneCode;

fn default_flow_id() -> i64 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePlan {
    pub phase: Phase,
    pub scene_code: String,
    pub dimension: ExperimentDimension,
    #[serde(default)]
    pub devices: Vec<DeviceMeta>,
    #[serde(default)]
    pub arguments: BTreeMap<String, String>,
    #[serde(default)]
    pub wait_of_after_ms: Option<u64>,
    #[serde(default = "default_flow_id")]
    pub flow_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentPlan {
    pub name: String,
    pub stages: Vec<StagePlan>,
}

impl ExperimentPlan {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid plan {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let plan: Self = serde_json::from_str(content).context("Failed to parse plan JSON")?;
        plan.validate()?;
        Ok(plan)
    }

    fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            bail!("Plan '{}' has no stages", self.name);
        }
        for (index, stage) in self.stages.iter().enumerate() {
            let scene = SceneCode::parse(&stage.scene_code)
                .with_context(|| format!("Stage {}", index + 1))?;
            if (stage.phase == Phase::Recover) != scene.is_recover() {
                bail!(
                    "Stage {}: recover stages take a '.stop' scene code and only they do ({})",
                    index + 1,
                    stage.scene_code
                );
            }
        }
        Ok(())
    }

    /// Persist the experiment and its activity rows. Returns the experiment
    /// id and the stage specs in plan order.
    pub async fn materialize(
        &self,
        repositories: &Repositories,
    ) -> Result<(i64, Vec<ActivityTaskSpec>)> {
        let experiment_task_id = repositories
            .experiments
            .insert(ExperimentTask::new(&self.name))
            .await
            .context("Failed to create experiment task")?;

        let mut specs = Vec::with_capacity(self.stages.len());
        for (index, stage) in self.stages.iter().enumerate() {
            // Activities are numbered by their position in the plan.
            let activity_id = index as i64 + 1;
            let activity_task_id = repositories
                .activities
                .insert(ExperimentActivityTask {
                    id: 0,
                    experiment_task_id,
                    activity_id,
                    flow_id: stage.flow_id,
                    phase: stage.phase,
                    scene_code: stage.scene_code.clone(),
                    run_status: RunStatus::Ready,
                    result_status: None,
                    error_message: None,
                    gmt_start: None,
                    gmt_end: None,
                })
                .await
                .with_context(|| format!("Failed to create activity task for stage {}", index + 1))?;
            specs.push(ActivityTaskSpec {
                experiment_task_id,
                activity_task_id,
                activity_id,
                flow_id: stage.flow_id,
                phase: stage.phase,
                scene_code: stage.scene_code.clone(),
                experiment_dimension: stage.dimension,
                device_metas: stage.devices.clone(),
                arguments: stage.arguments.clone(),
                wait_of_after_ms: stage.wait_of_after_ms,
            });
        }
        Ok((experiment_task_id, specs))
    }
}
