use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::PhaseHandler;
use crate::errors::EngineError;
use crate::model::{ActivityTaskRecord, RunStatus};
use crate::pipeline::ExecutionContext;
use crate::scene::SceneCode;
use crate::task::{ActivityTask, PendingCall};

/// Recover phase: undoes every earlier attempt of the attacked scene.
///
/// Runs only while the experiment is STOPPING. The attempts are the records
/// of the scene code without its `.stop` suffix; each one gets its own
/// recover request, joined like a regular fan-out.
#[derive(Debug, Default)]
pub struct DestroyPhaseHandler;

#[async_trait]
impl PhaseHandler for DestroyPhaseHandler {
    async fn pre_handle(
        &self,
        task: &ActivityTask,
        ctx: &ExecutionContext,
    ) -> Result<bool, EngineError> {
        let experiment = ctx
            .repositories()
            .experiments
            .select_by_id(task.experiment_task_id())
            .await?
            .ok_or(EngineError::ExperimentTaskNotFound {
                id: task.experiment_task_id(),
            })?;
        if experiment.run_status != RunStatus::Stopping {
            info!(
                experiment_task_id = experiment.id,
                run_status = experiment.run_status.as_str(),
                "Recover phase needs a STOPPING experiment, skipping"
            );
            return Ok(false);
        }
        if !task.check_ready(ctx).await? {
            return Ok(false);
        }
        task.mark_running(ctx).await?;
        Ok(true)
    }

    fn handle(&self, task: &Arc<ActivityTask>, ctx: &ExecutionContext) {
        if !task.try_begin_dispatch() {
            debug!(
                activity_task_id = task.activity_task_id(),
                "Recover phase already dispatched"
            );
            return;
        }
        let task = task.clone();
        let context = ctx.clone();
        ctx.spawn(async move {
            let result = destroy(&task, &context).await;
            task.post_handle(&context, result.err()).await;
        });
    }
}

async fn destroy(task: &ActivityTask, ctx: &ExecutionContext) -> Result<(), EngineError> {
    let spec = task.spec();
    let scene = SceneCode::parse(&spec.scene_code)?;
    let records = &ctx.repositories().records;

    let prior = records
        .select_by_scene_code(spec.experiment_task_id, scene.without_recover())
        .await?;
    info!(
        experiment_task_id = spec.experiment_task_id,
        scene_code = scene.without_recover(),
        attempts = prior.len(),
        "Recovering earlier attempts"
    );

    let mut inserted = Vec::with_capacity(prior.len());
    for attempt in prior {
        let mut record = ActivityTaskRecord::started(spec);
        record.device_id = attempt.device_id.clone();
        record.ip = attempt.ip.clone();
        record.hostname = attempt.hostname.clone();
        inserted.push((records.insert(record).await?, attempt));
    }

    let pending: Vec<PendingCall> = inserted
        .into_iter()
        .map(|(record_id, attempt)| PendingCall {
            record_id,
            label: attempt.device_label(),
            request: ctx.requests().recover_request(spec, &attempt),
        })
        .collect();

    // Kubernetes resources are only gone once their status says so.
    let reconcile_after = !spec.experiment_dimension.is_per_device();
    task.dispatch_all(ctx, pending, reconcile_after).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::PhaseHandler;
    use crate::invoker::ResponseCommand;
    use crate::model::{ExperimentDimension, Phase, RecordUpdate};
    use crate::testing::{ScriptedInvoker, TestHarness};

    async fn seed_attempt(
        harness: &TestHarness,
        experiment_task_id: i64,
        scene_code: &str,
        ip: &str,
        success: bool,
        result: &str,
    ) {
        let records = &harness.repositories().records;
        let id = records
            .insert(ActivityTaskRecord {
                experiment_task_id,
                scene_code: scene_code.to_string(),
                phase: Some(Phase::Attack),
                ip: Some(ip.to_string()),
                hostname: Some("db".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        records
            .update_by_primary_key(
                id,
                RecordUpdate {
                    success: Some(success),
                    result: Some(result.to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pre_handle_requires_stopping() {
        let harness = TestHarness::new();
        let experiment_id = harness.new_experiment().await;
        let spec = harness
            .stage(experiment_id, Phase::Recover, "cpu.host.fullload.stop", ExperimentDimension::Host, vec![])
            .await;
        let task = ActivityTask::new(spec);

        assert!(!DestroyPhaseHandler.pre_handle(&task, &harness.ctx).await.unwrap());
        harness.set_experiment_status(experiment_id, RunStatus::Running).await;
        assert!(!DestroyPhaseHandler.pre_handle(&task, &harness.ctx).await.unwrap());

        harness.set_experiment_status(experiment_id, RunStatus::Stopping).await;
        assert!(DestroyPhaseHandler.pre_handle(&task, &harness.ctx).await.unwrap());
        assert_eq!(harness.activity(task.activity_task_id()).await.run_status, RunStatus::Running);
    }

    #[tokio::test]
    async fn test_recovers_exactly_the_attacked_scene() {
        let harness = TestHarness::new();
        let invoker = ScriptedInvoker::always_ok("destroyed");
        harness.register_family("cpu", invoker.clone());

        let experiment_id = harness.new_experiment().await;
        seed_attempt(&harness, experiment_id, "cpu.host.fullload", "10.0.0.1", true, "uid-1").await;
        seed_attempt(&harness, experiment_id, "cpu.host.fullload", "10.0.0.2", false, "exit 1").await;
        seed_attempt(&harness, experiment_id, "cpu.host.fullloadx", "10.0.0.3", true, "uid-3").await;
        seed_attempt(&harness, experiment_id + 100, "cpu.host.fullload", "10.0.0.4", true, "uid-4").await;

        let spec = harness
            .stage(experiment_id, Phase::Recover, "cpu.host.fullload.stop", ExperimentDimension::Host, vec![])
            .await;
        harness.set_experiment_status(experiment_id, RunStatus::Stopping).await;
        let task = Arc::new(ActivityTask::new(spec));

        assert!(DestroyPhaseHandler.pre_handle(&task, &harness.ctx).await.unwrap());
        DestroyPhaseHandler.handle(&task, &harness.ctx);
        DestroyPhaseHandler.handle(&task, &harness.ctx);
        assert_eq!(task.wait().await, Ok(()));

        let mut requests = invoker.requests();
        assert_eq!(requests.len(), 2);
        requests.sort_by(|a, b| a.host.cmp(&b.host));
        assert_eq!(requests[0].host.as_deref(), Some("10.0.0.1"));
        assert_eq!(requests[0].name.as_deref(), Some("uid-1"));
        assert_eq!(requests[1].host.as_deref(), Some("10.0.0.2"));
        assert!(requests[1].name.is_none());
        assert!(requests.iter().all(|r| r.phase == Phase::Recover));
        assert!(requests.iter().all(|r| r.scene_code == "cpu.host.fullload.stop"));

        let recover_records = harness
            .repositories()
            .records
            .select_by_scene_code(experiment_id, "cpu.host.fullload.stop")
            .await
            .unwrap();
        assert_eq!(recover_records.len(), 2);
        assert!(recover_records.iter().all(|r| r.success == Some(true)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_kube_recover_waits_for_destroyed() {
        let harness = TestHarness::new();
        let invoker = ScriptedInvoker::new(Ok(ResponseCommand::status("Destroyed")))
            .then(Ok(ResponseCommand::ok("blade-1")))
            .then(Ok(ResponseCommand::status("Running")))
            .shared();
        harness.register_kube(invoker.clone());

        let experiment_id = harness.new_experiment().await;
        seed_attempt(&harness, experiment_id, "chaosblade.pod.delete", "", true, "blade-1").await;
        let spec = harness
            .stage(experiment_id, Phase::Recover, "chaosblade.pod.delete.stop", ExperimentDimension::Pod, vec![])
            .await;
        harness.set_experiment_status(experiment_id, RunStatus::Stopping).await;
        let task = Arc::new(ActivityTask::new(spec));

        assert!(DestroyPhaseHandler.pre_handle(&task, &harness.ctx).await.unwrap());
        DestroyPhaseHandler.handle(&task, &harness.ctx);
        assert_eq!(task.wait().await, Ok(()));

        let requests = invoker.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].phase, Phase::Recover);
        assert_eq!(requests[0].name.as_deref(), Some("blade-1"));
        assert!(requests[0].host.is_none());
        assert!(requests[1..].iter().all(|r| r.phase == Phase::Status));
    }

    #[tokio::test]
    async fn test_nothing_to_recover_still_completes() {
        let harness = TestHarness::new();
        let experiment_id = harness.new_experiment().await;
        let spec = harness
            .stage(experiment_id, Phase::Recover, "chaosblade.mem.load.stop", ExperimentDimension::Host, vec![])
            .await;
        harness.set_experiment_status(experiment_id, RunStatus::Stopping).await;
        let task = Arc::new(ActivityTask::new(spec));
        assert!(DestroyPhaseHandler.pre_handle(&task, &harness.ctx).await.unwrap());
        DestroyPhaseHandler.handle(&task, &harness.ctx);
        assert_eq!(task.wait().await, Ok(()));
        assert_eq!(
            harness.activity(task.activity_task_id()).await.run_status,
            RunStatus::Finished
        );
    }
}
