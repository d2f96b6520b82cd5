//! The activity task: one phase of one experiment run.
//!
//! Lifecycle: `pre_handle` checks eligibility and marks the task RUNNING,
//! `handle` dispatches exactly once (per-device fan-out for HOST/APPLICATION,
//! a single resource request followed by status reconciliation for
//! NODE/POD/CONTAINER), `post_handle` writes the terminal state and resolves
//! the completion signal, optionally after `wait_of_after`.

mod completion;
mod reconcile;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::errors::EngineError;
use crate::invoker::{NAMES_ARGUMENT, RemoteInvoker, RequestCommand};
use crate::model::{
    ActivityTaskRecord, ActivityTaskSpec, ActivityTaskUpdate, ExperimentTaskUpdate, Phase,
    RecordUpdate, ResultStatus, RunStatus,
};
use crate::pipeline::ExecutionContext;
use crate::scene::SceneCode;

pub use completion::{Completion, Outcome};
pub use reconcile::{StatusProbe, acceptance_phase, reconcile};

/// Identity of a task, carried into spawned work for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskKey {
    pub experiment_task_id: i64,
    pub activity_task_id: i64,
    pub phase: Phase,
}

/// A request bound to the record that tracks it.
#[derive(Debug, Clone)]
pub struct PendingCall {
    pub record_id: i64,
    /// Device label for logs, `hostname-ip`.
    pub label: String,
    pub request: RequestCommand,
}

pub struct ActivityTask {
    spec: ActivityTaskSpec,
    dispatched: AtomicBool,
    completion: Completion,
}

impl ActivityTask {
    pub fn new(spec: ActivityTaskSpec) -> Self {
        Self {
            spec,
            dispatched: AtomicBool::new(false),
            completion: Completion::new(),
        }
    }

    pub fn spec(&self) -> &ActivityTaskSpec {
        &self.spec
    }

    pub fn key(&self) -> TaskKey {
        TaskKey {
            experiment_task_id: self.spec.experiment_task_id,
            activity_task_id: self.spec.activity_task_id,
            phase: self.spec.phase,
        }
    }

    pub fn experiment_task_id(&self) -> i64 {
        self.spec.experiment_task_id
    }

    pub fn activity_task_id(&self) -> i64 {
        self.spec.activity_task_id
    }

    pub fn phase(&self) -> Phase {
        self.spec.phase
    }

    pub fn scene_code(&self) -> &str {
        &self.spec.scene_code
    }

    pub fn completion(&self) -> &Completion {
        &self.completion
    }

    /// Wait until the task signals completion.
    pub async fn wait(&self) -> Outcome {
        self.completion.wait().await
    }

    /// Close the dispatch gate. Only the first caller gets `true`.
    pub fn try_begin_dispatch(&self) -> bool {
        self.dispatched
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_dispatched(&self) -> bool {
        self.dispatched.load(Ordering::Acquire)
    }

    /// Resolve the completion without dispatching; used for ineligible tasks.
    pub fn skip(&self) {
        self.completion.complete(Ok(()));
    }

    /// Eligible iff the experiment is READY or RUNNING and this task is READY.
    /// On eligibility the task is moved to RUNNING.
    pub async fn pre_handle(&self, ctx: &ExecutionContext) -> Result<bool, EngineError> {
        let repos = ctx.repositories();
        let experiment = repos
            .experiments
            .select_by_id(self.spec.experiment_task_id)
            .await?
            .ok_or(EngineError::ExperimentTaskNotFound {
                id: self.spec.experiment_task_id,
            })?;
        info!(
            experiment_task_id = experiment.id,
            run_status = experiment.run_status.as_str(),
            "Checking experiment status"
        );
        if !matches!(experiment.run_status, RunStatus::Ready | RunStatus::Running) {
            warn!(
                experiment_task_id = experiment.id,
                phase = %self.spec.phase,
                run_status = experiment.run_status.as_str(),
                "Experiment is not runnable, skipping phase"
            );
            return Ok(false);
        }
        if !self.check_ready(ctx).await? {
            return Ok(false);
        }
        self.mark_running(ctx).await?;
        Ok(true)
    }

    /// True iff this task's own row is still READY.
    pub async fn check_ready(&self, ctx: &ExecutionContext) -> Result<bool, EngineError> {
        let activity = ctx
            .repositories()
            .activities
            .select_by_id(self.spec.activity_task_id)
            .await?
            .ok_or(EngineError::ActivityTaskNotFound {
                id: self.spec.activity_task_id,
            })?;
        if activity.run_status != RunStatus::Ready {
            warn!(
                experiment_task_id = self.spec.experiment_task_id,
                activity_task_id = self.spec.activity_task_id,
                phase = %self.spec.phase,
                run_status = activity.run_status.as_str(),
                "Activity task is not runnable, skipping phase"
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// Move this task to RUNNING and point the experiment at it.
    pub async fn mark_running(&self, ctx: &ExecutionContext) -> Result<(), EngineError> {
        let repos = ctx.repositories();
        info!(
            experiment_task_id = self.spec.experiment_task_id,
            activity_task_id = self.spec.activity_task_id,
            phase = %self.spec.phase,
            "Starting phase"
        );
        repos
            .activities
            .update_by_primary_key(
                self.spec.activity_task_id,
                ActivityTaskUpdate {
                    phase: Some(self.spec.phase),
                    run_status: Some(RunStatus::Running),
                    gmt_start: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        repos
            .experiments
            .update_by_primary_key(
                self.spec.experiment_task_id,
                ExperimentTaskUpdate {
                    activity_id: Some(self.spec.activity_id),
                    activity_task_id: Some(self.spec.activity_task_id),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Dispatch on the shared scheduler. Re-entrant calls are no-ops.
    pub fn handle(self: &Arc<Self>, ctx: &ExecutionContext) {
        if !self.try_begin_dispatch() {
            debug!(
                activity_task_id = self.spec.activity_task_id,
                "Phase already dispatched"
            );
            return;
        }
        let task = self.clone();
        let context = ctx.clone();
        ctx.spawn(async move {
            let result = task.dispatch(&context).await;
            task.post_handle(&context, result.err()).await;
        });
    }

    async fn dispatch(&self, ctx: &ExecutionContext) -> Result<(), EngineError> {
        if self.spec.experiment_dimension.is_per_device() {
            self.fan_out(ctx).await
        } else {
            self.dispatch_and_reconcile(ctx).await
        }
    }

    /// One record and one call per device, joined once all have settled.
    async fn fan_out(&self, ctx: &ExecutionContext) -> Result<(), EngineError> {
        let records = &ctx.repositories().records;

        let mut inserted = Vec::with_capacity(self.spec.device_metas.len());
        for device in &self.spec.device_metas {
            let record = ActivityTaskRecord::started(&self.spec).for_device(device);
            inserted.push((records.insert(record).await?, device));
        }

        let mut pending = Vec::with_capacity(inserted.len());
        for (record_id, device) in inserted {
            match ctx.requests().device_request(&self.spec, device) {
                Some(request) => pending.push(PendingCall {
                    record_id,
                    label: device.label(),
                    request,
                }),
                None => {
                    records
                        .update_by_primary_key(record_id, RecordUpdate::no_op())
                        .await?;
                    info!(
                        experiment_task_id = self.spec.experiment_task_id,
                        phase = %self.spec.phase,
                        device = %device.label(),
                        "Nothing to dispatch for device"
                    );
                }
            }
        }
        self.dispatch_all(ctx, pending, false).await
    }

    /// A single resource request, then status polling until the resource
    /// reaches the phase's terminal state.
    async fn dispatch_and_reconcile(&self, ctx: &ExecutionContext) -> Result<(), EngineError> {
        let names = self.spec.arguments.get(NAMES_ARGUMENT).cloned();
        let mut record = ActivityTaskRecord::started(&self.spec);
        record.hostname = names.clone();
        let record_id = ctx.repositories().records.insert(record).await?;

        let call = PendingCall {
            record_id,
            label: names.unwrap_or_default(),
            request: ctx.requests().resource_request(&self.spec),
        };
        self.dispatch_all(ctx, vec![call], true).await
    }

    /// Resolve an invoker for every call, run them all on the shared scheduler
    /// and wait for every one to settle. The first failure is returned only
    /// after the slowest sibling has finished.
    ///
    /// A call that cannot be routed is a configuration error: it and every
    /// call not yet launched are marked failed and nothing more is dispatched.
    pub async fn dispatch_all(
        &self,
        ctx: &ExecutionContext,
        pending: Vec<PendingCall>,
        reconcile_after: bool,
    ) -> Result<(), EngineError> {
        let records = &ctx.repositories().records;
        let key = self.key();

        let mut handles = Vec::with_capacity(pending.len());
        let mut config_error: Option<EngineError> = None;
        for call in pending {
            if let Some(err) = &config_error {
                records
                    .update_by_primary_key(call.record_id, RecordUpdate::failed(err.to_string()))
                    .await?;
                continue;
            }
            let invoker = match resolve(ctx, &call.request) {
                Ok(invoker) => invoker,
                Err(err) => {
                    error!(
                        experiment_task_id = key.experiment_task_id,
                        phase = %key.phase,
                        device = %call.label,
                        error = %err,
                        "Cannot route request"
                    );
                    records
                        .update_by_primary_key(call.record_id, RecordUpdate::failed(err.to_string()))
                        .await?;
                    config_error = Some(err);
                    continue;
                }
            };
            handles.push(ctx.spawn(settle(ctx.clone(), key, invoker, call, reconcile_after)));
        }

        let mut first_failure = None;
        for joined in join_all(handles).await {
            let outcome = joined
                .unwrap_or_else(|e| Err(EngineError::Invocation(format!("device call aborted: {}", e))));
            if let Err(err) = outcome {
                first_failure.get_or_insert(err);
            }
        }
        match config_error.or(first_failure) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Write the terminal state, then resolve the completion signal, after
    /// `wait_of_after` when set.
    pub async fn post_handle(self: &Arc<Self>, ctx: &ExecutionContext, error: Option<EngineError>) {
        let key = self.key();
        let written = self.finish(ctx, error.as_ref()).await;
        if let Err(err) = &written {
            error!(
                experiment_task_id = key.experiment_task_id,
                activity_task_id = key.activity_task_id,
                error = %err,
                "Failed to record phase result"
            );
        }

        let outcome = match error.or(written.err()) {
            None => {
                info!(
                    experiment_task_id = key.experiment_task_id,
                    activity_task_id = key.activity_task_id,
                    phase = %key.phase,
                    "Phase finished"
                );
                Ok(())
            }
            Some(err) => {
                error!(
                    experiment_task_id = key.experiment_task_id,
                    activity_task_id = key.activity_task_id,
                    phase = %key.phase,
                    error = %err,
                    "Phase failed"
                );
                Err(err)
            }
        };

        match self.spec.wait_of_after() {
            Some(delay) => {
                info!(
                    experiment_task_id = key.experiment_task_id,
                    activity_task_id = key.activity_task_id,
                    wait_ms = delay.as_millis() as u64,
                    "Holding completion"
                );
                let task = self.clone();
                ctx.timer().after(delay, async move {
                    task.completion.complete(outcome);
                });
            }
            None => {
                self.completion.complete(outcome);
            }
        }
    }

    /// Persist FINISHED with the experiment-level result: SUCCESS iff any
    /// ATTACK record of the experiment succeeded.
    async fn finish(
        &self,
        ctx: &ExecutionContext,
        error: Option<&EngineError>,
    ) -> Result<(), EngineError> {
        let repos = ctx.repositories();
        let records = repos
            .records
            .select_by_experiment_task_id(self.spec.experiment_task_id)
            .await?;
        let attacks = records
            .iter()
            .filter(|r| r.phase == Some(Phase::Attack) && r.is_successful())
            .count();
        repos
            .activities
            .update_by_primary_key(
                self.spec.activity_task_id,
                ActivityTaskUpdate {
                    run_status: Some(RunStatus::Finished),
                    result_status: Some(ResultStatus::from_attack_successes(attacks)),
                    error_message: error.map(ToString::to_string),
                    gmt_end: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }
}

fn resolve(
    ctx: &ExecutionContext,
    request: &RequestCommand,
) -> Result<Arc<dyn RemoteInvoker>, EngineError> {
    let scene = SceneCode::parse(&request.scene_code)?;
    ctx.invokers()
        .resolve(scene.original(), &request.scope, request.phase)
}

/// Run one call, write its record exactly once, and reconcile the named
/// resource when asked to.
async fn settle(
    ctx: ExecutionContext,
    key: TaskKey,
    invoker: Arc<dyn RemoteInvoker>,
    call: PendingCall,
    reconcile_after: bool,
) -> Result<(), EngineError> {
    let records = &ctx.repositories().records;
    let probe_scope = call.request.scope.clone();
    let probe_scene = call.request.scene_code.clone();
    let requested_name = call.request.name.clone();

    let response = match invoker.invoke(call.request).await {
        Ok(response) => response,
        Err(err) => {
            records
                .update_by_primary_key(call.record_id, RecordUpdate::failed(err.to_string()))
                .await?;
            warn!(
                experiment_task_id = key.experiment_task_id,
                phase = %key.phase,
                device = %call.label,
                success = false,
                error = %err,
                "Device call failed"
            );
            return Err(err);
        }
    };

    records
        .update_by_primary_key(
            call.record_id,
            RecordUpdate {
                gmt_end: Some(Utc::now()),
                success: Some(response.success),
                code: response.code,
                result: response.result.clone(),
                error_message: response.error.clone(),
            },
        )
        .await?;
    info!(
        experiment_task_id = key.experiment_task_id,
        activity_task_id = key.activity_task_id,
        phase = %key.phase,
        device = %call.label,
        success = response.success,
        error = response.error.as_deref().unwrap_or_default(),
        "Device call finished"
    );

    if let Some(err) = response.business_error() {
        return Err(err);
    }
    if !reconcile_after {
        return Ok(());
    }
    match response.result.or(requested_name) {
        Some(name) => {
            let probe = StatusProbe {
                key,
                scope: probe_scope,
                scene_code: probe_scene,
                name,
            };
            reconcile(&ctx, &probe).await
        }
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::ResponseCommand;
    use crate::model::{DeviceMeta, DeviceType, ExperimentDimension};
    use crate::testing::{RecordOp, ScriptedInvoker, TestHarness};
    use std::time::Duration;

    fn host(n: u8) -> DeviceMeta {
        DeviceMeta {
            device_id: format!("d-{}", n),
            ip: format!("10.0.0.{}", n),
            hostname: format!("host-{}", n),
            device_type: DeviceType::Host,
        }
    }

    #[tokio::test]
    async fn test_handle_is_exactly_once() {
        let harness = TestHarness::new();
        let invoker = ScriptedInvoker::always_ok("uid");
        harness.register_host(invoker.clone());
        let spec = harness
            .spec(Phase::Attack, "chaosblade.cpu.fullload", ExperimentDimension::Host, vec![host(1)])
            .await;
        let task = Arc::new(ActivityTask::new(spec));

        assert!(task.pre_handle(&harness.ctx).await.unwrap());
        for _ in 0..5 {
            task.handle(&harness.ctx);
        }
        assert_eq!(task.wait().await, Ok(()));
        assert_eq!(invoker.calls(), 1);
        assert!(task.is_dispatched());
        assert!(!task.try_begin_dispatch());
    }

    #[tokio::test]
    async fn test_pre_handle_requires_ready_task() {
        let harness = TestHarness::new();
        let spec = harness
            .spec(Phase::Attack, "chaosblade.cpu.fullload", ExperimentDimension::Host, vec![])
            .await;
        let task = ActivityTask::new(spec);

        assert!(task.pre_handle(&harness.ctx).await.unwrap());
        let row = harness.activity(task.activity_task_id()).await;
        assert_eq!(row.run_status, RunStatus::Running);
        assert!(row.gmt_start.is_some());
        let experiment = harness.experiment(task.experiment_task_id()).await;
        assert_eq!(experiment.activity_task_id, Some(task.activity_task_id()));

        // Second check sees RUNNING and declines.
        assert!(!task.pre_handle(&harness.ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_pre_handle_declines_stopping_experiment() {
        let harness = TestHarness::new();
        let spec = harness
            .spec(Phase::Attack, "chaosblade.cpu.fullload", ExperimentDimension::Host, vec![])
            .await;
        harness.set_experiment_status(spec.experiment_task_id, RunStatus::Stopping).await;
        let task = ActivityTask::new(spec);
        assert!(!task.pre_handle(&harness.ctx).await.unwrap());
        let row = harness.activity(task.activity_task_id()).await;
        assert_eq!(row.run_status, RunStatus::Ready);
    }

    #[tokio::test]
    async fn test_pre_handle_missing_experiment() {
        let harness = TestHarness::new();
        let mut spec = harness
            .spec(Phase::Attack, "chaosblade.cpu.fullload", ExperimentDimension::Host, vec![])
            .await;
        spec.experiment_task_id = 9999;
        let err = ActivityTask::new(spec).pre_handle(&harness.ctx).await.unwrap_err();
        assert_eq!(err, EngineError::ExperimentTaskNotFound { id: 9999 });
    }

    #[tokio::test]
    async fn test_no_op_device_succeeds_without_remote_call() {
        let harness = TestHarness::new();
        let invoker = ScriptedInvoker::always_ok("uid");
        harness.register_host(invoker.clone());
        let spec = harness
            .spec(Phase::Prepare, "chaosblade.cpu.fullload", ExperimentDimension::Host, vec![host(1)])
            .await;
        let task = Arc::new(ActivityTask::new(spec));
        task.pre_handle(&harness.ctx).await.unwrap();
        task.handle(&harness.ctx);

        assert_eq!(task.wait().await, Ok(()));
        assert_eq!(invoker.calls(), 0);
        let records = harness.records(task.experiment_task_id()).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].success, Some(true));
        assert!(records[0].gmt_end.is_some());
    }

    #[tokio::test]
    async fn test_unroutable_request_fails_all_records() {
        let harness = TestHarness::new();
        let spec = harness
            .spec(
                Phase::Attack,
                "chaosblade.cpu.fullload",
                ExperimentDimension::Host,
                vec![host(1), host(2)],
            )
            .await;
        let task = Arc::new(ActivityTask::new(spec));
        task.pre_handle(&harness.ctx).await.unwrap();
        task.handle(&harness.ctx);

        let err = task.wait().await.unwrap_err();
        assert!(err.is_configuration());
        let records = harness.records(task.experiment_task_id()).await;
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.success == Some(false)));

        let row = harness.activity(task.activity_task_id()).await;
        assert_eq!(row.run_status, RunStatus::Finished);
        assert_eq!(row.result_status, Some(ResultStatus::Failed));
        assert!(row.error_message.unwrap().contains("No invoker registered"));
    }

    #[tokio::test]
    async fn test_post_handle_counts_attack_successes() {
        let harness = TestHarness::new();
        harness.register_host(ScriptedInvoker::always_ok("uid"));
        let spec = harness
            .spec(Phase::Attack, "chaosblade.cpu.fullload", ExperimentDimension::Host, vec![host(1)])
            .await;
        let task = Arc::new(ActivityTask::new(spec));
        task.pre_handle(&harness.ctx).await.unwrap();
        task.handle(&harness.ctx);
        task.wait().await.unwrap();

        let row = harness.activity(task.activity_task_id()).await;
        assert_eq!(row.run_status, RunStatus::Finished);
        assert_eq!(row.result_status, Some(ResultStatus::Success));
        assert!(row.error_message.is_none());
        assert!(row.gmt_end.is_some());
    }

    #[tokio::test]
    async fn test_all_records_inserted_before_any_update() {
        let harness = TestHarness::new();
        harness.register_host(ScriptedInvoker::always_ok("uid"));
        let devices = (1..=3).map(host).collect();
        let spec = harness
            .spec(Phase::Attack, "chaosblade.cpu.fullload", ExperimentDimension::Host, devices)
            .await;
        let task = Arc::new(ActivityTask::new(spec));
        task.pre_handle(&harness.ctx).await.unwrap();
        task.handle(&harness.ctx);
        task.wait().await.unwrap();

        let ops = harness.record_ops();
        assert_eq!(ops.len(), 6);
        assert!(ops[..3].iter().all(|op| matches!(op, RecordOp::Insert(_))));
        assert!(ops[3..].iter().all(|op| matches!(op, RecordOp::Update(_))));

        let records = harness.records(task.experiment_task_id()).await;
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.success == Some(true) && r.gmt_end.is_some()));
        assert!(records.iter().all(|r| r.result.as_deref() == Some("uid")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_waits_for_slower_sibling() {
        let harness = TestHarness::new();
        let invoker = ScriptedInvoker::new(Ok(ResponseCommand::ok("uid")))
            .for_host(
                "10.0.0.1",
                Duration::ZERO,
                Ok(ResponseCommand::failed("permission denied")),
            )
            .for_host("10.0.0.2", Duration::from_secs(5), Ok(ResponseCommand::ok("uid-2")))
            .shared();
        harness.register_host(invoker.clone());
        let spec = harness
            .spec(
                Phase::Attack,
                "chaosblade.cpu.fullload",
                ExperimentDimension::Host,
                vec![host(1), host(2)],
            )
            .await;
        let task = Arc::new(ActivityTask::new(spec));
        task.pre_handle(&harness.ctx).await.unwrap();

        let start = tokio::time::Instant::now();
        task.handle(&harness.ctx);
        let outcome = task.wait().await;
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert_eq!(outcome, Err(EngineError::Business("permission denied".into())));

        let records = harness.records(task.experiment_task_id()).await;
        let slow = records.iter().find(|r| r.ip.as_deref() == Some("10.0.0.2")).unwrap();
        assert_eq!(slow.success, Some(true));
        assert_eq!(slow.result.as_deref(), Some("uid-2"));
        let failed = records.iter().find(|r| r.ip.as_deref() == Some("10.0.0.1")).unwrap();
        assert_eq!(failed.success, Some(false));
        assert_eq!(failed.error_message.as_deref(), Some("permission denied"));

        // One attack landed, so the experiment-level result is still a success.
        let row = harness.activity(task.activity_task_id()).await;
        assert_eq!(row.result_status, Some(ResultStatus::Success));
        assert_eq!(row.error_message.as_deref(), Some("permission denied"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pod_attack_reconciles_until_running() {
        let harness = TestHarness::new();
        let invoker = ScriptedInvoker::new(Ok(ResponseCommand::status("Running")))
            .then(Ok(ResponseCommand::ok("blade-7")))
            .then(Ok(ResponseCommand::status("Pending")))
            .then(Ok(ResponseCommand::status("Pending")))
            .then(Ok(ResponseCommand::status("Pending")))
            .shared();
        harness.register_kube(invoker.clone());
        let mut spec = harness
            .spec(Phase::Attack, "chaosblade.pod.delete", ExperimentDimension::Pod, vec![])
            .await;
        spec.arguments.insert("names".into(), "web-0,web-1".into());
        let task = Arc::new(ActivityTask::new(spec));
        task.pre_handle(&harness.ctx).await.unwrap();

        let start = tokio::time::Instant::now();
        task.handle(&harness.ctx);
        assert_eq!(task.wait().await, Ok(()));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(12_000));
        assert!(elapsed < Duration::from_millis(15_000));

        let requests = invoker.requests();
        assert_eq!(requests.len(), 5);
        assert_eq!(requests[0].phase, Phase::Attack);
        assert_eq!(requests[0].scope, "pod");
        assert!(requests[1..].iter().all(|r| r.phase == Phase::Status));
        assert!(requests[1..].iter().all(|r| r.name.as_deref() == Some("blade-7")));

        let records = harness.records(task.experiment_task_id()).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].hostname.as_deref(), Some("web-0,web-1"));
        assert_eq!(records[0].result.as_deref(), Some("blade-7"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pod_attack_failure_skips_reconcile() {
        let harness = TestHarness::new();
        let invoker = ScriptedInvoker::new(Ok(ResponseCommand::failed("forbidden"))).shared();
        harness.register_kube(invoker.clone());
        let spec = harness
            .spec(Phase::Attack, "chaosblade.pod.delete", ExperimentDimension::Pod, vec![])
            .await;
        let task = Arc::new(ActivityTask::new(spec));
        task.pre_handle(&harness.ctx).await.unwrap();
        task.handle(&harness.ctx);
        assert_eq!(task.wait().await, Err(EngineError::Business("forbidden".into())));
        assert_eq!(invoker.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_of_after_delays_success() {
        let harness = TestHarness::new();
        harness.register_host(ScriptedInvoker::always_ok("uid"));
        let mut spec = harness
            .spec(Phase::Attack, "chaosblade.cpu.fullload", ExperimentDimension::Host, vec![host(1)])
            .await;
        spec.wait_of_after_ms = Some(500);
        let task = Arc::new(ActivityTask::new(spec));
        task.pre_handle(&harness.ctx).await.unwrap();

        let start = tokio::time::Instant::now();
        task.handle(&harness.ctx);
        tokio::time::sleep(Duration::from_millis(100)).await;
        // The row is already FINISHED while the signal is still held.
        let row = harness.activity(task.activity_task_id()).await;
        assert_eq!(row.run_status, RunStatus::Finished);
        assert!(!task.completion().is_complete());

        assert_eq!(task.wait().await, Ok(()));
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_of_after_holds_failure() {
        let harness = TestHarness::new();
        harness.register_host(ScriptedInvoker::always_failed("disk busy"));
        let mut spec = harness
            .spec(Phase::Attack, "chaosblade.disk.burn", ExperimentDimension::Host, vec![host(1)])
            .await;
        spec.wait_of_after_ms = Some(1_000);
        let task = Arc::new(ActivityTask::new(spec));
        task.pre_handle(&harness.ctx).await.unwrap();

        let start = tokio::time::Instant::now();
        task.handle(&harness.ctx);
        let outcome = task.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(1_000));
        assert_eq!(outcome, Err(EngineError::Business("disk busy".into())));
    }
}
