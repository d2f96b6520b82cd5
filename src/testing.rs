//! Test doubles: a scripted invoker and an in-memory engine harness.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::errors::EngineError;
use crate::invoker::{
    AgentRequestFactory, CHAOSBLADE, InvokerPhases, InvokerStrategyRegistry, RemoteInvoker,
    RequestCommand, ResponseCommand,
};
use crate::model::{
    ActivityTaskRecord, ActivityTaskSpec, DeviceMeta, DeviceType, ExperimentActivityTask,
    ExperimentDimension, ExperimentTask, ExperimentTaskUpdate, Phase, RecordUpdate, RunStatus,
};
use crate::pipeline::{EngineServices, EngineSettings, ExecutionContext};
use crate::repository::{ActivityTaskRecordRepository, InMemoryRepository, Repositories};

type Scripted = Result<ResponseCommand, EngineError>;

/// Invoker answering from a script: per-host canned answers (with an
/// optional delay) first, then a queue, then a fallback.
pub struct ScriptedInvoker {
    fallback: Scripted,
    script: Mutex<VecDeque<Scripted>>,
    by_host: HashMap<String, (Duration, Scripted)>,
    requests: Mutex<Vec<RequestCommand>>,
}

impl ScriptedInvoker {
    pub fn new(fallback: Scripted) -> Self {
        Self {
            fallback,
            script: Mutex::new(VecDeque::new()),
            by_host: HashMap::new(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn always_ok(result: &str) -> Arc<Self> {
        Self::new(Ok(ResponseCommand::ok(result))).shared()
    }

    pub fn always_failed(error: &str) -> Arc<Self> {
        Self::new(Ok(ResponseCommand::failed(error))).shared()
    }

    /// Queue the next answer.
    pub fn then(self, response: Scripted) -> Self {
        self.script.lock().unwrap().push_back(response);
        self
    }

    pub fn for_host(mut self, host: &str, delay: Duration, response: Scripted) -> Self {
        self.by_host.insert(host.to_string(), (delay, response));
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<RequestCommand> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteInvoker for ScriptedInvoker {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, request: RequestCommand) -> Result<ResponseCommand, EngineError> {
        let host = request.host.clone();
        self.requests.lock().unwrap().push(request);

        if let Some((delay, response)) = host.and_then(|h| self.by_host.get(&h)) {
            tokio::time::sleep(*delay).await;
            return response.clone();
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOp {
    Insert(i64),
    Update(i64),
}

/// Record repository that logs the order of writes.
struct RecordingRecords {
    inner: Arc<InMemoryRepository>,
    ops: Arc<Mutex<Vec<RecordOp>>>,
}

#[async_trait]
impl ActivityTaskRecordRepository for RecordingRecords {
    async fn insert(&self, record: ActivityTaskRecord) -> Result<i64> {
        let id = ActivityTaskRecordRepository::insert(self.inner.as_ref(), record).await?;
        self.ops.lock().unwrap().push(RecordOp::Insert(id));
        Ok(id)
    }

    async fn update_by_primary_key(&self, id: i64, update: RecordUpdate) -> Result<()> {
        ActivityTaskRecordRepository::update_by_primary_key(self.inner.as_ref(), id, update)
            .await?;
        self.ops.lock().unwrap().push(RecordOp::Update(id));
        Ok(())
    }

    async fn select_by_experiment_task_id(
        &self,
        experiment_task_id: i64,
    ) -> Result<Vec<ActivityTaskRecord>> {
        self.inner.select_by_experiment_task_id(experiment_task_id).await
    }

    async fn select_by_scene_code(
        &self,
        experiment_task_id: i64,
        scene_code: &str,
    ) -> Result<Vec<ActivityTaskRecord>> {
        self.inner.select_by_scene_code(experiment_task_id, scene_code).await
    }
}

/// An engine wired to in-memory repositories and an empty registry.
pub struct TestHarness {
    pub ctx: ExecutionContext,
    registry: Arc<InvokerStrategyRegistry>,
    ops: Arc<Mutex<Vec<RecordOp>>>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::build(EngineSettings::default())
    }

    pub fn with_max_poll_attempts(max: u32) -> Self {
        Self::build(EngineSettings {
            max_poll_attempts: Some(max),
            ..Default::default()
        })
    }

    fn build(settings: EngineSettings) -> Self {
        let store = Arc::new(InMemoryRepository::new());
        let ops = Arc::new(Mutex::new(Vec::new()));
        let repositories = Repositories {
            experiments: store.clone(),
            activities: store.clone(),
            records: Arc::new(RecordingRecords {
                inner: store,
                ops: ops.clone(),
            }),
        };
        let registry = Arc::new(InvokerStrategyRegistry::new());
        let services = EngineServices {
            repositories,
            invokers: registry.clone(),
            requests: Arc::new(AgentRequestFactory::new(19527)),
            settings,
        };
        Self {
            ctx: ExecutionContext::current(services),
            registry,
            ops,
        }
    }

    pub fn repositories(&self) -> &Repositories {
        self.ctx.repositories()
    }

    pub fn register_host(&self, invoker: Arc<ScriptedInvoker>) {
        self.register_family(CHAOSBLADE, invoker);
    }

    pub fn register_family(&self, family: &str, invoker: Arc<ScriptedInvoker>) {
        self.registry
            .register(family, &[DeviceType::Host], InvokerPhases::All, invoker);
    }

    pub fn register_kube(&self, invoker: Arc<ScriptedInvoker>) {
        self.registry.register(
            CHAOSBLADE,
            &[DeviceType::Node, DeviceType::Pod, DeviceType::Container],
            InvokerPhases::All,
            invoker,
        );
    }

    pub async fn new_experiment(&self) -> i64 {
        self.repositories()
            .experiments
            .insert(ExperimentTask::new("test experiment"))
            .await
            .unwrap()
    }

    /// Insert a READY activity row for the experiment and return its spec.
    pub async fn stage(
        &self,
        experiment_task_id: i64,
        phase: Phase,
        scene_code: &str,
        dimension: ExperimentDimension,
        devices: Vec<DeviceMeta>,
    ) -> ActivityTaskSpec {
        let activity_task_id = self
            .repositories()
            .activities
            .insert(ExperimentActivityTask {
                id: 0,
                experiment_task_id,
                activity_id: 1,
                flow_id: 1,
                phase,
                scene_code: scene_code.to_string(),
                run_status: RunStatus::Ready,
                result_status: None,
                error_message: None,
                gmt_start: None,
                gmt_end: None,
            })
            .await
            .unwrap();
        ActivityTaskSpec {
            experiment_task_id,
            activity_task_id,
            activity_id: 1,
            flow_id: 1,
            phase,
            scene_code: scene_code.to_string(),
            experiment_dimension: dimension,
            device_metas: devices,
            arguments: Default::default(),
            wait_of_after_ms: None,
        }
    }

    /// A fresh experiment with a single stage.
    pub async fn spec(
        &self,
        phase: Phase,
        scene_code: &str,
        dimension: ExperimentDimension,
        devices: Vec<DeviceMeta>,
    ) -> ActivityTaskSpec {
        let experiment_task_id = self.new_experiment().await;
        self.stage(experiment_task_id, phase, scene_code, dimension, devices)
            .await
    }

    pub async fn experiment(&self, id: i64) -> ExperimentTask {
        self.repositories()
            .experiments
            .select_by_id(id)
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn activity(&self, id: i64) -> ExperimentActivityTask {
        self.repositories()
            .activities
            .select_by_id(id)
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn records(&self, experiment_task_id: i64) -> Vec<ActivityTaskRecord> {
        self.repositories()
            .records
            .select_by_experiment_task_id(experiment_task_id)
            .await
            .unwrap()
    }

    pub async fn set_experiment_status(&self, id: i64, run_status: RunStatus) {
        self.repositories()
            .experiments
            .update_by_primary_key(
                id,
                ExperimentTaskUpdate {
                    run_status: Some(run_status),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    /// Record writes in the order they happened.
    pub fn record_ops(&self) -> Vec<RecordOp> {
        self.ops.lock().unwrap().clone()
    }
}
