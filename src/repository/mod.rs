//! Persistence of experiment tasks, activity tasks and per-device records.
//!
//! The engine only sees the three traits below. `InMemoryRepository` backs
//! tests and database-less runs; `SqliteRepository` persists to a file.

mod memory;
mod sqlite;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::model::{
    ActivityTaskRecord, ActivityTaskUpdate, ExperimentActivityTask, ExperimentTask,
    ExperimentTaskUpdate, RecordUpdate,
};

pub use memory::InMemoryRepository;
pub use sqlite::{DbHandle, SqliteRepository};

#[async_trait]
pub trait ExperimentTaskRepository: Send + Sync {
    async fn select_by_id(&self, id: i64) -> Result<Option<ExperimentTask>>;

    /// Insert and return the assigned id.
    async fn insert(&self, task: ExperimentTask) -> Result<i64>;

    async fn update_by_primary_key(&self, id: i64, update: ExperimentTaskUpdate) -> Result<()>;
}

#[async_trait]
pub trait ActivityTaskRepository: Send + Sync {
    async fn select_by_id(&self, id: i64) -> Result<Option<ExperimentActivityTask>>;

    async fn insert(&self, task: ExperimentActivityTask) -> Result<i64>;

    async fn update_by_primary_key(&self, id: i64, update: ActivityTaskUpdate) -> Result<()>;
}

#[async_trait]
pub trait ActivityTaskRecordRepository: Send + Sync {
    async fn insert(&self, record: ActivityTaskRecord) -> Result<i64>;

    async fn update_by_primary_key(&self, id: i64, update: RecordUpdate) -> Result<()>;

    async fn select_by_experiment_task_id(
        &self,
        experiment_task_id: i64,
    ) -> Result<Vec<ActivityTaskRecord>>;

    /// Records of one experiment whose scene code equals `scene_code` exactly,
    /// in insertion order.
    async fn select_by_scene_code(
        &self,
        experiment_task_id: i64,
        scene_code: &str,
    ) -> Result<Vec<ActivityTaskRecord>>;
}

/// The repository services injected into the engine.
#[derive(Clone)]
pub struct Repositories {
    pub experiments: Arc<dyn ExperimentTaskRepository>,
    pub activities: Arc<dyn ActivityTaskRepository>,
    pub records: Arc<dyn ActivityTaskRecordRepository>,
}

impl Repositories {
    /// Use one store for all three tables.
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: ExperimentTaskRepository
            + ActivityTaskRepository
            + ActivityTaskRecordRepository
            + 'static,
    {
        Self {
            experiments: store.clone(),
            activities: store.clone(),
            records: store,
        }
    }

    pub fn in_memory() -> Self {
        Self::from_store(Arc::new(InMemoryRepository::new()))
    }
}
