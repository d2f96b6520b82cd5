use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use async_trait::async_trait;

use super::{ActivityTaskRecordRepository, ActivityTaskRepository, ExperimentTaskRepository};
use crate::model::{
    ActivityTaskRecord, ActivityTaskUpdate, ExperimentActivityTask, ExperimentTask,
    ExperimentTaskUpdate, RecordUpdate,
};

#[derive(Default)]
struct Tables {
    next_id: i64,
    experiments: BTreeMap<i64, ExperimentTask>,
    activities: BTreeMap<i64, ExperimentActivityTask>,
    records: BTreeMap<i64, ActivityTaskRecord>,
}

impl Tables {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Process-local store. Ids are shared across tables and strictly increasing,
/// so iteration order is insertion order.
#[derive(Default)]
pub struct InMemoryRepository {
    tables: Mutex<Tables>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_tables<R>(&self, f: impl FnOnce(&mut Tables) -> Result<R>) -> Result<R> {
        let mut tables = self
            .tables
            .lock()
            .map_err(|e| anyhow!("Repository lock poisoned: {}", e))?;
        f(&mut tables)
    }
}

#[async_trait]
impl ExperimentTaskRepository for InMemoryRepository {
    async fn select_by_id(&self, id: i64) -> Result<Option<ExperimentTask>> {
        self.with_tables(|t| Ok(t.experiments.get(&id).cloned()))
    }

    async fn insert(&self, mut task: ExperimentTask) -> Result<i64> {
        self.with_tables(|t| {
            let id = t.allocate_id();
            task.id = id;
            t.experiments.insert(id, task);
            Ok(id)
        })
    }

    async fn update_by_primary_key(&self, id: i64, update: ExperimentTaskUpdate) -> Result<()> {
        self.with_tables(|t| {
            let task = t
                .experiments
                .get_mut(&id)
                .ok_or_else(|| anyhow!("Experiment task {} not found", id))?;
            if let Some(status) = update.run_status {
                task.run_status = status;
            }
            if let Some(result) = update.result_status {
                task.result_status = Some(result);
            }
            if let Some(activity_id) = update.activity_id {
                task.activity_id = Some(activity_id);
            }
            if let Some(activity_task_id) = update.activity_task_id {
                task.activity_task_id = Some(activity_task_id);
            }
            if let Some(start) = update.gmt_start {
                task.gmt_start = Some(start);
            }
            if let Some(end) = update.gmt_end {
                task.gmt_end = Some(end);
            }
            Ok(())
        })
    }
}

#[async_trait]
impl ActivityTaskRepository for InMemoryRepository {
    async fn select_by_id(&self, id: i64) -> Result<Option<ExperimentActivityTask>> {
        self.with_tables(|t| Ok(t.activities.get(&id).cloned()))
    }

    async fn insert(&self, mut task: ExperimentActivityTask) -> Result<i64> {
        self.with_tables(|t| {
            let id = t.allocate_id();
            task.id = id;
            t.activities.insert(id, task);
            Ok(id)
        })
    }

    async fn update_by_primary_key(&self, id: i64, update: ActivityTaskUpdate) -> Result<()> {
        self.with_tables(|t| {
            let task = t
                .activities
                .get_mut(&id)
                .ok_or_else(|| anyhow!("Activity task {} not found", id))?;
            if let Some(phase) = update.phase {
                task.phase = phase;
            }
            if let Some(status) = update.run_status {
                task.run_status = status;
            }
            if let Some(result) = update.result_status {
                task.result_status = Some(result);
            }
            if let Some(message) = update.error_message {
                task.error_message = Some(message);
            }
            if let Some(start) = update.gmt_start {
                task.gmt_start = Some(start);
            }
            if let Some(end) = update.gmt_end {
                task.gmt_end = Some(end);
            }
            Ok(())
        })
    }
}

#[async_trait]
impl ActivityTaskRecordRepository for InMemoryRepository {
    async fn insert(&self, mut record: ActivityTaskRecord) -> Result<i64> {
        self.with_tables(|t| {
            let id = t.allocate_id();
            record.id = id;
            t.records.insert(id, record);
            Ok(id)
        })
    }

    async fn update_by_primary_key(&self, id: i64, update: RecordUpdate) -> Result<()> {
        self.with_tables(|t| {
            let record = t
                .records
                .get_mut(&id)
                .ok_or_else(|| anyhow!("Activity task record {} not found", id))?;
            if let Some(end) = update.gmt_end {
                record.gmt_end = Some(end);
            }
            if let Some(success) = update.success {
                record.success = Some(success);
            }
            if let Some(code) = update.code {
                record.code = Some(code);
            }
            if let Some(result) = update.result {
                record.result = Some(result);
            }
            if let Some(message) = update.error_message {
                record.error_message = Some(message);
            }
            Ok(())
        })
    }

    async fn select_by_experiment_task_id(
        &self,
        experiment_task_id: i64,
    ) -> Result<Vec<ActivityTaskRecord>> {
        self.with_tables(|t| {
            Ok(t.records
                .values()
                .filter(|r| r.experiment_task_id == experiment_task_id)
                .cloned()
                .collect())
        })
    }

    async fn select_by_scene_code(
        &self,
        experiment_task_id: i64,
        scene_code: &str,
    ) -> Result<Vec<ActivityTaskRecord>> {
        self.with_tables(|t| {
            Ok(t.records
                .values()
                .filter(|r| r.experiment_task_id == experiment_task_id && r.scene_code == scene_code)
                .cloned()
                .collect())
        })
    }
}
