use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::{ActivityTaskRecordRepository, ActivityTaskRepository, ExperimentTaskRepository};
use crate::model::{
    ActivityTaskRecord, ActivityTaskUpdate, ExperimentActivityTask, ExperimentTask,
    ExperimentTaskUpdate, Phase, RecordUpdate, ResultStatus, RunStatus,
};

/// Async-safe handle to the SQLite store.
///
/// All access runs on tokio's blocking pool via `spawn_blocking`, so SQLite
/// I/O never ties up the async workers that drive dispatch.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<Connection>>,
}

impl DbHandle {
    fn new(conn: Connection) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(conn)),
        }
    }

    /// Run a closure with the connection on a blocking thread.
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct SqliteRepository {
    db: DbHandle,
}

impl SqliteRepository {
    /// Open (or create) a database file and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        run_migrations(&conn).context("Failed to run migrations")?;
        Ok(Self {
            db: DbHandle::new(conn),
        })
    }
}

fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS experiment_tasks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            run_status TEXT NOT NULL DEFAULT 'READY',
            result_status TEXT,
            activity_id INTEGER,
            activity_task_id INTEGER,
            gmt_start TEXT,
            gmt_end TEXT
        );

        CREATE TABLE IF NOT EXISTS activity_tasks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            experiment_task_id INTEGER NOT NULL REFERENCES experiment_tasks(id) ON DELETE CASCADE,
            activity_id INTEGER NOT NULL,
            flow_id INTEGER NOT NULL,
            phase TEXT NOT NULL,
            scene_code TEXT NOT NULL,
            run_status TEXT NOT NULL DEFAULT 'READY',
            result_status TEXT,
            error_message TEXT,
            gmt_start TEXT,
            gmt_end TEXT
        );

        CREATE TABLE IF NOT EXISTS activity_task_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            experiment_task_id INTEGER NOT NULL,
            activity_task_id INTEGER NOT NULL,
            flow_id INTEGER NOT NULL,
            device_id TEXT,
            ip TEXT,
            hostname TEXT,
            scene_code TEXT NOT NULL,
            phase TEXT,
            gmt_start TEXT,
            gmt_end TEXT,
            success INTEGER,
            code INTEGER,
            result TEXT,
            error_message TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_activity_tasks_experiment ON activity_tasks(experiment_task_id);
        CREATE INDEX IF NOT EXISTS idx_records_experiment ON activity_task_records(experiment_task_id);
        CREATE INDEX IF NOT EXISTS idx_records_scene ON activity_task_records(experiment_task_id, scene_code);
        ",
    )
    .context("Failed to create tables")?;
    Ok(())
}

fn to_text(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(|t| t.to_rfc3339())
}

fn parse_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|t| t.with_timezone(&Utc))
                .with_context(|| format!("Invalid timestamp '{}'", s))
        })
        .transpose()
}

fn parse_enum<T: FromStr<Err = String>>(value: Option<String>) -> Result<Option<T>> {
    value.map(|s| T::from_str(&s).map_err(|e| anyhow!(e))).transpose()
}

fn parse_required<T: FromStr<Err = String>>(value: String) -> Result<T> {
    T::from_str(&value).map_err(|e| anyhow!(e))
}

/// Raw column values, decoded outside the rusqlite row callback so parse
/// failures surface as `anyhow` errors.
struct ExperimentRow {
    id: i64,
    name: String,
    run_status: String,
    result_status: Option<String>,
    activity_id: Option<i64>,
    activity_task_id: Option<i64>,
    gmt_start: Option<String>,
    gmt_end: Option<String>,
}

impl ExperimentRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            run_status: row.get(2)?,
            result_status: row.get(3)?,
            activity_id: row.get(4)?,
            activity_task_id: row.get(5)?,
            gmt_start: row.get(6)?,
            gmt_end: row.get(7)?,
        })
    }

    fn decode(self) -> Result<ExperimentTask> {
        Ok(ExperimentTask {
            id: self.id,
            name: self.name,
            run_status: parse_required(self.run_status)?,
            result_status: parse_enum::<ResultStatus>(self.result_status)?,
            activity_id: self.activity_id,
            activity_task_id: self.activity_task_id,
            gmt_start: parse_ts(self.gmt_start)?,
            gmt_end: parse_ts(self.gmt_end)?,
        })
    }
}

struct ActivityRow {
    id: i64,
    experiment_task_id: i64,
    activity_id: i64,
    flow_id: i64,
    phase: String,
    scene_code: String,
    run_status: String,
    result_status: Option<String>,
    error_message: Option<String>,
    gmt_start: Option<String>,
    gmt_end: Option<String>,
}

impl ActivityRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            experiment_task_id: row.get(1)?,
            activity_id: row.get(2)?,
            flow_id: row.get(3)?,
            phase: row.get(4)?,
            scene_code: row.get(5)?,
            run_status: row.get(6)?,
            result_status: row.get(7)?,
            error_message: row.get(8)?,
            gmt_start: row.get(9)?,
            gmt_end: row.get(10)?,
        })
    }

    fn decode(self) -> Result<ExperimentActivityTask> {
        Ok(ExperimentActivityTask {
            id: self.id,
            experiment_task_id: self.experiment_task_id,
            activity_id: self.activity_id,
            flow_id: self.flow_id,
            phase: parse_required::<Phase>(self.phase)?,
            scene_code: self.scene_code,
            run_status: parse_required::<RunStatus>(self.run_status)?,
            result_status: parse_enum::<ResultStatus>(self.result_status)?,
            error_message: self.error_message,
            gmt_start: parse_ts(self.gmt_start)?,
            gmt_end: parse_ts(self.gmt_end)?,
        })
    }
}

struct RecordRow {
    record: ActivityTaskRecord,
    phase: Option<String>,
    gmt_start: Option<String>,
    gmt_end: Option<String>,
}

const RECORD_COLUMNS: &str = "id, experiment_task_id, activity_task_id, flow_id, device_id, ip, \
     hostname, scene_code, phase, gmt_start, gmt_end, success, code, result, error_message";

impl RecordRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            record: ActivityTaskRecord {
                id: row.get(0)?,
                experiment_task_id: row.get(1)?,
                activity_task_id: row.get(2)?,
                flow_id: row.get(3)?,
                device_id: row.get(4)?,
                ip: row.get(5)?,
                hostname: row.get(6)?,
                scene_code: row.get(7)?,
                success: row.get(11)?,
                code: row.get(12)?,
                result: row.get(13)?,
                error_message: row.get(14)?,
                ..Default::default()
            },
            phase: row.get(8)?,
            gmt_start: row.get(9)?,
            gmt_end: row.get(10)?,
        })
    }

    fn decode(self) -> Result<ActivityTaskRecord> {
        let mut record = self.record;
        record.phase = parse_enum::<Phase>(self.phase)?;
        record.gmt_start = parse_ts(self.gmt_start)?;
        record.gmt_end = parse_ts(self.gmt_end)?;
        Ok(record)
    }
}

#[async_trait]
impl ExperimentTaskRepository for SqliteRepository {
    async fn select_by_id(&self, id: i64) -> Result<Option<ExperimentTask>> {
        self.db
            .call(move |conn| {
                conn.query_row(
                    "SELECT id, name, run_status, result_status, activity_id, activity_task_id, \
                     gmt_start, gmt_end FROM experiment_tasks WHERE id = ?1",
                    params![id],
                    ExperimentRow::read,
                )
                .optional()
                .context("Failed to select experiment task")?
                .map(ExperimentRow::decode)
                .transpose()
            })
            .await
    }

    async fn insert(&self, task: ExperimentTask) -> Result<i64> {
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO experiment_tasks (name, run_status, result_status, activity_id, \
                     activity_task_id, gmt_start, gmt_end) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        task.name,
                        task.run_status.as_str(),
                        task.result_status.map(|s| s.as_str()),
                        task.activity_id,
                        task.activity_task_id,
                        to_text(task.gmt_start),
                        to_text(task.gmt_end),
                    ],
                )
                .context("Failed to insert experiment task")?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    async fn update_by_primary_key(&self, id: i64, update: ExperimentTaskUpdate) -> Result<()> {
        self.db
            .call(move |conn| {
                let changed = conn
                    .execute(
                        "UPDATE experiment_tasks SET \
                         run_status = COALESCE(?2, run_status), \
                         result_status = COALESCE(?3, result_status), \
                         activity_id = COALESCE(?4, activity_id), \
                         activity_task_id = COALESCE(?5, activity_task_id), \
                         gmt_start = COALESCE(?6, gmt_start), \
                         gmt_end = COALESCE(?7, gmt_end) \
                         WHERE id = ?1",
                        params![
                            id,
                            update.run_status.map(|s| s.as_str()),
                            update.result_status.map(|s| s.as_str()),
                            update.activity_id,
                            update.activity_task_id,
                            to_text(update.gmt_start),
                            to_text(update.gmt_end),
                        ],
                    )
                    .context("Failed to update experiment task")?;
                if changed == 0 {
                    anyhow::bail!("Experiment task {} not found", id);
                }
                Ok(())
            })
            .await
    }
}

#[async_trait]
impl ActivityTaskRepository for SqliteRepository {
    async fn select_by_id(&self, id: i64) -> Result<Option<ExperimentActivityTask>> {
        self.db
            .call(move |conn| {
                conn.query_row(
                    "SELECT id, experiment_task_id, activity_id, flow_id, phase, scene_code, \
                     run_status, result_status, error_message, gmt_start, gmt_end \
                     FROM activity_tasks WHERE id = ?1",
                    params![id],
                    ActivityRow::read,
                )
                .optional()
                .context("Failed to select activity task")?
                .map(ActivityRow::decode)
                .transpose()
            })
            .await
    }

    async fn insert(&self, task: ExperimentActivityTask) -> Result<i64> {
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO activity_tasks (experiment_task_id, activity_id, flow_id, phase, \
                     scene_code, run_status, result_status, error_message, gmt_start, gmt_end) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        task.experiment_task_id,
                        task.activity_id,
                        task.flow_id,
                        task.phase.as_str(),
                        task.scene_code,
                        task.run_status.as_str(),
                        task.result_status.map(|s| s.as_str()),
                        task.error_message,
                        to_text(task.gmt_start),
                        to_text(task.gmt_end),
                    ],
                )
                .context("Failed to insert activity task")?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    async fn update_by_primary_key(&self, id: i64, update: ActivityTaskUpdate) -> Result<()> {
        self.db
            .call(move |conn| {
                let changed = conn
                    .execute(
                        "UPDATE activity_tasks SET \
                         phase = COALESCE(?2, phase), \
                         run_status = COALESCE(?3, run_status), \
                         result_status = COALESCE(?4, result_status), \
                         error_message = COALESCE(?5, error_message), \
                         gmt_start = COALESCE(?6, gmt_start), \
                         gmt_end = COALESCE(?7, gmt_end) \
                         WHERE id = ?1",
                        params![
                            id,
                            update.phase.map(|p| p.as_str()),
                            update.run_status.map(|s| s.as_str()),
                            update.result_status.map(|s| s.as_str()),
                            update.error_message,
                            to_text(update.gmt_start),
                            to_text(update.gmt_end),
                        ],
                    )
                    .context("Failed to update activity task")?;
                if changed == 0 {
                    anyhow::bail!("Activity task {} not found", id);
                }
                Ok(())
            })
            .await
    }
}

#[async_trait]
impl ActivityTaskRecordRepository for SqliteRepository {
    async fn insert(&self, record: ActivityTaskRecord) -> Result<i64> {
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO activity_task_records (experiment_task_id, activity_task_id, \
                     flow_id, device_id, ip, hostname, scene_code, phase, gmt_start, gmt_end, \
                     success, code, result, error_message) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                    params![
                        record.experiment_task_id,
                        record.activity_task_id,
                        record.flow_id,
                        record.device_id,
                        record.ip,
                        record.hostname,
                        record.scene_code,
                        record.phase.map(|p| p.as_str()),
                        to_text(record.gmt_start),
                        to_text(record.gmt_end),
                        record.success,
                        record.code,
                        record.result,
                        record.error_message,
                    ],
                )
                .context("Failed to insert activity task record")?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    async fn update_by_primary_key(&self, id: i64, update: RecordUpdate) -> Result<()> {
        self.db
            .call(move |conn| {
                let changed = conn
                    .execute(
                        "UPDATE activity_task_records SET \
                         gmt_end = COALESCE(?2, gmt_end), \
                         success = COALESCE(?3, success), \
                         code = COALESCE(?4, code), \
                         result = COALESCE(?5, result), \
                         error_message = COALESCE(?6, error_message) \
                         WHERE id = ?1",
                        params![
                            id,
                            to_text(update.gmt_end),
                            update.success,
                            update.code,
                            update.result,
                            update.error_message,
                        ],
                    )
                    .context("Failed to update activity task record")?;
                if changed == 0 {
                    anyhow::bail!("Activity task record {} not found", id);
                }
                Ok(())
            })
            .await
    }

    async fn select_by_experiment_task_id(
        &self,
        experiment_task_id: i64,
    ) -> Result<Vec<ActivityTaskRecord>> {
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM activity_task_records WHERE experiment_task_id = ?1 ORDER BY id",
                    RECORD_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![experiment_task_id], RecordRow::read)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .context("Failed to select records")?;
                rows.into_iter().map(RecordRow::decode).collect()
            })
            .await
    }

    async fn select_by_scene_code(
        &self,
        experiment_task_id: i64,
        scene_code: &str,
    ) -> Result<Vec<ActivityTaskRecord>> {
        let scene_code = scene_code.to_string();
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM activity_task_records \
                     WHERE experiment_task_id = ?1 AND scene_code = ?2 ORDER BY id",
                    RECORD_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![experiment_task_id, scene_code], RecordRow::read)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .context("Failed to select records by scene code")?;
                rows.into_iter().map(RecordRow::decode).collect()
            })
            .await
    }
}
