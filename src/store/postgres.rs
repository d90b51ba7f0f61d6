//! Postgres-backed state store.
//!
//! Thin adapter over the external persistence layer's tables. Queries are
//! runtime-bound (no offline macro verification) so the crate builds without
//! a database; the schema itself is owned by the persistence layer.
//!
//! Guarded updates use `status = ANY($expected)` predicates so concurrent
//! workers can never double-apply a status change.

use async_trait::async_trait;
use sqlx::{FromRow, PgPool, Row};
use uuid::Uuid;

use crate::models::{
    ExportRun, ExportTaskRecord, Job, ProviderTaskRecord, RunZipFile, TaskCategory, TaskFailure,
    TaskResult,
};
use crate::state_machine::TaskState;

use super::{StateStore, StoreError, StoreResult};

/// [`StateStore`] over a Postgres pool.
#[derive(Clone)]
pub struct PostgresStateStore {
    pool: PgPool,
}

impl PostgresStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn states_to_strings(states: &[TaskState]) -> Vec<String> {
    states.iter().map(|s| s.to_string()).collect()
}

fn parse_state(raw: &str) -> Result<TaskState, StoreError> {
    raw.parse()
        .map_err(|_| StoreError::Database(format!("invalid status in database: {raw}")))
}

fn parse_category(raw: &str) -> Result<TaskCategory, StoreError> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|_| StoreError::Database(format!("invalid task category in database: {raw}")))
}

#[derive(FromRow)]
struct RunRow {
    id: Uuid,
    job_id: Uuid,
    user_name: String,
    status: String,
    worker: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    finished_at: Option<chrono::DateTime<chrono::Utc>>,
    expiration: chrono::DateTime<chrono::Utc>,
    notified: Option<chrono::DateTime<chrono::Utc>>,
    parent_run: Option<Uuid>,
    deleted: bool,
    delete_user: Option<String>,
}

impl RunRow {
    fn into_run(self) -> Result<ExportRun, StoreError> {
        Ok(ExportRun {
            id: self.id,
            job_id: self.job_id,
            user: self.user_name,
            status: parse_state(&self.status)?,
            worker: self.worker,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            expiration: self.expiration,
            notified: self.notified,
            parent_run: self.parent_run,
            deleted: self.deleted,
            delete_user: self.delete_user,
        })
    }
}

#[derive(FromRow)]
struct ProviderTaskRow {
    id: Uuid,
    run_id: Uuid,
    provider_slug: String,
    name: String,
    status: String,
    display: bool,
    estimated_size_mb: Option<f64>,
    estimated_duration_secs: Option<f64>,
    created_at: chrono::DateTime<chrono::Utc>,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl ProviderTaskRow {
    fn into_record(self) -> Result<ProviderTaskRecord, StoreError> {
        Ok(ProviderTaskRecord {
            id: self.id,
            run_id: self.run_id,
            provider_slug: self.provider_slug,
            name: self.name,
            status: parse_state(&self.status)?,
            display: self.display,
            estimated_size_mb: self.estimated_size_mb,
            estimated_duration_secs: self.estimated_duration_secs,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }
}

#[derive(FromRow)]
struct TaskRow {
    id: Uuid,
    provider_task_id: Uuid,
    name: String,
    category: String,
    status: String,
    abort_on_error: bool,
    worker: Option<String>,
    pid: i32,
    created_at: chrono::DateTime<chrono::Utc>,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    finished_at: Option<chrono::DateTime<chrono::Utc>>,
    display: bool,
    cancel_user: Option<String>,
    result: Option<Uuid>,
}

impl TaskRow {
    fn into_record(self) -> Result<ExportTaskRecord, StoreError> {
        Ok(ExportTaskRecord {
            id: self.id,
            provider_task_id: self.provider_task_id,
            name: self.name,
            category: parse_category(&self.category)?,
            status: parse_state(&self.status)?,
            abort_on_error: self.abort_on_error,
            worker: self.worker,
            pid: self.pid,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            display: self.display,
            cancel_user: self.cancel_user,
            result: self.result,
        })
    }
}

#[async_trait]
impl StateStore for PostgresStateStore {
    async fn insert_job(&self, job: &Job) -> StoreResult<()> {
        let document = serde_json::to_value(job)
            .map_err(|e| StoreError::Database(format!("failed to serialize job: {e}")))?;
        sqlx::query("INSERT INTO export_jobs (id, document) VALUES ($1, $2)")
            .bind(job.id)
            .bind(document)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn job(&self, id: Uuid) -> StoreResult<Option<Job>> {
        let row = sqlx::query("SELECT document FROM export_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            let document: serde_json::Value = row.get("document");
            serde_json::from_value(document)
                .map_err(|e| StoreError::Database(format!("failed to deserialize job: {e}")))
        })
        .transpose()
    }

    async fn insert_run(&self, run: &ExportRun) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO export_runs \
             (id, job_id, user_name, status, worker, created_at, started_at, finished_at, \
              expiration, notified, parent_run, deleted, delete_user) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(run.id)
        .bind(run.job_id)
        .bind(&run.user)
        .bind(run.status.to_string())
        .bind(&run.worker)
        .bind(run.created_at)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.expiration)
        .bind(run.notified)
        .bind(run.parent_run)
        .bind(run.deleted)
        .bind(&run.delete_user)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn run(&self, id: Uuid) -> StoreResult<Option<ExportRun>> {
        let row = sqlx::query_as::<_, RunRow>("SELECT * FROM export_runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(RunRow::into_run).transpose()
    }

    async fn runs_for_job(&self, job_id: Uuid) -> StoreResult<Vec<ExportRun>> {
        let rows = sqlx::query_as::<_, RunRow>(
            "SELECT * FROM export_runs WHERE job_id = $1 ORDER BY created_at DESC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RunRow::into_run).collect()
    }

    async fn update_run_status(
        &self,
        id: Uuid,
        expected: &[TaskState],
        to: TaskState,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE export_runs SET status = $2 WHERE id = $1 AND status = ANY($3)",
        )
        .bind(id)
        .bind(to.to_string())
        .bind(states_to_strings(expected))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_run_worker(&self, id: Uuid, worker: &str) -> StoreResult<()> {
        sqlx::query("UPDATE export_runs SET worker = $2 WHERE id = $1")
            .bind(id)
            .bind(worker)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_run_started(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE export_runs SET started_at = NOW() WHERE id = $1 AND started_at IS NULL")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_run_finished(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE export_runs SET finished_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_run_notified(&self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE export_runs SET notified = NOW() WHERE id = $1 AND notified IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn soft_delete_run(&self, id: Uuid, user: Option<&str>) -> StoreResult<()> {
        sqlx::query("UPDATE export_runs SET deleted = TRUE, delete_user = $2 WHERE id = $1")
            .bind(id)
            .bind(user)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_provider_task(&self, record: &ProviderTaskRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO data_provider_task_records \
             (id, run_id, provider_slug, name, status, display, estimated_size_mb, \
              estimated_duration_secs, created_at, started_at, finished_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(record.id)
        .bind(record.run_id)
        .bind(&record.provider_slug)
        .bind(&record.name)
        .bind(record.status.to_string())
        .bind(record.display)
        .bind(record.estimated_size_mb)
        .bind(record.estimated_duration_secs)
        .bind(record.created_at)
        .bind(record.started_at)
        .bind(record.finished_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => StoreError::Duplicate(
                format!("provider task for ({}, {})", record.run_id, record.provider_slug),
            ),
            other => other.into(),
        })?;
        Ok(())
    }

    async fn provider_task(&self, id: Uuid) -> StoreResult<Option<ProviderTaskRecord>> {
        let row = sqlx::query_as::<_, ProviderTaskRow>(
            "SELECT * FROM data_provider_task_records WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ProviderTaskRow::into_record).transpose()
    }

    async fn provider_tasks_for_run(&self, run_id: Uuid) -> StoreResult<Vec<ProviderTaskRecord>> {
        let rows = sqlx::query_as::<_, ProviderTaskRow>(
            "SELECT * FROM data_provider_task_records WHERE run_id = $1 ORDER BY created_at",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ProviderTaskRow::into_record).collect()
    }

    async fn update_provider_task_status(
        &self,
        id: Uuid,
        expected: &[TaskState],
        to: TaskState,
    ) -> StoreResult<bool> {
        let started = if to.is_active() { ", started_at = COALESCE(started_at, NOW())" } else { "" };
        let sql = format!(
            "UPDATE data_provider_task_records SET status = $2{started} \
             WHERE id = $1 AND status = ANY($3)"
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(to.to_string())
            .bind(states_to_strings(expected))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_provider_task_finished(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE data_provider_task_records SET finished_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_task(&self, task: &ExportTaskRecord) -> StoreResult<()> {
        let category = serde_json::to_value(task.category)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_default();
        sqlx::query(
            "INSERT INTO export_task_records \
             (id, provider_task_id, name, category, status, abort_on_error, worker, pid, \
              created_at, started_at, finished_at, display, cancel_user, result) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(task.id)
        .bind(task.provider_task_id)
        .bind(&task.name)
        .bind(category)
        .bind(task.status.to_string())
        .bind(task.abort_on_error)
        .bind(&task.worker)
        .bind(task.pid)
        .bind(task.created_at)
        .bind(task.started_at)
        .bind(task.finished_at)
        .bind(task.display)
        .bind(&task.cancel_user)
        .bind(task.result)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => StoreError::Duplicate(
                format!("task '{}' within provider task {}", task.name, task.provider_task_id),
            ),
            other => other.into(),
        })?;
        Ok(())
    }

    async fn task(&self, id: Uuid) -> StoreResult<Option<ExportTaskRecord>> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM export_task_records WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TaskRow::into_record).transpose()
    }

    async fn tasks_for_provider(
        &self,
        provider_task_id: Uuid,
    ) -> StoreResult<Vec<ExportTaskRecord>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM export_task_records WHERE provider_task_id = $1 ORDER BY created_at",
        )
        .bind(provider_task_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TaskRow::into_record).collect()
    }

    async fn transition_task(
        &self,
        id: Uuid,
        expected: &[TaskState],
        to: TaskState,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE export_task_records SET status = $2 WHERE id = $1 AND status = ANY($3)",
        )
        .bind(id)
        .bind(to.to_string())
        .bind(states_to_strings(expected))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_task_started(&self, id: Uuid, worker: &str, pid: i32) -> StoreResult<()> {
        sqlx::query(
            "UPDATE export_task_records SET worker = $2, pid = $3, started_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(worker)
        .bind(pid)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_task_finished(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE export_task_records SET finished_at = NOW(), pid = -1 WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_task_cancel_user(&self, id: Uuid, user: &str) -> StoreResult<()> {
        sqlx::query("UPDATE export_task_records SET cancel_user = $2 WHERE id = $1")
            .bind(id)
            .bind(user)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_task_result(&self, id: Uuid, result_id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE export_task_records SET result = $2 WHERE id = $1")
            .bind(id)
            .bind(result_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_result(&self, result: &TaskResult) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO export_task_results (id, filename, size_mb, download_url, deleted) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(result.id)
        .bind(&result.filename)
        .bind(result.size_mb)
        .bind(&result.download_url)
        .bind(result.deleted)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn result(&self, id: Uuid) -> StoreResult<Option<TaskResult>> {
        let row = sqlx::query("SELECT id, filename, size_mb, download_url, deleted FROM export_task_results WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| TaskResult {
            id: row.get("id"),
            filename: row.get("filename"),
            size_mb: row.get("size_mb"),
            download_url: row.get("download_url"),
            deleted: row.get("deleted"),
        }))
    }

    async fn soft_delete_result(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE export_task_results SET deleted = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_task_failure(&self, failure: &TaskFailure) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO export_task_failures (id, task_id, message, recorded_at) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(failure.id)
        .bind(failure.task_id)
        .bind(&failure.message)
        .bind(failure.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn failures_for_task(&self, task_id: Uuid) -> StoreResult<Vec<TaskFailure>> {
        let rows = sqlx::query(
            "SELECT id, task_id, message, recorded_at FROM export_task_failures \
             WHERE task_id = $1 ORDER BY recorded_at",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| TaskFailure {
                id: row.get("id"),
                task_id: row.get("task_id"),
                message: row.get("message"),
                recorded_at: row.get("recorded_at"),
            })
            .collect())
    }

    async fn insert_run_zip_file(&self, zip: &RunZipFile) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO run_zip_files \
             (id, run_id, provider_task_ids, result, message, created_at, finished_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(zip.id)
        .bind(zip.run_id)
        .bind(&zip.provider_task_ids)
        .bind(zip.result)
        .bind(&zip.message)
        .bind(zip.created_at)
        .bind(zip.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_run_zip_file(&self, zip: &RunZipFile) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE run_zip_files SET result = $2, message = $3, finished_at = $4 WHERE id = $1",
        )
        .bind(zip.id)
        .bind(zip.result)
        .bind(&zip.message)
        .bind(zip.finished_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(zip.id));
        }
        Ok(())
    }

    async fn run_zip_files_for_run(&self, run_id: Uuid) -> StoreResult<Vec<RunZipFile>> {
        let rows = sqlx::query(
            "SELECT id, run_id, provider_task_ids, result, message, created_at, finished_at \
             FROM run_zip_files WHERE run_id = $1",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| RunZipFile {
                id: row.get("id"),
                run_id: row.get("run_id"),
                provider_task_ids: row.get("provider_task_ids"),
                result: row.get("result"),
                message: row.get("message"),
                created_at: row.get("created_at"),
                finished_at: row.get("finished_at"),
            })
            .collect())
    }
}
