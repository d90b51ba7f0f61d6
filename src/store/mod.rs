//! # State Store
//!
//! Repository interface over the durable record of runs, provider tasks,
//! tasks, and results. The engine consumes this store; schema and migrations
//! live with the persistence layer, not here.
//!
//! The store is the single source of truth for status and is written
//! concurrently by many workers, so every status write is a targeted,
//! guarded single-row update: the caller names the states it expects and the
//! store applies the change only when the row still matches. Two workers
//! racing to finalize the same record cannot double-apply state.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{
    ExportRun, ExportTaskRecord, Job, ProviderTaskRecord, RunZipFile, TaskFailure, TaskResult,
};
use crate::state_machine::TaskState;

pub use memory::MemoryStateStore;
pub use postgres::PostgresStateStore;

/// Errors raised by state store implementations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Record not found: {0}")]
    NotFound(Uuid),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Durable record of run / provider-task / task state.
///
/// `update_*_status` and `transition_task` are compare-and-set writes: they
/// return `true` only when the row was in one of the `expected` states and
/// has been moved to `to`. A `false` return means another writer got there
/// first and the caller must re-read before deciding anything.
#[async_trait]
pub trait StateStore: Send + Sync {
    // Jobs (read-mostly; the intake layer owns them)
    async fn insert_job(&self, job: &Job) -> StoreResult<()>;
    async fn job(&self, id: Uuid) -> StoreResult<Option<Job>>;

    // Runs
    async fn insert_run(&self, run: &ExportRun) -> StoreResult<()>;
    async fn run(&self, id: Uuid) -> StoreResult<Option<ExportRun>>;
    /// All runs for a job, newest first, including soft-deleted.
    async fn runs_for_job(&self, job_id: Uuid) -> StoreResult<Vec<ExportRun>>;
    async fn update_run_status(
        &self,
        id: Uuid,
        expected: &[TaskState],
        to: TaskState,
    ) -> StoreResult<bool>;
    async fn set_run_worker(&self, id: Uuid, worker: &str) -> StoreResult<()>;
    async fn set_run_started(&self, id: Uuid) -> StoreResult<()>;
    async fn set_run_finished(&self, id: Uuid) -> StoreResult<()>;
    /// Stamp the notification time. Returns `false` when already stamped —
    /// the guard that keeps finalization from notifying twice.
    async fn set_run_notified(&self, id: Uuid) -> StoreResult<bool>;
    async fn soft_delete_run(&self, id: Uuid, user: Option<&str>) -> StoreResult<()>;

    // Provider tasks
    async fn insert_provider_task(&self, record: &ProviderTaskRecord) -> StoreResult<()>;
    async fn provider_task(&self, id: Uuid) -> StoreResult<Option<ProviderTaskRecord>>;
    async fn provider_tasks_for_run(&self, run_id: Uuid) -> StoreResult<Vec<ProviderTaskRecord>>;
    async fn update_provider_task_status(
        &self,
        id: Uuid,
        expected: &[TaskState],
        to: TaskState,
    ) -> StoreResult<bool>;
    async fn set_provider_task_finished(&self, id: Uuid) -> StoreResult<()>;

    // Tasks
    async fn insert_task(&self, task: &ExportTaskRecord) -> StoreResult<()>;
    async fn task(&self, id: Uuid) -> StoreResult<Option<ExportTaskRecord>>;
    async fn tasks_for_provider(&self, provider_task_id: Uuid)
        -> StoreResult<Vec<ExportTaskRecord>>;
    async fn transition_task(
        &self,
        id: Uuid,
        expected: &[TaskState],
        to: TaskState,
    ) -> StoreResult<bool>;
    async fn set_task_started(&self, id: Uuid, worker: &str, pid: i32) -> StoreResult<()>;
    async fn set_task_finished(&self, id: Uuid) -> StoreResult<()>;
    async fn set_task_cancel_user(&self, id: Uuid, user: &str) -> StoreResult<()>;
    async fn set_task_result(&self, id: Uuid, result_id: Uuid) -> StoreResult<()>;

    // Results and failures
    async fn insert_result(&self, result: &TaskResult) -> StoreResult<()>;
    async fn result(&self, id: Uuid) -> StoreResult<Option<TaskResult>>;
    async fn soft_delete_result(&self, id: Uuid) -> StoreResult<()>;
    async fn record_task_failure(&self, failure: &TaskFailure) -> StoreResult<()>;
    async fn failures_for_task(&self, task_id: Uuid) -> StoreResult<Vec<TaskFailure>>;

    // Run archives
    async fn insert_run_zip_file(&self, zip: &RunZipFile) -> StoreResult<()>;
    async fn update_run_zip_file(&self, zip: &RunZipFile) -> StoreResult<()>;
    async fn run_zip_files_for_run(&self, run_id: Uuid) -> StoreResult<Vec<RunZipFile>>;
}
