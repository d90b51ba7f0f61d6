//! ExportTaskRecord: a single execution step, and its produced result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state_machine::TaskState;

/// What stage of a provider chain a task implements. Finalize-category tasks
/// are bookkeeping: they are excluded from status aggregation so that a
/// provider's outcome derives purely from its work steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Collect,
    Convert,
    Reproject,
    Archive,
    Finalize,
}

impl TaskCategory {
    /// Work steps count toward the provider's derived status.
    pub fn is_work(&self) -> bool {
        matches!(self, Self::Collect | Self::Convert | Self::Reproject | Self::Archive)
    }
}

/// A single execution step (collection, one format conversion, one
/// reprojection, or finalize bookkeeping) within a provider task. Task names
/// are unique within their provider task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportTaskRecord {
    pub id: Uuid,
    pub provider_task_id: Uuid,

    /// Display name, unique within the provider task.
    pub name: String,

    pub category: TaskCategory,
    pub status: TaskState,

    /// If this step fails, the rest of the chain must not run.
    pub abort_on_error: bool,

    /// Hostname of the worker executing the task.
    pub worker: Option<String>,

    /// OS pid of the live process, `-1` when no process exists.
    pub pid: i32,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    pub display: bool,

    /// Who requested cancellation, when anyone did.
    pub cancel_user: Option<String>,

    /// The produced artifact, at most one per task.
    pub result: Option<Uuid>,
}

impl ExportTaskRecord {
    pub fn pending(
        provider_task_id: Uuid,
        name: impl Into<String>,
        category: TaskCategory,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider_task_id,
            name: name.into(),
            category,
            status: TaskState::Pending,
            abort_on_error: false,
            worker: None,
            pid: -1,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            display: true,
            cancel_user: None,
            result: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }

    /// Whether a live OS process may need killing on cancel.
    pub fn has_live_process(&self) -> bool {
        self.pid > 0 && self.worker.is_some() && !self.is_finished()
    }
}

/// An opaque artifact handle produced by a successful task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub id: Uuid,
    pub filename: String,
    pub size_mb: f64,
    pub download_url: String,
    pub deleted: bool,
}

impl TaskResult {
    pub fn new(filename: impl Into<String>, size_mb: f64, download_url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            filename: filename.into(),
            size_mb,
            download_url: download_url.into(),
            deleted: false,
        }
    }
}

/// A recorded task failure, kept for auditing. Cancellations are recorded
/// here too so the UI can show who stopped a task and why.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFailure {
    pub id: Uuid,
    pub task_id: Uuid,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

impl TaskFailure {
    pub fn new(task_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            message: message.into(),
            recorded_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_task_has_no_process() {
        let task = ExportTaskRecord::pending(Uuid::new_v4(), "Geopackage (.gpkg)", TaskCategory::Convert);
        assert_eq!(task.pid, -1);
        assert!(!task.has_live_process());
        assert!(!task.abort_on_error);
    }

    #[test]
    fn test_live_process_detection() {
        let mut task =
            ExportTaskRecord::pending(Uuid::new_v4(), "OpenStreetMap Data (.gpkg)", TaskCategory::Collect);
        task.pid = 4242;
        task.worker = Some("worker-1".into());
        task.status = TaskState::Running;
        assert!(task.has_live_process());

        task.status = TaskState::Success;
        assert!(!task.has_live_process());
    }

    #[test]
    fn test_finalize_category_is_not_work() {
        assert!(TaskCategory::Collect.is_work());
        assert!(TaskCategory::Archive.is_work());
        assert!(!TaskCategory::Finalize.is_work());
    }
}
