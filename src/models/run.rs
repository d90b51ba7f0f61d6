//! ExportRun: one execution attempt of a job.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state_machine::TaskState;

/// One execution attempt of a [`Job`](crate::models::Job). Many runs can map
/// to a job, bounded by the retention policy; exactly one is "active" for UI
/// purposes (the newest non-deleted). Runs are soft-deleted, never removed
/// while a download still references them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportRun {
    pub id: Uuid,
    pub job_id: Uuid,
    pub user: String,
    pub status: TaskState,

    /// Hostname routing key of the worker that picked the run up.
    pub worker: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    /// When the run's artifacts expire and may be reaped.
    pub expiration: DateTime<Utc>,

    /// When the outcome notification was sent; guards duplicate sends.
    pub notified: Option<DateTime<Utc>>,

    /// The run this one was cloned from, if any.
    pub parent_run: Option<Uuid>,

    pub deleted: bool,
    pub delete_user: Option<String>,
}

impl ExportRun {
    /// New run in SUBMITTED state with the given expiration window.
    pub fn submitted(job_id: Uuid, user: impl Into<String>, expiration_days: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_id,
            user: user.into(),
            status: TaskState::Submitted,
            worker: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            expiration: now + Duration::days(expiration_days),
            notified: None,
            parent_run: None,
            deleted: false,
            delete_user: None,
        }
    }

    /// Clone lineage: a fresh SUBMITTED run pointing back at its parent.
    pub fn cloned_from(parent: &ExportRun, user: impl Into<String>, expiration_days: i64) -> Self {
        let mut run = Self::submitted(parent.job_id, user, expiration_days);
        run.parent_run = Some(parent.id);
        run
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submitted_run() {
        let job_id = Uuid::new_v4();
        let run = ExportRun::submitted(job_id, "user", 14);
        assert_eq!(run.status, TaskState::Submitted);
        assert!(!run.is_finished());
        assert!(run.expiration > run.created_at);
        assert!(run.parent_run.is_none());
    }

    #[test]
    fn test_clone_lineage() {
        let parent = ExportRun::submitted(Uuid::new_v4(), "user", 14);
        let clone = ExportRun::cloned_from(&parent, "user", 14);
        assert_eq!(clone.parent_run, Some(parent.id));
        assert_eq!(clone.job_id, parent.job_id);
        assert_ne!(clone.id, parent.id);
    }
}
