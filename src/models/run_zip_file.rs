//! RunZipFile: an aggregate archive over a subset of provider tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An aggregate artifact referencing a subset of provider tasks plus the
/// archive result. A run may have several: one whole-run archive and
/// optionally one per re-run subset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunZipFile {
    pub id: Uuid,
    pub run_id: Uuid,

    /// Provider tasks whose artifacts the archive covers.
    pub provider_task_ids: Vec<Uuid>,

    /// The archive artifact, once produced.
    pub result: Option<Uuid>,

    /// Human-readable progress/status line for the UI.
    pub message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunZipFile {
    pub fn new(run_id: Uuid, provider_task_ids: Vec<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            provider_task_ids,
            result: None,
            message: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn completed(&mut self, result: Uuid) {
        self.result = Some(result);
        self.message = Some("Completed".to_string());
        self.finished_at = Some(Utc::now());
    }
}
