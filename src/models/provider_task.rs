//! ProviderTaskRecord: one provider's work within a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::RUN_PROVIDER_SLUG;
use crate::state_machine::TaskState;

/// The orchestration unit representing one provider's work within one run.
/// At most one exists per (run, provider); the reserved `"run"` slug record
/// carries whole-run bookkeeping steps and is never displayed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderTaskRecord {
    pub id: Uuid,
    pub run_id: Uuid,
    pub provider_slug: String,
    pub name: String,
    pub status: TaskState,
    pub display: bool,

    /// Admission estimate recorded at compile time, for the UI.
    pub estimated_size_mb: Option<f64>,
    pub estimated_duration_secs: Option<f64>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ProviderTaskRecord {
    pub fn pending(run_id: Uuid, provider_slug: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            provider_slug: provider_slug.into(),
            name: name.into(),
            status: TaskState::Pending,
            display: true,
            estimated_size_mb: None,
            estimated_duration_secs: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// The reserved whole-run bookkeeping record.
    pub fn run_record(run_id: Uuid) -> Self {
        let mut record = Self::pending(run_id, RUN_PROVIDER_SLUG, RUN_PROVIDER_SLUG);
        record.display = false;
        record
    }

    pub fn is_run_record(&self) -> bool {
        self.provider_slug == RUN_PROVIDER_SLUG
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_record_is_hidden() {
        let record = ProviderTaskRecord::run_record(Uuid::new_v4());
        assert!(record.is_run_record());
        assert!(!record.display);
        assert_eq!(record.status, TaskState::Pending);
    }

    #[test]
    fn test_provider_record_defaults() {
        let record = ProviderTaskRecord::pending(Uuid::new_v4(), "osm", "OpenStreetMap");
        assert!(!record.is_run_record());
        assert!(record.display);
        assert!(record.estimated_size_mb.is_none());
    }
}
