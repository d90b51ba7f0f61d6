//! # System Constants
//!
//! Core constants and small enums that define the operational boundaries of
//! the export orchestration engine: queue routing, dispatch priorities, and
//! the lifecycle event vocabulary.

use serde::{Deserialize, Serialize};

/// Reserved provider-task slug for whole-run bookkeeping (archive assembly
/// and run finalization). Never displayed alongside real providers.
pub const RUN_PROVIDER_SLUG: &str = "run";

/// The native interchange format every collection step produces.
pub const INTERCHANGE_FORMAT: &str = "gpkg";

/// SRID of the native pass. Reprojection to this is a no-op and skipped.
pub const NATIVE_SRID: i32 = 4326;

/// Lifecycle events published on the event bus.
pub mod events {
    // Run lifecycle
    pub const RUN_STARTED: &str = "run.started";
    pub const RUN_COMPLETED: &str = "run.completed";
    pub const RUN_FAILED: &str = "run.failed";
    pub const RUN_CANCELED: &str = "run.canceled";
    pub const RUN_DELETED: &str = "run.deleted";
    pub const RUN_FINALIZED: &str = "run.finalized";

    // Provider task lifecycle
    pub const PROVIDER_COMPLETED: &str = "provider.completed";
    pub const PROVIDER_INCOMPLETE: &str = "provider.incomplete";
    pub const PROVIDER_CANCELED: &str = "provider.canceled";

    // Export task lifecycle
    pub const TASK_STARTED: &str = "task.started";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_FAILED: &str = "task.failed";
    pub const TASK_CANCELED: &str = "task.canceled";

    // Finalization
    pub const ARCHIVE_CREATED: &str = "archive.created";
    pub const FINALIZE_FAILED: &str = "finalize.failed";
}

/// Dispatch priority for queue submission. Cancels outrank finalization,
/// which outranks regular export work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Default,
    FinalizeProvider,
    FinalizeRun,
    Cancel,
}

impl TaskPriority {
    /// Numeric priority for queue backends that want one (higher wins).
    pub fn value(&self) -> u8 {
        match self {
            Self::Default => 50,
            Self::FinalizeProvider => 70,
            Self::FinalizeRun => 80,
            Self::Cancel => 90,
        }
    }
}

/// Routing key for a worker's default queue.
pub fn worker_queue(worker: &str) -> String {
    worker.to_string()
}

/// Routing key for a worker's priority queue (finalize, cancel).
pub fn priority_queue(worker: &str) -> String {
    format!("{worker}.priority")
}

/// Routing key for the dedicated OSM collection queue. OSM collection is
/// memory-heavy and routed away from regular conversion work.
pub fn osm_queue(worker: &str) -> String {
    format!("{worker}.osm")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Cancel.value() > TaskPriority::FinalizeRun.value());
        assert!(TaskPriority::FinalizeRun.value() > TaskPriority::FinalizeProvider.value());
        assert!(TaskPriority::FinalizeProvider.value() > TaskPriority::Default.value());
        assert!(TaskPriority::Cancel > TaskPriority::Default);
    }

    #[test]
    fn test_queue_routing() {
        assert_eq!(priority_queue("worker-1"), "worker-1.priority");
        assert_eq!(osm_queue("worker-1"), "worker-1.osm");
        assert_eq!(worker_queue("worker-1"), "worker-1");
    }
}
