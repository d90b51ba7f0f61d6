//! Typed task graph.
//!
//! A provider's work compiles into an [`ExecutableChain`]: an explicit,
//! ordered list of [`Step`]s with a real dependency reference per step,
//! executed by the substrate. Ordering and error propagation are data here,
//! not queue-framework behavior: step *n+1* starts only after its
//! dependency reached SUCCESS (an explicit precondition, since queue order
//! alone is insufficient under retries).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::TaskPriority;
use crate::models::{ExportFormat, ServiceType, TaskCategory};

/// What a step does. Exhaustively dispatched by the chain runner; there is
/// no string-keyed handler lookup to miss at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum StepKind {
    /// Primary provider-specific fetch producing the interchange artifact.
    Collect(ServiceType),
    /// Convert the interchange artifact into one output format.
    Convert { format: ExportFormat },
    /// Reproject one format's native-projection output to another srid.
    Reproject { format: ExportFormat, srid: i32 },
    /// Derive and persist the provider task's terminal status.
    ProviderFinalize,
    /// The run-wide barrier: await all providers, archive, notify.
    RunFinalize,
}

impl StepKind {
    pub fn category(&self) -> TaskCategory {
        match self {
            Self::Collect(_) => TaskCategory::Collect,
            Self::Convert { .. } => TaskCategory::Convert,
            Self::Reproject { .. } => TaskCategory::Reproject,
            Self::ProviderFinalize | Self::RunFinalize => TaskCategory::Finalize,
        }
    }
}

/// One execution unit inside a chain, bound to its task record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// The persistent task record this step drives.
    pub task_id: Uuid,

    /// Display name; matches the task record, unique within the chain.
    pub name: String,

    pub kind: StepKind,

    /// A failing step with this flag set invalidates the whole chain:
    /// pending siblings are canceled and the run-level error handler runs.
    pub abort_on_error: bool,

    /// Name of the step whose SUCCESS (and artifact) this step consumes.
    /// `None` for chain heads and bookkeeping steps.
    pub depends_on: Option<String>,
}

/// A compiled, strictly-sequential chain for one provider task. Chains
/// across providers are independent and execute concurrently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutableChain {
    pub run_id: Uuid,
    pub provider_task_id: Uuid,

    /// Provider slug; the reserved `"run"` slug for the barrier chain.
    pub provider_slug: String,

    /// Resolved zoom range for collection.
    pub zoom: (u8, u8),

    pub steps: Vec<Step>,

    /// Queue / routing key the chain is submitted on.
    pub queue: String,

    pub priority: TaskPriority,
}

impl ExecutableChain {
    /// Task ids of every step, in chain order.
    pub fn task_ids(&self) -> Vec<Uuid> {
        self.steps.iter().map(|s| s.task_id).collect()
    }

    pub fn step_named(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_kind_categories() {
        assert_eq!(
            StepKind::Collect(ServiceType::Osm).category(),
            TaskCategory::Collect
        );
        assert_eq!(
            StepKind::Convert { format: ExportFormat::Shp }.category(),
            TaskCategory::Convert
        );
        assert_eq!(
            StepKind::Reproject { format: ExportFormat::Shp, srid: 3857 }.category(),
            TaskCategory::Reproject
        );
        assert_eq!(StepKind::ProviderFinalize.category(), TaskCategory::Finalize);
        assert_eq!(StepKind::RunFinalize.category(), TaskCategory::Finalize);
    }

    #[test]
    fn test_chain_lookup() {
        let chain = ExecutableChain {
            run_id: Uuid::new_v4(),
            provider_task_id: Uuid::new_v4(),
            provider_slug: "osm".into(),
            zoom: (0, 10),
            steps: vec![Step {
                task_id: Uuid::new_v4(),
                name: "OpenStreetMap Data (.gpkg)".into(),
                kind: StepKind::Collect(ServiceType::Osm),
                abort_on_error: true,
                depends_on: None,
            }],
            queue: "worker-1".into(),
            priority: TaskPriority::Default,
        };
        assert!(chain.step_named("OpenStreetMap Data (.gpkg)").is_some());
        assert_eq!(chain.task_ids().len(), 1);
    }
}
