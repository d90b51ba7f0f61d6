//! # Orchestration Core
//!
//! Top-level assembly of the engine: wires the store, cache, collaborator
//! seams, compiler, propagator, barrier, and substrate together, and exposes
//! the run lifecycle operations the intake layer calls.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{error, info};
use uuid::Uuid;

use crate::cache::ProgressCache;
use crate::config::OrchestratorConfig;
use crate::error::{ExportError, Result};
use crate::events::EventPublisher;
use crate::execution::handlers::HandlerRegistry;
use crate::execution::local::{ChainRunner, LocalSubstrate};
use crate::execution::substrate::{ExecutionSubstrate, SubmitHandle, TokenRegistry};
use crate::models::{ExportRun, Job, ProviderCatalog};
use crate::services::{AdmissionEstimator, Archiver, Collector, Converter, Notifier};
use crate::state_machine::TaskState;
use crate::store::StateStore;

use super::admission::AdmissionController;
use super::cancellation::{CancelMode, CancellationPropagator};
use super::compiler::TaskGraphCompiler;
use super::finalizer::FinalizationBarrier;
use super::progress::ProgressTracker;
use super::runs::RunBuilder;

/// The collaborator seams an orchestrator needs at construction.
pub struct Collaborators {
    pub estimator: Arc<dyn AdmissionEstimator>,
    pub collector: Arc<dyn Collector>,
    pub converter: Arc<dyn Converter>,
    pub archiver: Arc<dyn Archiver>,
    pub notifier: Arc<dyn Notifier>,
}

/// The orchestration engine.
pub struct Orchestrator {
    store: Arc<dyn StateStore>,
    catalog: Arc<ProviderCatalog>,
    config: OrchestratorConfig,
    publisher: EventPublisher,
    worker: String,

    admission: Arc<AdmissionController>,
    builder: RunBuilder,
    compiler: TaskGraphCompiler,
    propagator: Arc<CancellationPropagator>,
    barrier: Arc<FinalizationBarrier>,
    substrate: Arc<dyn ExecutionSubstrate>,

    /// Submission handles per run, for substrate-level cancellation.
    handles: DashMap<Uuid, Vec<SubmitHandle>>,
}

impl Orchestrator {
    /// Wire an orchestrator over the in-process substrate.
    pub fn local(
        store: Arc<dyn StateStore>,
        cache: Arc<dyn ProgressCache>,
        catalog: Arc<ProviderCatalog>,
        config: OrchestratorConfig,
        collaborators: Collaborators,
        worker: impl Into<String>,
    ) -> Arc<Self> {
        let worker = worker.into();
        let publisher = EventPublisher::default();
        let tokens = Arc::new(TokenRegistry::new());

        let admission = Arc::new(AdmissionController::new(
            Arc::clone(&collaborators.estimator),
            config.admission.clone(),
        ));
        let compiler = TaskGraphCompiler::new(
            Arc::clone(&store),
            Arc::clone(&catalog),
            Arc::clone(&admission),
        );
        let propagator = Arc::new(CancellationPropagator::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(&tokens),
            Arc::clone(&collaborators.notifier),
            publisher.clone(),
            config.clone(),
        ));
        let barrier = Arc::new(FinalizationBarrier::new(
            Arc::clone(&store),
            Arc::clone(&collaborators.archiver),
            Arc::clone(&collaborators.notifier),
            publisher.clone(),
            config.clone(),
        ));
        let tracker = Arc::new(ProgressTracker::new(Arc::clone(&cache), config.cache.ttl()));
        let registry = Arc::new(HandlerRegistry::new(
            Arc::clone(&collaborators.collector),
            Arc::clone(&collaborators.converter),
            config.area.max_split_depth,
        ));
        let runner = Arc::new(ChainRunner::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            publisher.clone(),
            registry,
            Arc::clone(&propagator),
            Arc::clone(&barrier),
            tracker,
            Arc::clone(&tokens),
            Arc::clone(&catalog),
            config.clone(),
            worker.clone(),
        ));
        let substrate: Arc<dyn ExecutionSubstrate> = Arc::new(LocalSubstrate::new(
            runner,
            tokens,
            config.execution.max_concurrent_chains,
        ));
        let builder = RunBuilder::new(
            Arc::clone(&store),
            Arc::clone(&collaborators.notifier),
            publisher.clone(),
            config.clone(),
        );

        Arc::new(Self {
            store,
            catalog,
            config,
            publisher,
            worker,
            admission,
            builder,
            compiler,
            propagator,
            barrier,
            substrate,
            handles: DashMap::new(),
        })
    }

    /// Register a job with the state store. Jobs come pre-validated from
    /// the intake layer.
    pub async fn submit_job(&self, job: Job) -> Result<Uuid> {
        let job_id = job.id;
        self.store.insert_job(&job).await?;
        Ok(job_id)
    }

    /// Create a run for a job. Admission control runs here, before the run
    /// row exists: an over-cap request from a non-elevated caller creates
    /// nothing at all.
    pub async fn create_run(
        &self,
        job_id: Uuid,
        user: Option<&str>,
        elevated: bool,
    ) -> Result<ExportRun> {
        self.admit_job(job_id, elevated).await?;
        self.builder.create_run(job_id, user, None).await
    }

    /// Create a run cloned from an earlier one.
    pub async fn clone_run(
        &self,
        parent_run_id: Uuid,
        user: Option<&str>,
        elevated: bool,
    ) -> Result<ExportRun> {
        let parent = self
            .store
            .run(parent_run_id)
            .await?
            .ok_or(ExportError::not_found("run", parent_run_id))?;
        self.admit_job(parent.job_id, elevated).await?;
        self.builder
            .create_run(parent.job_id, user, Some(parent_run_id))
            .await
    }

    /// Assign the run to this worker, compile its chains, and submit them.
    /// A compile failure marks the run FAILED — it never silently sticks.
    pub async fn pick_up_run(&self, run_id: Uuid, elevated: bool) -> Result<Vec<SubmitHandle>> {
        let run = self
            .store
            .run(run_id)
            .await?
            .ok_or(ExportError::not_found("run", run_id))?;
        if run.deleted {
            return Err(ExportError::Validation(format!(
                "Run {run_id} has been deleted"
            )));
        }

        self.store.set_run_worker(run_id, &self.worker).await?;
        info!(run_id = %run_id, worker = %self.worker, "Picking up run");

        let chains = match self.compiler.compile_run(&run, elevated, &self.worker).await {
            Ok(chains) => chains,
            Err(err) => {
                error!(run_id = %run_id, error = %err, "Compilation failed, marking run FAILED");
                self.store
                    .update_run_status(
                        run_id,
                        &[TaskState::Submitted, TaskState::Pending, TaskState::Running],
                        TaskState::Failed,
                    )
                    .await?;
                self.store.set_run_finished(run_id).await?;
                return Err(err);
            }
        };

        // All chains submit together: an error earlier in compilation fails
        // the whole batch rather than an undefined prefix of it.
        let mut handles = Vec::with_capacity(chains.len());
        for chain in chains {
            let priority = chain.priority;
            handles.push(self.substrate.submit(chain, priority).await?);
        }
        self.handles.insert(run_id, handles.clone());
        Ok(handles)
    }

    /// User-initiated cancel of one provider's chain.
    pub async fn cancel_provider_task(
        &self,
        provider_task_id: Uuid,
        user: Option<&str>,
    ) -> Result<()> {
        self.propagator
            .cancel_provider_task(provider_task_id, user, None, CancelMode::User)
            .await
    }

    /// User-initiated cancel of a whole run: ask the substrate to stop the
    /// submitted chains, then fan the state-level cancel out.
    pub async fn cancel_run(&self, run_id: Uuid, user: Option<&str>) -> Result<()> {
        let handles = self
            .handles
            .get(&run_id)
            .map(|h| h.clone())
            .unwrap_or_default();
        for handle in handles {
            if let Err(err) = self.substrate.cancel(handle.id, -1).await {
                error!(run_id = %run_id, handle = %handle.id, error = %err, "Substrate cancel failed");
            }
        }
        self.propagator
            .cancel_run(run_id, user, CancelMode::User)
            .await
    }

    /// Soft-delete a run, releasing its results.
    pub async fn delete_run(&self, run_id: Uuid, user: Option<&str>) -> Result<()> {
        self.propagator.delete_run(run_id, user).await
    }

    /// Current run status from the state store.
    pub async fn run_status(&self, run_id: Uuid) -> Result<TaskState> {
        Ok(self
            .store
            .run(run_id)
            .await?
            .ok_or(ExportError::not_found("run", run_id))?
            .status)
    }

    /// Invoke the finalization barrier directly (operational tooling).
    pub async fn finalize_run(&self, run_id: Uuid) -> Result<super::finalizer::FinalizeDecision> {
        self.barrier.wait_for_providers(run_id).await
    }

    pub fn events(&self) -> &EventPublisher {
        &self.publisher
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Admission gate shared by run creation paths.
    async fn admit_job(&self, job_id: Uuid, elevated: bool) -> Result<()> {
        let job = self
            .store
            .job(job_id)
            .await?
            .ok_or(ExportError::not_found("job", job_id))?;
        for request in &job.provider_requests {
            let Some(provider) = self.catalog.get(&request.provider) else {
                continue;
            };
            let zoom = (
                request.min_zoom.unwrap_or(provider.level_from),
                request.max_zoom.unwrap_or(provider.level_to),
            );
            self.admission
                .check(provider, &job.bbox, zoom, elevated)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryProgressCache;
    use crate::models::{Provider, ProviderRequest, ServiceType};
    use crate::services::{
        RecordingArchiver, RecordingCollector, RecordingConverter, RecordingNotifier,
        StaticEstimator,
    };
    use crate::store::MemoryStateStore;

    fn geometry() -> serde_json::Value {
        serde_json::json!({
            "type": "Polygon",
            "coordinates": [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0], [0.0, 0.0]]]
        })
    }

    fn orchestrator(estimated_size: f64) -> (Arc<MemoryStateStore>, Arc<Orchestrator>) {
        let store: Arc<MemoryStateStore> = Arc::new(MemoryStateStore::new());
        let mut provider = Provider::new("osm", "OpenStreetMap", ServiceType::Osm);
        provider.max_data_size_mb = Some(100.0);
        let catalog = Arc::new(ProviderCatalog::new([provider]));
        let orchestrator = Orchestrator::local(
            store.clone(),
            Arc::new(MemoryProgressCache::new()),
            catalog,
            OrchestratorConfig::default(),
            Collaborators {
                estimator: Arc::new(StaticEstimator::new(estimated_size, 30.0)),
                collector: Arc::new(RecordingCollector::new()),
                converter: Arc::new(RecordingConverter::new()),
                archiver: Arc::new(RecordingArchiver::new()),
                notifier: Arc::new(RecordingNotifier::new()),
            },
            "worker-test",
        );
        (store, orchestrator)
    }

    #[tokio::test]
    async fn test_admission_rejection_creates_no_run() {
        let (store, orchestrator) = orchestrator(5_000.0);
        let job = Job::new(
            "Huge Export",
            "user",
            geometry(),
            vec![ProviderRequest::new("osm", ["gpkg"])],
        )
        .unwrap();
        let job_id = orchestrator.submit_job(job).await.unwrap();

        let err = orchestrator.create_run(job_id, None, false).await.unwrap_err();
        match err {
            ExportError::AdmissionRejected { provider, .. } => assert_eq!(provider, "osm"),
            other => panic!("expected AdmissionRejected, got {other:?}"),
        }
        assert!(store.runs_for_job(job_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_elevated_caller_creates_run_over_cap() {
        let (_store, orchestrator) = orchestrator(5_000.0);
        let job = Job::new(
            "Huge Export",
            "admin",
            geometry(),
            vec![ProviderRequest::new("osm", ["gpkg"])],
        )
        .unwrap();
        let job_id = orchestrator.submit_job(job).await.unwrap();
        let run = orchestrator.create_run(job_id, None, true).await.unwrap();
        assert_eq!(run.status, TaskState::Submitted);
    }

    #[tokio::test]
    async fn test_pick_up_deleted_run_is_rejected() {
        let (store, orchestrator) = orchestrator(10.0);
        let job = Job::new(
            "Export",
            "user",
            geometry(),
            vec![ProviderRequest::new("osm", ["gpkg"])],
        )
        .unwrap();
        let job_id = orchestrator.submit_job(job).await.unwrap();
        let run = orchestrator.create_run(job_id, None, false).await.unwrap();
        store.soft_delete_run(run.id, None).await.unwrap();

        let err = orchestrator.pick_up_run(run.id, false).await.unwrap_err();
        assert!(matches!(err, ExportError::Validation(_)));
    }
}
