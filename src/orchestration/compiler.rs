//! # Task Graph Compiler
//!
//! Turns a run's provider requests into executable chains: one strictly
//! sequential chain per provider (collect → per-format convert → per-srid
//! reproject → provider-finalize) plus the run-wide barrier chain.
//!
//! Every request is resolved and admission-checked *before* any persistent
//! state is created, so a validation failure or admission rejection leaves
//! nothing behind, and a mid-batch error fails the whole submission rather
//! than an undefined prefix of it.

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::constants::{osm_queue, priority_queue, worker_queue, TaskPriority, NATIVE_SRID};
use crate::error::{ExportError, Result};
use crate::models::{
    ExportFormat, ExportRun, ExportTaskRecord, Job, Provider, ProviderCatalog, ProviderRequest,
    ProviderTaskRecord, ServiceType, TaskCategory,
};
use crate::store::StateStore;

use super::admission::{AdmissionController, AdmissionEstimates};
use super::task_graph::{ExecutableChain, Step, StepKind};

/// Task names for bookkeeping steps.
pub const PROVIDER_FINALIZE_TASK: &str = "Finalize Provider";
pub const RUN_FINALIZE_TASK: &str = "Finalize Run";
pub const ARCHIVE_TASK: &str = "Project File (.zip)";

/// A provider request validated and admitted, ready to materialize.
struct ResolvedRequest {
    provider: Provider,
    zoom: (u8, u8),
    formats: Vec<ExportFormat>,
    estimates: AdmissionEstimates,
}

/// Compiles provider requests into per-provider chains and the run barrier.
pub struct TaskGraphCompiler {
    store: Arc<dyn StateStore>,
    catalog: Arc<ProviderCatalog>,
    admission: Arc<AdmissionController>,
}

impl TaskGraphCompiler {
    pub fn new(
        store: Arc<dyn StateStore>,
        catalog: Arc<ProviderCatalog>,
        admission: Arc<AdmissionController>,
    ) -> Self {
        Self {
            store,
            catalog,
            admission,
        }
    }

    /// Compile every provider chain for a run, plus the barrier chain.
    ///
    /// Providers that already have a record on this run are skipped (re-pickup
    /// of a partially submitted run must not duplicate work); unknown
    /// providers and unknown formats are skipped with a warning. Zero usable
    /// formats for a requested provider is a validation error raised before
    /// any row is created.
    pub async fn compile_run(
        &self,
        run: &ExportRun,
        elevated: bool,
        worker: &str,
    ) -> Result<Vec<ExecutableChain>> {
        let job = self
            .store
            .job(run.job_id)
            .await?
            .ok_or(ExportError::not_found("job", run.job_id))?;

        if job.provider_requests.is_empty() {
            return Err(ExportError::Validation(
                "This job does not have any data sources or formats associated with it".into(),
            ));
        }

        let existing = self.store.provider_tasks_for_run(run.id).await?;

        // Resolve and admission-check everything first: no rows exist until
        // the whole batch is known good.
        let mut resolved = Vec::new();
        for request in &job.provider_requests {
            if let Some(record) = existing
                .iter()
                .find(|r| r.provider_slug == request.provider)
            {
                debug!(
                    provider = %request.provider,
                    status = %record.status,
                    "Provider already has a record on this run, skipping"
                );
                continue;
            }
            if let Some(request) = self.resolve(&job, request, elevated).await? {
                resolved.push(request);
            }
        }

        let mut chains = Vec::new();
        for request in resolved {
            chains.push(self.build_provider_chain(run, &job, request, worker).await?);
        }

        // The reserved "run" record carries the barrier and archive steps.
        let run_record = match existing.iter().find(|r| r.is_run_record()) {
            Some(record) => record.clone(),
            None => {
                let record = ProviderTaskRecord::run_record(run.id);
                self.store.insert_provider_task(&record).await?;
                record
            }
        };
        chains.push(self.build_barrier_chain(run, &job, &run_record, worker).await?);

        Ok(chains)
    }

    /// Validate one request and pass it through admission control. Returns
    /// `None` for unknown providers (skipped, not fatal).
    async fn resolve(
        &self,
        job: &Job,
        request: &ProviderRequest,
        elevated: bool,
    ) -> Result<Option<ResolvedRequest>> {
        let Some(provider) = self.catalog.get(&request.provider) else {
            warn!(provider = %request.provider, "Unknown provider requested, skipping");
            return Ok(None);
        };

        let zoom = (
            request.min_zoom.unwrap_or(provider.level_from),
            request.max_zoom.unwrap_or(provider.level_to),
        );
        if zoom.0 > zoom.1 {
            return Err(ExportError::Validation(format!(
                "Invalid zoom range {}-{} for provider '{}'",
                zoom.0, zoom.1, provider.slug
            )));
        }

        let mut formats = Vec::new();
        for slug in &request.formats {
            match slug.parse::<ExportFormat>() {
                Ok(format) if format.applicable_to(provider.service_type) => {
                    if !formats.contains(&format) {
                        formats.push(format);
                    }
                }
                Ok(format) => {
                    warn!(
                        provider = %provider.slug,
                        format = format.slug(),
                        "Format not applicable to provider, skipping"
                    );
                }
                Err(_) => {
                    warn!(provider = %provider.slug, format = %slug, "Unknown format requested, skipping");
                }
            }
        }
        if formats.is_empty() {
            return Err(ExportError::Validation(format!(
                "No usable export formats requested for provider '{}'",
                provider.slug
            )));
        }

        // Admission control: before any task row is created, and never
        // blocked by an unavailable estimator.
        let estimates = self
            .admission
            .check(provider, &job.bbox, zoom, elevated)
            .await?;

        Ok(Some(ResolvedRequest {
            provider: provider.clone(),
            zoom,
            formats,
            estimates,
        }))
    }

    /// Materialize one provider's records and chain.
    async fn build_provider_chain(
        &self,
        run: &ExportRun,
        job: &Job,
        request: ResolvedRequest,
        worker: &str,
    ) -> Result<ExecutableChain> {
        let ResolvedRequest {
            provider,
            zoom,
            formats,
            estimates,
        } = request;

        let mut record = ProviderTaskRecord::pending(run.id, &provider.slug, &provider.name);
        record.estimated_size_mb = estimates.size_mb;
        record.estimated_duration_secs = estimates.duration_secs;
        self.store.insert_provider_task(&record).await?;

        let mut steps = Vec::new();

        // Primary collection step; its failure invalidates the chain.
        let collect_name = provider.service_type.collection_task_name().to_string();
        let collect_id = self
            .insert_task_row(record.id, &collect_name, TaskCategory::Collect, true, true)
            .await?;
        steps.push(Step {
            task_id: collect_id,
            name: collect_name.clone(),
            kind: StepKind::Collect(provider.service_type),
            abort_on_error: true,
            depends_on: None,
        });

        // One conversion per format, consuming the interchange artifact.
        for format in &formats {
            let name = format.task_name().to_string();
            let task_id = self
                .insert_task_row(record.id, &name, TaskCategory::Convert, false, true)
                .await?;
            steps.push(Step {
                task_id,
                name: name.clone(),
                kind: StepKind::Convert { format: *format },
                abort_on_error: false,
                depends_on: Some(collect_name.clone()),
            });
        }

        // Reprojections follow the native pass; 4326 is a no-op and skipped.
        for srid in &job.projections {
            if *srid == NATIVE_SRID {
                continue;
            }
            for format in &formats {
                if !format.supports_reprojection() {
                    debug!(
                        format = format.slug(),
                        srid = srid,
                        "Format does not support reprojection, skipping"
                    );
                    continue;
                }
                let name = format!("Reprojection to EPSG:{srid} - {}", format.task_name());
                let task_id = self
                    .insert_task_row(record.id, &name, TaskCategory::Reproject, false, true)
                    .await?;
                steps.push(Step {
                    task_id,
                    name,
                    kind: StepKind::Reproject {
                        format: *format,
                        srid: *srid,
                    },
                    abort_on_error: false,
                    depends_on: Some(format.task_name().to_string()),
                });
            }
        }

        // Close out the provider: derive its terminal status.
        let finalize_id = self
            .insert_task_row(record.id, PROVIDER_FINALIZE_TASK, TaskCategory::Finalize, false, false)
            .await?;
        steps.push(Step {
            task_id: finalize_id,
            name: PROVIDER_FINALIZE_TASK.to_string(),
            kind: StepKind::ProviderFinalize,
            abort_on_error: false,
            depends_on: None,
        });

        // OSM collection is routed to its dedicated queue.
        let queue = if provider.service_type == ServiceType::Osm {
            osm_queue(worker)
        } else {
            worker_queue(worker)
        };

        Ok(ExecutableChain {
            run_id: run.id,
            provider_task_id: record.id,
            provider_slug: provider.slug,
            zoom,
            steps,
            queue,
            priority: TaskPriority::Default,
        })
    }

    /// Materialize the run-wide barrier chain (and archive task row).
    async fn build_barrier_chain(
        &self,
        run: &ExportRun,
        job: &Job,
        run_record: &ProviderTaskRecord,
        worker: &str,
    ) -> Result<ExecutableChain> {
        let existing = self.store.tasks_for_provider(run_record.id).await?;

        if job.include_archive && !existing.iter().any(|t| t.name == ARCHIVE_TASK) {
            self.insert_task_row(run_record.id, ARCHIVE_TASK, TaskCategory::Archive, false, true)
                .await?;
        }

        let finalize_id = match existing.iter().find(|t| t.name == RUN_FINALIZE_TASK) {
            Some(task) => task.id,
            None => {
                self.insert_task_row(
                    run_record.id,
                    RUN_FINALIZE_TASK,
                    TaskCategory::Finalize,
                    false,
                    false,
                )
                .await?
            }
        };

        Ok(ExecutableChain {
            run_id: run.id,
            provider_task_id: run_record.id,
            provider_slug: run_record.provider_slug.clone(),
            zoom: (0, 0),
            steps: vec![Step {
                task_id: finalize_id,
                name: RUN_FINALIZE_TASK.to_string(),
                kind: StepKind::RunFinalize,
                abort_on_error: false,
                depends_on: None,
            }],
            queue: priority_queue(worker),
            priority: TaskPriority::FinalizeRun,
        })
    }

    async fn insert_task_row(
        &self,
        provider_task_id: Uuid,
        name: &str,
        category: TaskCategory,
        abort_on_error: bool,
        display: bool,
    ) -> Result<Uuid> {
        let mut task = ExportTaskRecord::pending(provider_task_id, name, category);
        task.abort_on_error = abort_on_error;
        task.display = display;
        self.store.insert_task(&task).await?;
        Ok(task.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdmissionConfig;
    use crate::services::StaticEstimator;
    use crate::store::MemoryStateStore;

    fn catalog() -> ProviderCatalog {
        let mut osm = Provider::new("osm", "OpenStreetMap", ServiceType::Osm);
        osm.level_to = 10;
        let mut wms = Provider::new("wms-imagery", "Imagery (WMS)", ServiceType::Wms);
        wms.max_data_size_mb = Some(100.0);
        ProviderCatalog::new([osm, wms])
    }

    fn geometry() -> serde_json::Value {
        serde_json::json!({
            "type": "Polygon",
            "coordinates": [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0], [0.0, 0.0]]]
        })
    }

    async fn setup(
        requests: Vec<ProviderRequest>,
        estimator_size: f64,
    ) -> (Arc<MemoryStateStore>, TaskGraphCompiler, ExportRun, Job) {
        let store = Arc::new(MemoryStateStore::new());
        let admission = Arc::new(AdmissionController::new(
            Arc::new(StaticEstimator::new(estimator_size, 60.0)),
            AdmissionConfig::default(),
        ));
        let compiler = TaskGraphCompiler::new(
            store.clone(),
            Arc::new(catalog()),
            admission,
        );
        let job = Job::new("Test Export", "user", geometry(), requests).unwrap();
        store.insert_job(&job).await.unwrap();
        let run = ExportRun::submitted(job.id, "user", 14);
        store.insert_run(&run).await.unwrap();
        (store, compiler, run, job)
    }

    #[tokio::test]
    async fn test_single_provider_graph_shape() {
        let (store, compiler, run, _job) =
            setup(vec![ProviderRequest::new("osm", ["gpkg", "shp"])], 10.0).await;

        let chains = compiler.compile_run(&run, false, "worker-1").await.unwrap();
        // One provider chain plus the barrier chain.
        assert_eq!(chains.len(), 2);

        let osm = &chains[0];
        assert_eq!(osm.provider_slug, "osm");
        assert_eq!(osm.zoom, (0, 10));
        assert_eq!(osm.queue, "worker-1.osm");
        let names: Vec<&str> = osm.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "OpenStreetMap Data (.gpkg)",
                "Geopackage (.gpkg)",
                "ESRI Shapefile (.shp)",
                PROVIDER_FINALIZE_TASK,
            ]
        );
        assert!(osm.steps[0].abort_on_error);
        assert_eq!(osm.steps[1].depends_on.as_deref(), Some("OpenStreetMap Data (.gpkg)"));

        // No reprojection steps for a 4326-only job.
        assert!(!osm
            .steps
            .iter()
            .any(|s| matches!(s.kind, StepKind::Reproject { .. })));

        let barrier = &chains[1];
        assert_eq!(barrier.provider_slug, crate::constants::RUN_PROVIDER_SLUG);
        assert_eq!(barrier.priority, TaskPriority::FinalizeRun);

        // Task rows exist for every step plus the archive task.
        let records = store.provider_tasks_for_run(run.id).await.unwrap();
        assert_eq!(records.len(), 2);
        let run_record = records.iter().find(|r| r.is_run_record()).unwrap();
        let run_tasks = store.tasks_for_provider(run_record.id).await.unwrap();
        assert!(run_tasks.iter().any(|t| t.name == ARCHIVE_TASK));
        assert!(run_tasks.iter().any(|t| t.name == RUN_FINALIZE_TASK));
    }

    #[tokio::test]
    async fn test_reprojection_appended_after_native_pass() {
        let store = Arc::new(MemoryStateStore::new());
        let compiler = TaskGraphCompiler::new(
            store.clone(),
            Arc::new(catalog()),
            Arc::new(AdmissionController::new(
                Arc::new(StaticEstimator::new(10.0, 60.0)),
                AdmissionConfig::default(),
            )),
        );
        let mut job = Job::new(
            "Test Export",
            "user",
            geometry(),
            vec![ProviderRequest::new("osm", ["shp", "gpx"])],
        )
        .unwrap();
        job.projections.push(3857);
        store.insert_job(&job).await.unwrap();
        let run = ExportRun::submitted(job.id, "user", 14);
        store.insert_run(&run).await.unwrap();

        let chains = compiler.compile_run(&run, false, "worker-1").await.unwrap();
        let osm = &chains[0];
        let reprojections: Vec<&Step> = osm
            .steps
            .iter()
            .filter(|s| matches!(s.kind, StepKind::Reproject { .. }))
            .collect();
        // shp reprojects; gpx does not.
        assert_eq!(reprojections.len(), 1);
        assert_eq!(
            reprojections[0].depends_on.as_deref(),
            Some("ESRI Shapefile (.shp)")
        );
        let convert_index = osm
            .steps
            .iter()
            .position(|s| s.name == "ESRI Shapefile (.shp)")
            .unwrap();
        let reproject_index = osm
            .steps
            .iter()
            .position(|s| s.name == reprojections[0].name)
            .unwrap();
        assert!(reproject_index > convert_index);
    }

    #[tokio::test]
    async fn test_zero_formats_fails_before_any_state() {
        let (store, compiler, run, _job) =
            setup(vec![ProviderRequest::new("osm", ["xlsx", "docx"])], 10.0).await;
        let err = compiler.compile_run(&run, false, "worker-1").await.unwrap_err();
        assert!(matches!(err, ExportError::Validation(_)));
        // Nothing persisted: no provider tasks at all.
        assert!(store.provider_tasks_for_run(run.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_format_skipped_with_usable_remainder() {
        let (_store, compiler, run, _job) =
            setup(vec![ProviderRequest::new("osm", ["gpkg", "xlsx"])], 10.0).await;
        let chains = compiler.compile_run(&run, false, "worker-1").await.unwrap();
        let names: Vec<&str> = chains[0].steps.iter().map(|s| s.name.as_str()).collect();
        assert!(names.contains(&"Geopackage (.gpkg)"));
        assert_eq!(names.len(), 3); // collect + gpkg + finalize
    }

    #[tokio::test]
    async fn test_unknown_provider_skipped() {
        let (store, compiler, run, _job) = setup(
            vec![
                ProviderRequest::new("osm", ["gpkg"]),
                ProviderRequest::new("not-a-provider", ["gpkg"]),
            ],
            10.0,
        )
        .await;
        let chains = compiler.compile_run(&run, false, "worker-1").await.unwrap();
        // osm chain + barrier only.
        assert_eq!(chains.len(), 2);
        let records = store.provider_tasks_for_run(run.id).await.unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_admission_rejection_creates_nothing() {
        let (store, compiler, run, _job) = setup(
            vec![ProviderRequest::new("wms-imagery", ["geotiff"])],
            5_000.0, // over the provider's 100 MB cap
        )
        .await;
        let err = compiler.compile_run(&run, false, "worker-1").await.unwrap_err();
        match err {
            ExportError::AdmissionRejected { provider, .. } => {
                assert_eq!(provider, "wms-imagery")
            }
            other => panic!("expected AdmissionRejected, got {other:?}"),
        }
        assert!(store.provider_tasks_for_run(run.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recompile_skips_existing_providers() {
        let (store, compiler, run, _job) =
            setup(vec![ProviderRequest::new("osm", ["gpkg"])], 10.0).await;
        let first = compiler.compile_run(&run, false, "worker-1").await.unwrap();
        assert_eq!(first.len(), 2);

        // Second compile: the osm record exists, only the barrier returns.
        let second = compiler.compile_run(&run, false, "worker-1").await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].provider_slug, crate::constants::RUN_PROVIDER_SLUG);
        // No duplicate rows appeared.
        assert_eq!(store.provider_tasks_for_run(run.id).await.unwrap().len(), 2);
    }
}
