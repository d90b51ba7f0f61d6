//! # Step Handlers
//!
//! One handler per work-step kind, dispatched through an explicit typed
//! table built at startup — the type system, not a string registry, decides
//! what runs. Handlers return [`StepOutcome`]: cancellation is a first-class
//! outcome, never an error a caller has to pattern-match out of a failure.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use crate::cache::ProgressCache;
use crate::error::{CancellationSignal, ExportError, Result};
use crate::models::{
    ExportFormat, ExportRun, ExportTaskRecord, Job, Provider, ProviderTaskRecord,
};
use crate::orchestration::area::with_area_splitting;
use crate::orchestration::progress::ProgressHandle;
use crate::orchestration::task_graph::{Step, StepKind};
use crate::services::{CollectionRequest, Collector, ConversionRequest, Converter};
use crate::state_machine::TaskState;

use super::token::CancellationToken;

/// What a step produced.
#[derive(Debug)]
pub enum StepOutcome {
    /// Work done; `artifact` is the produced file when the step makes one.
    Success { artifact: Option<PathBuf> },
    /// A cancel was observed at a safe point; the step unwound cleanly.
    Canceled(CancellationSignal),
}

/// Everything a handler needs to run one step.
pub struct StepContext {
    pub run: ExportRun,
    pub job: Job,
    /// The configured provider; absent for the reserved "run" chain.
    pub provider: Option<Provider>,
    pub provider_task: ProviderTaskRecord,
    pub task: ExportTaskRecord,
    pub step: Step,
    pub zoom: (u8, u8),
    pub stage_dir: PathBuf,
    /// Artifact of the step this one depends on.
    pub input: Option<PathBuf>,
    pub token: CancellationToken,
    pub progress: ProgressHandle,
    pub cache: Arc<dyn ProgressCache>,
}

impl StepContext {
    /// Multi-point cancel check: the in-process token plus the cache flag an
    /// out-of-process canceller may have set.
    pub async fn cancel_requested(&self) -> bool {
        if self.token.is_canceled() {
            return true;
        }
        matches!(
            self.cache.get("ExportTaskRecord", self.task.id, "status").await,
            Some(value) if value == json!(TaskState::Canceled.to_string())
        )
    }

    fn cancellation_signal(&self) -> CancellationSignal {
        CancellationSignal::new(self.task.name.clone(), self.task.cancel_user.clone())
    }

    fn output_path(&self, format: ExportFormat, srid: Option<i32>) -> PathBuf {
        let provider = self
            .provider
            .as_ref()
            .map(|p| p.slug.as_str())
            .unwrap_or(&self.provider_task.provider_slug);
        let name = match srid {
            Some(srid) => format!(
                "{}-{}-{}-{}.{}",
                self.job.normalized_name(),
                provider,
                format.slug(),
                srid,
                format.extension()
            ),
            None => format!(
                "{}-{}-{}.{}",
                self.job.normalized_name(),
                provider,
                format.slug(),
                format.extension()
            ),
        };
        self.stage_dir.join(name)
    }
}

/// A step execution unit.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutcome>;
}

/// Primary provider-specific collection, with area-limit recovery.
pub struct CollectHandler {
    collector: Arc<dyn Collector>,
    max_split_depth: u32,
}

impl CollectHandler {
    pub fn new(collector: Arc<dyn Collector>, max_split_depth: u32) -> Self {
        Self {
            collector,
            max_split_depth,
        }
    }
}

#[async_trait]
impl StepHandler for CollectHandler {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutcome> {
        if ctx.cancel_requested().await {
            return Ok(StepOutcome::Canceled(ctx.cancellation_signal()));
        }
        let provider = ctx.provider.clone().ok_or_else(|| {
            ExportError::Validation(format!(
                "No provider configured for collection step '{}'",
                ctx.step.name
            ))
        })?;

        let outcome = with_area_splitting(ctx.job.bbox, self.max_split_depth, |bbox| {
            let request = CollectionRequest {
                provider: provider.clone(),
                bbox,
                zoom: ctx.zoom,
                geometry: ctx.job.geometry.clone(),
                stage_dir: ctx.stage_dir.clone(),
            };
            self.collector.collect(request, &ctx.token, &ctx.progress)
        })
        .await;

        match outcome {
            Ok(artifacts) => {
                if ctx.token.is_canceled() {
                    return Ok(StepOutcome::Canceled(ctx.cancellation_signal()));
                }
                let artifact = artifacts.into_iter().last().ok_or_else(|| {
                    ExportError::Conversion("Collection produced no artifact".into())
                })?;
                Ok(StepOutcome::Success {
                    artifact: Some(artifact),
                })
            }
            // A collector unwinding because its token tripped is a cancel,
            // not a failure.
            Err(_) if ctx.token.is_canceled() => {
                Ok(StepOutcome::Canceled(ctx.cancellation_signal()))
            }
            Err(err) => Err(err),
        }
    }
}

/// Format conversion of the interchange artifact.
pub struct ConvertHandler {
    converter: Arc<dyn Converter>,
}

impl ConvertHandler {
    pub fn new(converter: Arc<dyn Converter>) -> Self {
        Self { converter }
    }

    async fn run_conversion(
        &self,
        ctx: &StepContext,
        format: ExportFormat,
        srid: Option<i32>,
    ) -> Result<StepOutcome> {
        if ctx.cancel_requested().await {
            return Ok(StepOutcome::Canceled(ctx.cancellation_signal()));
        }
        let input = ctx.input.clone().ok_or_else(|| {
            ExportError::Validation(format!("Step '{}' has no input artifact", ctx.step.name))
        })?;

        let request = ConversionRequest {
            driver: format.driver().to_string(),
            inputs: vec![input],
            output: ctx.output_path(format, srid),
            boundary: Some(ctx.job.geometry.clone()),
            srid,
        };
        match self.converter.convert(request, &ctx.token).await {
            Ok(output) => {
                if ctx.token.is_canceled() {
                    return Ok(StepOutcome::Canceled(ctx.cancellation_signal()));
                }
                ctx.progress.report(100.0).await;
                Ok(StepOutcome::Success {
                    artifact: Some(output),
                })
            }
            Err(_) if ctx.token.is_canceled() => {
                Ok(StepOutcome::Canceled(ctx.cancellation_signal()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl StepHandler for ConvertHandler {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutcome> {
        let StepKind::Convert { format } = ctx.step.kind else {
            return Err(ExportError::Validation(format!(
                "Convert handler dispatched for non-convert step '{}'",
                ctx.step.name
            )));
        };
        self.run_conversion(ctx, format, None).await
    }
}

/// Reprojection of a format's native-projection output.
pub struct ReprojectHandler {
    converter: Arc<dyn Converter>,
}

impl ReprojectHandler {
    pub fn new(converter: Arc<dyn Converter>) -> Self {
        Self { converter }
    }
}

#[async_trait]
impl StepHandler for ReprojectHandler {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutcome> {
        let StepKind::Reproject { format, srid } = ctx.step.kind else {
            return Err(ExportError::Validation(format!(
                "Reproject handler dispatched for non-reproject step '{}'",
                ctx.step.name
            )));
        };
        ConvertHandler::new(Arc::clone(&self.converter))
            .run_conversion(ctx, format, Some(srid))
            .await
    }
}

/// The typed dispatch table. Built once at startup; work kinds resolve
/// through an exhaustive match, finalize kinds are control flow owned by the
/// chain runner and have no handler here.
pub struct HandlerRegistry {
    collect: Arc<dyn StepHandler>,
    convert: Arc<dyn StepHandler>,
    reproject: Arc<dyn StepHandler>,
}

impl HandlerRegistry {
    pub fn new(
        collector: Arc<dyn Collector>,
        converter: Arc<dyn Converter>,
        max_split_depth: u32,
    ) -> Self {
        Self {
            collect: Arc::new(CollectHandler::new(collector, max_split_depth)),
            convert: Arc::new(ConvertHandler::new(Arc::clone(&converter))),
            reproject: Arc::new(ReprojectHandler::new(converter)),
        }
    }

    /// Handler for a work step. `None` for finalize kinds.
    pub fn work_handler(&self, kind: &StepKind) -> Option<&dyn StepHandler> {
        match kind {
            StepKind::Collect(_) => Some(self.collect.as_ref()),
            StepKind::Convert { .. } => Some(self.convert.as_ref()),
            StepKind::Reproject { .. } => Some(self.reproject.as_ref()),
            StepKind::ProviderFinalize | StepKind::RunFinalize => None,
        }
    }
}

/// Download path for a produced artifact.
pub fn download_url(run_id: Uuid, provider_slug: &str, filename: &str) -> String {
    format!("downloads/{run_id}/{provider_slug}/{filename}")
}
