//! Source collection contract.
//!
//! The primary, provider-specific fetch: OSM extraction, WFS/WCS/ArcGIS
//! queries, raster tiling, OGC API process polling. Protocol details are out
//! of scope; the orchestrator hands over the provider, area, zoom range, and
//! a staging directory, and expects the interchange artifact back.
//!
//! Collectors signal an upstream area refusal by returning
//! [`ExportError::AreaLimitExceeded`], which the orchestrator recovers from
//! by quadrant-splitting the bounding box.

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::error::ExportError;
use crate::execution::token::CancellationToken;
use crate::geo::Bbox;
use crate::models::Provider;
use crate::orchestration::progress::ProgressHandle;

/// One collection invocation.
#[derive(Debug, Clone)]
pub struct CollectionRequest {
    pub provider: Provider,
    pub bbox: Bbox,
    pub zoom: (u8, u8),
    /// GeoJSON selection the source should honor, when it can.
    pub geometry: Value,
    pub stage_dir: PathBuf,
}

/// The source collection contract.
#[async_trait]
pub trait Collector: Send + Sync {
    async fn collect(
        &self,
        request: CollectionRequest,
        token: &CancellationToken,
        progress: &ProgressHandle,
    ) -> Result<PathBuf, ExportError>;
}

/// Recording double: produces a staged artifact path per request, with
/// scriptable failures and per-bbox area refusals.
#[derive(Default)]
pub struct RecordingCollector {
    pub requests: parking_lot::Mutex<Vec<CollectionRequest>>,
    pub fail_with: parking_lot::Mutex<Option<String>>,
    /// Refuse any bbox wider than this, raising the area limit.
    pub max_bbox_width: parking_lot::Mutex<Option<f64>>,
}

impl RecordingCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(message: impl Into<String>) -> Self {
        let collector = Self::default();
        *collector.fail_with.lock() = Some(message.into());
        collector
    }

    pub fn with_area_limit(width: f64) -> Self {
        let collector = Self::default();
        *collector.max_bbox_width.lock() = Some(width);
        collector
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn collected_bboxes(&self) -> Vec<Bbox> {
        self.requests.lock().iter().map(|r| r.bbox).collect()
    }
}

#[async_trait]
impl Collector for RecordingCollector {
    async fn collect(
        &self,
        request: CollectionRequest,
        token: &CancellationToken,
        progress: &ProgressHandle,
    ) -> Result<PathBuf, ExportError> {
        if token.is_canceled() {
            // The wrapper aborts cleanly; the handler turns the token state
            // into a cancellation outcome.
            return Err(ExportError::Conversion("collection aborted".into()));
        }
        if let Some(message) = self.fail_with.lock().clone() {
            return Err(ExportError::Conversion(message));
        }
        if let Some(max_width) = *self.max_bbox_width.lock() {
            if request.bbox.east - request.bbox.west > max_width {
                return Err(ExportError::AreaLimitExceeded { bbox: request.bbox });
            }
        }
        progress.report(100.0).await;
        let artifact = artifact_path(&request.stage_dir, &request.provider.slug);
        self.requests.lock().push(request);
        Ok(artifact)
    }
}

fn artifact_path(stage_dir: &Path, slug: &str) -> PathBuf {
    stage_dir.join(format!("{slug}.gpkg"))
}
