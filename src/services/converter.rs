//! Conversion tool contract.
//!
//! Wraps the external format-conversion tooling (GDAL/OGR style). Command
//! construction is out of scope; the orchestrator hands over a driver,
//! inputs, an output path, an optional clip boundary and target srid, plus a
//! cancellation token the wrapper must honor at safe points.

use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;

use crate::error::ExportError;
use crate::execution::token::CancellationToken;

/// One conversion invocation.
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    /// Driver slug, e.g. `"ESRI Shapefile"` or `"gtiff"`.
    pub driver: String,
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    /// GeoJSON clip boundary.
    pub boundary: Option<Value>,
    /// Target srid; `None` keeps the native projection.
    pub srid: Option<i32>,
}

/// Errors from the conversion tool.
#[derive(Debug, thiserror::Error)]
#[error("Conversion failed ({driver}): {message}")]
pub struct ConversionError {
    pub driver: String,
    pub message: String,
}

impl From<ConversionError> for ExportError {
    fn from(err: ConversionError) -> Self {
        ExportError::Conversion(err.to_string())
    }
}

/// The conversion tool contract.
#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(
        &self,
        request: ConversionRequest,
        token: &CancellationToken,
    ) -> Result<PathBuf, ConversionError>;
}

/// Recording double: returns the requested output path, remembers requests,
/// and optionally fails on matching drivers.
#[derive(Debug, Default)]
pub struct RecordingConverter {
    pub requests: parking_lot::Mutex<Vec<ConversionRequest>>,
    pub fail_drivers: parking_lot::Mutex<Vec<String>>,
}

impl RecordingConverter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_driver(self, driver: impl Into<String>) -> Self {
        self.fail_drivers.lock().push(driver.into());
        self
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl Converter for RecordingConverter {
    async fn convert(
        &self,
        request: ConversionRequest,
        _token: &CancellationToken,
    ) -> Result<PathBuf, ConversionError> {
        if self.fail_drivers.lock().contains(&request.driver) {
            return Err(ConversionError {
                driver: request.driver,
                message: "simulated failure".into(),
            });
        }
        let output = request.output.clone();
        self.requests.lock().push(request);
        Ok(output)
    }
}
