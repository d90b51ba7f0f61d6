//! Admission estimator contract.
//!
//! A statistics-backed collaborator predicting export size and duration
//! before any work starts. Its internal math is out of scope; only the call
//! contract lives here. The estimator is consulted before any task row is
//! created, and its unavailability must never block run creation.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

use crate::geo::Bbox;
use crate::models::Provider;

/// What is being estimated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EstimateKind {
    /// Output size in megabytes.
    Size,
    /// Wall-clock duration in seconds.
    Duration,
}

impl EstimateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Size => "size",
            Self::Duration => "duration",
        }
    }
}

/// A single estimate with collaborator-defined metadata.
#[derive(Debug, Clone)]
pub struct Estimate {
    pub value: f64,
    pub meta: HashMap<String, Value>,
}

impl Estimate {
    pub fn of(value: f64) -> Self {
        Self {
            value,
            meta: HashMap::new(),
        }
    }
}

/// Errors from the estimator collaborator. Treated as "unknown — do not
/// block" by admission control.
#[derive(Debug, thiserror::Error)]
pub enum EstimatorError {
    #[error("Estimator unavailable: {0}")]
    Unavailable(String),

    #[error("Estimator timed out")]
    Timeout,
}

/// The admission estimator call contract.
#[async_trait]
pub trait AdmissionEstimator: Send + Sync {
    async fn estimate(
        &self,
        kind: EstimateKind,
        provider: &Provider,
        bbox: &Bbox,
        zoom: (u8, u8),
    ) -> Result<Estimate, EstimatorError>;
}

/// Fixed-value estimator for tests and wiring without a statistics service.
#[derive(Debug, Clone)]
pub struct StaticEstimator {
    pub size_mb: f64,
    pub duration_secs: f64,
}

impl StaticEstimator {
    pub fn new(size_mb: f64, duration_secs: f64) -> Self {
        Self {
            size_mb,
            duration_secs,
        }
    }
}

#[async_trait]
impl AdmissionEstimator for StaticEstimator {
    async fn estimate(
        &self,
        kind: EstimateKind,
        _provider: &Provider,
        _bbox: &Bbox,
        _zoom: (u8, u8),
    ) -> Result<Estimate, EstimatorError> {
        Ok(Estimate::of(match kind {
            EstimateKind::Size => self.size_mb,
            EstimateKind::Duration => self.duration_secs,
        }))
    }
}

/// Estimator that always fails, for exercising the do-not-block grace path.
#[derive(Debug, Clone, Default)]
pub struct UnavailableEstimator;

#[async_trait]
impl AdmissionEstimator for UnavailableEstimator {
    async fn estimate(
        &self,
        _kind: EstimateKind,
        _provider: &Provider,
        _bbox: &Bbox,
        _zoom: (u8, u8),
    ) -> Result<Estimate, EstimatorError> {
        Err(EstimatorError::Unavailable("statistics service down".into()))
    }
}
