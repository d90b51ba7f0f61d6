//! Admission control.
//!
//! The gate between a run request and any worker resource: size and duration
//! estimates are checked against per-provider caps before a single task row
//! exists. Elevated callers bypass the caps; an unreachable estimator
//! degrades to "unknown — do not block" after a bounded grace timeout, so
//! the statistics service can never take run creation down with it.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::config::AdmissionConfig;
use crate::error::{ExportError, Result};
use crate::geo::Bbox;
use crate::models::Provider;
use crate::services::{AdmissionEstimator, EstimateKind};

/// Estimates recorded for a provider task at compile time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AdmissionEstimates {
    pub size_mb: Option<f64>,
    pub duration_secs: Option<f64>,
}

/// Applies estimator output against provider caps.
pub struct AdmissionController {
    estimator: Arc<dyn AdmissionEstimator>,
    config: AdmissionConfig,
}

impl AdmissionController {
    pub fn new(estimator: Arc<dyn AdmissionEstimator>, config: AdmissionConfig) -> Self {
        Self { estimator, config }
    }

    /// Check one provider request. Returns the estimates for recording, or
    /// [`ExportError::AdmissionRejected`] naming the offending provider.
    /// `elevated` callers are never rejected but still get estimates.
    pub async fn check(
        &self,
        provider: &Provider,
        bbox: &Bbox,
        zoom: (u8, u8),
        elevated: bool,
    ) -> Result<AdmissionEstimates> {
        let size_mb = self.estimate(EstimateKind::Size, provider, bbox, zoom).await;
        let duration_secs = self
            .estimate(EstimateKind::Duration, provider, bbox, zoom)
            .await;

        if !elevated {
            let size_cap = provider
                .max_data_size_mb
                .unwrap_or(self.config.default_max_data_size_mb);
            if let Some(size) = size_mb {
                if size > size_cap {
                    return Err(ExportError::AdmissionRejected {
                        provider: provider.slug.clone(),
                        kind: EstimateKind::Size.as_str(),
                        estimate: size,
                        cap: size_cap,
                    });
                }
            }

            let duration_cap = provider
                .max_duration_secs
                .unwrap_or(self.config.default_max_duration_secs);
            if let Some(duration) = duration_secs {
                if duration > duration_cap {
                    return Err(ExportError::AdmissionRejected {
                        provider: provider.slug.clone(),
                        kind: EstimateKind::Duration.as_str(),
                        estimate: duration,
                        cap: duration_cap,
                    });
                }
            }
        }

        Ok(AdmissionEstimates {
            size_mb,
            duration_secs,
        })
    }

    /// One estimator call under the grace timeout. Failure or timeout is a
    /// logged `None`, never an error.
    async fn estimate(
        &self,
        kind: EstimateKind,
        provider: &Provider,
        bbox: &Bbox,
        zoom: (u8, u8),
    ) -> Option<f64> {
        let timeout = Duration::from_millis(self.config.estimate_timeout_ms);
        match tokio::time::timeout(timeout, self.estimator.estimate(kind, provider, bbox, zoom))
            .await
        {
            Ok(Ok(estimate)) => Some(estimate.value),
            Ok(Err(err)) => {
                warn!(
                    provider = %provider.slug,
                    kind = kind.as_str(),
                    error = %err,
                    "Estimator failed, admitting as unknown"
                );
                None
            }
            Err(_) => {
                warn!(
                    provider = %provider.slug,
                    kind = kind.as_str(),
                    "Estimator timed out, admitting as unknown"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ServiceType;
    use crate::services::{StaticEstimator, UnavailableEstimator};

    fn provider_with_cap(cap_mb: f64) -> Provider {
        let mut provider = Provider::new("osm", "OpenStreetMap", ServiceType::Osm);
        provider.max_data_size_mb = Some(cap_mb);
        provider
    }

    fn bbox() -> Bbox {
        Bbox::new(0.0, 0.0, 1.0, 1.0).unwrap()
    }

    #[tokio::test]
    async fn test_within_cap_is_admitted() {
        let controller = AdmissionController::new(
            Arc::new(StaticEstimator::new(50.0, 120.0)),
            AdmissionConfig::default(),
        );
        let estimates = controller
            .check(&provider_with_cap(100.0), &bbox(), (0, 10), false)
            .await
            .unwrap();
        assert_eq!(estimates.size_mb, Some(50.0));
        assert_eq!(estimates.duration_secs, Some(120.0));
    }

    #[tokio::test]
    async fn test_over_cap_is_rejected_with_provider_name() {
        let controller = AdmissionController::new(
            Arc::new(StaticEstimator::new(500.0, 120.0)),
            AdmissionConfig::default(),
        );
        let err = controller
            .check(&provider_with_cap(100.0), &bbox(), (0, 10), false)
            .await
            .unwrap_err();
        match err {
            ExportError::AdmissionRejected { provider, estimate, cap, .. } => {
                assert_eq!(provider, "osm");
                assert_eq!(estimate, 500.0);
                assert_eq!(cap, 100.0);
            }
            other => panic!("expected AdmissionRejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_elevated_caller_bypasses_cap() {
        let controller = AdmissionController::new(
            Arc::new(StaticEstimator::new(500.0, 120.0)),
            AdmissionConfig::default(),
        );
        let estimates = controller
            .check(&provider_with_cap(100.0), &bbox(), (0, 10), true)
            .await
            .unwrap();
        assert_eq!(estimates.size_mb, Some(500.0));
    }

    #[tokio::test]
    async fn test_estimator_failure_does_not_block() {
        let controller = AdmissionController::new(
            Arc::new(UnavailableEstimator),
            AdmissionConfig::default(),
        );
        let estimates = controller
            .check(&provider_with_cap(100.0), &bbox(), (0, 10), false)
            .await
            .unwrap();
        assert_eq!(estimates, AdmissionEstimates::default());
    }

    #[tokio::test]
    async fn test_default_cap_applies_without_provider_cap() {
        let mut config = AdmissionConfig::default();
        config.default_max_data_size_mb = 10.0;
        let controller =
            AdmissionController::new(Arc::new(StaticEstimator::new(50.0, 1.0)), config);
        let provider = Provider::new("wfs-1", "Some WFS", ServiceType::Wfs);
        assert!(controller.check(&provider, &bbox(), (0, 10), false).await.is_err());
    }
}
