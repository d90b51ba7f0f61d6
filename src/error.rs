//! # Structured Error Handling
//!
//! Central error taxonomy for the export orchestration engine. Every failure
//! that can cross a module boundary is a variant here; module-local errors
//! (store, substrate, collaborators) convert into it at the seam.
//!
//! Cancellation is deliberately NOT part of this taxonomy: a user cancel is a
//! normal, expected unwind path carried by [`CancellationSignal`] through
//! `StepOutcome::Canceled`, never through `Err`.

use uuid::Uuid;

use crate::geo::Bbox;
use crate::store::StoreError;

/// Errors surfaced by the orchestration engine.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// Bad request shape. Surfaced to the caller before any state is created.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The admission estimator predicted an export over the configured cap.
    /// Raised before any task row exists; never retried.
    #[error(
        "Admission rejected for provider '{provider}': estimated {estimate:.1} exceeds cap {cap:.1} ({kind})"
    )]
    AdmissionRejected {
        provider: String,
        kind: &'static str,
        estimate: f64,
        cap: f64,
    },

    /// An upstream source refused the requested area. Retryable by splitting
    /// the bounding box into quadrants, bounded by the configured depth.
    #[error("Area limit exceeded for bbox {bbox}")]
    AreaLimitExceeded { bbox: Bbox },

    /// A format conversion failed.
    #[error("Conversion error: {0}")]
    Conversion(String),

    /// A task exceeded its hard execution-time limit.
    #[error("Task time limit of {limit_secs}s exceeded. Try again or contact us.")]
    TimeLimitExceeded { limit_secs: u64 },

    /// Archive assembly failed during run finalization.
    #[error("Archive error: {0}")]
    Archive(String),

    /// State store failure.
    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    /// Execution substrate failure (submit/cancel).
    #[error("Execution substrate error: {0}")]
    Substrate(String),

    /// Invalid or unloadable configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A referenced record does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: Uuid },
}

impl ExportError {
    /// Only `AreaLimitExceeded` is automatically retried (by quadrant split);
    /// everything else converts the task to a terminal failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::AreaLimitExceeded { .. })
    }

    pub fn not_found(kind: &'static str, id: Uuid) -> Self {
        Self::NotFound { kind, id }
    }
}

pub type Result<T> = std::result::Result<T, ExportError>;

/// A cancellation observed by a task. This is an expected unwind path, not an
/// error: handlers return it inside `StepOutcome::Canceled` so that no caller
/// ever has to distinguish "user cancelled" from "bug" by error matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancellationSignal {
    /// Name of the task (or provider task) that observed the cancel.
    pub task_name: String,
    /// The user that requested the cancel, when known.
    pub user: Option<String>,
}

impl CancellationSignal {
    pub fn new(task_name: impl Into<String>, user: Option<String>) -> Self {
        Self {
            task_name: task_name.into(),
            user,
        }
    }
}

impl std::fmt::Display for CancellationSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.user {
            Some(user) => write!(f, "{} canceled by {user}", self.task_name),
            None => write!(f, "{} canceled", self.task_name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let area = ExportError::AreaLimitExceeded {
            bbox: Bbox::new(-10.0, -10.0, 10.0, 10.0).unwrap(),
        };
        assert!(area.is_retryable());
        assert!(!ExportError::Conversion("bad driver".into()).is_retryable());
        assert!(!ExportError::TimeLimitExceeded { limit_secs: 60 }.is_retryable());
    }

    #[test]
    fn test_admission_rejected_names_provider() {
        let err = ExportError::AdmissionRejected {
            provider: "osm".into(),
            kind: "size",
            estimate: 1200.0,
            cap: 100.0,
        };
        assert!(err.to_string().contains("osm"));
    }

    #[test]
    fn test_cancellation_signal_display() {
        let signal = CancellationSignal::new("OpenStreetMap Data", Some("admin".into()));
        assert_eq!(signal.to_string(), "OpenStreetMap Data canceled by admin");
    }
}
