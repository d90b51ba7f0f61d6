//! # External Collaborators
//!
//! Call contracts for the services the orchestrator consumes but does not
//! implement: the admission estimator, source collectors, the conversion
//! tool, the archiver, and the notifier. Each seam ships a recording double
//! used by the scenario tests.

pub mod archiver;
pub mod collector;
pub mod converter;
pub mod estimator;
pub mod notifier;

pub use archiver::{ArchiveError, ArchiveManifest, Archiver, RecordingArchiver};
pub use collector::{CollectionRequest, Collector, RecordingCollector};
pub use converter::{ConversionError, ConversionRequest, Converter, RecordingConverter};
pub use estimator::{
    AdmissionEstimator, Estimate, EstimateKind, EstimatorError, StaticEstimator,
    UnavailableEstimator,
};
pub use notifier::{
    LogNotifier, Notification, NotificationLevel, NotificationVerb, Notifier, NotifyError,
    RecordingNotifier,
};
