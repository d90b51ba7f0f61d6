//! # GeoExport Core
//!
//! Orchestration engine for exporting geospatial data from heterogeneous
//! providers (OSM, WMS/WMTS, WFS, WCS, ArcGIS, OGC API Process) into
//! user-selected formats as a single downloadable package.
//!
//! ## Overview
//!
//! Given a job (providers × formats × projections × geometry), the engine
//! compiles a per-provider task graph, dispatches it onto a worker pool,
//! tracks per-task / per-provider / per-run state, propagates cancellation
//! and failure, enforces admission control against a size/time estimator,
//! and finalizes the run (archive assembly, user notification) once every
//! provider branch reaches a terminal state.
//!
//! ## Module Organization
//!
//! - [`models`] - Pure entity structs (jobs, runs, provider tasks, tasks)
//! - [`state_machine`] - Status vocabulary, task transitions, aggregation
//! - [`store`] - State store repository interface + in-memory and Postgres
//! - [`cache`] - TTL'd progress cache, decoupled from durable state
//! - [`services`] - External collaborator contracts and test doubles
//! - [`orchestration`] - Compiler, admission, cancellation, finalization
//! - [`execution`] - Substrate contract, local worker pool, step handlers
//! - [`config`] - YAML-backed operational configuration
//! - [`error`] - Error taxonomy (and the non-error cancellation signal)
//! - [`events`] - Lifecycle event bus
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use geoexport_core::cache::MemoryProgressCache;
//! use geoexport_core::config::OrchestratorConfig;
//! use geoexport_core::models::{Provider, ProviderCatalog, ServiceType};
//! use geoexport_core::orchestration::{Collaborators, Orchestrator};
//! use geoexport_core::services::{
//!     LogNotifier, RecordingArchiver, RecordingCollector, RecordingConverter, StaticEstimator,
//! };
//! use geoexport_core::store::MemoryStateStore;
//!
//! # fn main() {
//! let catalog = ProviderCatalog::new([Provider::new("osm", "OpenStreetMap", ServiceType::Osm)]);
//! let orchestrator = Orchestrator::local(
//!     Arc::new(MemoryStateStore::new()),
//!     Arc::new(MemoryProgressCache::new()),
//!     Arc::new(catalog),
//!     OrchestratorConfig::default(),
//!     Collaborators {
//!         estimator: Arc::new(StaticEstimator::new(10.0, 60.0)),
//!         collector: Arc::new(RecordingCollector::new()),
//!         converter: Arc::new(RecordingConverter::new()),
//!         archiver: Arc::new(RecordingArchiver::new()),
//!         notifier: Arc::new(LogNotifier),
//!     },
//!     "worker-1",
//! );
//! # let _ = orchestrator;
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod execution;
pub mod geo;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod services;
pub mod state_machine;
pub mod store;

pub use config::OrchestratorConfig;
pub use error::{CancellationSignal, ExportError, Result};
pub use geo::Bbox;
pub use orchestration::{Collaborators, FinalizeDecision, Orchestrator};
pub use state_machine::TaskState;
