//! # Data Model
//!
//! Pure entity structs for the orchestration engine. Entities carry no
//! side-effecting accessors: every read and write goes through the
//! [`StateStore`](crate::store::StateStore) repository interface, and
//! ephemeral values (progress, ETA) live in the progress cache, not here.

pub mod export_task;
pub mod job;
pub mod provider;
pub mod provider_task;
pub mod run;
pub mod run_zip_file;

pub use export_task::{ExportTaskRecord, TaskCategory, TaskFailure, TaskResult};
pub use job::{Job, ProviderRequest};
pub use provider::{ExportFormat, Provider, ProviderCatalog, ServiceType};
pub use provider_task::ProviderTaskRecord;
pub use run::ExportRun;
pub use run_zip_file::RunZipFile;
