//! # Finalization Barrier
//!
//! The sole synchronization point joining all provider chains of a run.
//! Invoked as the run-wide barrier task: it waits (bounded exponential
//! backoff) for every provider task to reach a terminal state, derives the
//! run's status, assembles the whole-run archive when requested, releases
//! staging, notifies the user with an outcome-specific subject, and
//! enforces run retention.
//!
//! The barrier is idempotent and safe under at-least-once delivery: a run
//! already terminal short-circuits, the notification stamp is single-use,
//! and status derivation is a pure function of provider states. A failure
//! inside finalization itself (archive assembly included) marks the run
//! INCOMPLETE through a distinct errback path — a run never stays RUNNING
//! forever.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::constants::events;
use crate::error::{ExportError, Result};
use crate::events::EventPublisher;
use crate::models::{
    ExportRun, Job, ProviderTaskRecord, RunZipFile, TaskFailure, TaskResult,
};
use crate::services::{
    ArchiveManifest, Archiver, Notification, NotificationLevel, NotificationVerb, Notifier,
};
use crate::state_machine::{derive_provider_status, derive_run_status, TaskState};
use crate::store::StateStore;

use super::compiler::ARCHIVE_TASK;
use super::runs::enforce_retention;

/// Outcome of a barrier invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeDecision {
    /// The run was already terminal; nothing was repeated.
    AlreadyFinalized(TaskState),
    /// All providers were terminal and the run finalized normally.
    Finalized(TaskState),
    /// Providers never became terminal within the retry budget; the run was
    /// degraded to INCOMPLETE instead of finalizing on a partial view.
    Degraded(TaskState),
}

/// The run-wide finalization barrier.
pub struct FinalizationBarrier {
    store: Arc<dyn StateStore>,
    archiver: Arc<dyn Archiver>,
    notifier: Arc<dyn Notifier>,
    publisher: EventPublisher,
    config: OrchestratorConfig,
}

impl FinalizationBarrier {
    pub fn new(
        store: Arc<dyn StateStore>,
        archiver: Arc<dyn Archiver>,
        notifier: Arc<dyn Notifier>,
        publisher: EventPublisher,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            archiver,
            notifier,
            publisher,
            config,
        }
    }

    /// Derive and persist a provider task's terminal status from its work
    /// tasks. Idempotent: an already-finished record is returned unchanged.
    pub async fn finalize_provider(&self, provider_task_id: Uuid) -> Result<TaskState> {
        let record = self
            .store
            .provider_task(provider_task_id)
            .await?
            .ok_or(ExportError::not_found("provider task", provider_task_id))?;
        if record.status.is_finished() {
            return Ok(record.status);
        }

        // The chain runner marks every work step terminal before the
        // finalize step runs; a short re-check covers slow distributed
        // completion only.
        let mut derived = None;
        for attempt in 0..3 {
            let tasks = self.store.tasks_for_provider(provider_task_id).await?;
            let work_states: Vec<TaskState> = tasks
                .iter()
                .filter(|t| t.category.is_work())
                .map(|t| t.status)
                .collect();
            if work_states.is_empty() {
                // Nothing to aggregate (a bookkeeping record without an
                // archive step): vacuously complete.
                derived = Some(TaskState::Completed);
                break;
            }
            derived = derive_provider_status(&work_states);
            if derived.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100 * (attempt + 1))).await;
        }

        let status = match derived {
            Some(status) => status,
            None => {
                warn!(
                    provider_task = %provider_task_id,
                    "Work tasks never became terminal, degrading provider to INCOMPLETE"
                );
                TaskState::Incomplete
            }
        };

        let applied = self
            .store
            .update_provider_task_status(
                provider_task_id,
                &[TaskState::Pending, TaskState::Running],
                status,
            )
            .await?;
        if applied {
            self.store
                .set_provider_task_finished(provider_task_id)
                .await?;
            let event = match status {
                TaskState::Completed => events::PROVIDER_COMPLETED,
                TaskState::Canceled => events::PROVIDER_CANCELED,
                _ => events::PROVIDER_INCOMPLETE,
            };
            self.publisher
                .publish(event, json!({ "provider_task_id": provider_task_id }));
            Ok(status)
        } else {
            // Another writer finalized the record first; report theirs.
            let current = self
                .store
                .provider_task(provider_task_id)
                .await?
                .ok_or(ExportError::not_found("provider task", provider_task_id))?;
            Ok(current.status)
        }
    }

    /// Await every provider chain of a run, then finalize it.
    pub async fn wait_for_providers(&self, run_id: Uuid) -> Result<FinalizeDecision> {
        let run = self
            .store
            .run(run_id)
            .await?
            .ok_or(ExportError::not_found("run", run_id))?;
        if run.status.is_finished() {
            info!(run_id = %run_id, status = %run.status, "Run already finalized");
            return Ok(FinalizeDecision::AlreadyFinalized(run.status));
        }

        let job = self
            .store
            .job(run.job_id)
            .await?
            .ok_or(ExportError::not_found("job", run.job_id))?;

        // Bounded exponential backoff against slow distributed completion.
        // Finalizing on a partial view would under-report the run's outcome.
        let mut all_terminal = false;
        for attempt in 0..self.config.finalize.max_retries {
            let providers = self.provider_records(run_id).await?;
            if !providers.is_empty() && providers.iter().all(ProviderTaskRecord::is_finished) {
                all_terminal = true;
                break;
            }
            let delay = self.backoff(attempt);
            info!(
                run_id = %run_id,
                attempt = attempt,
                delay_secs = delay.as_secs_f64(),
                "Waiting for provider chains to finish"
            );
            tokio::time::sleep(delay).await;
        }

        if !all_terminal {
            warn!(
                run_id = %run_id,
                "Provider chains never became terminal within the retry budget, degrading run"
            );
            self.apply_terminal(&run, &job, TaskState::Incomplete, true)
                .await?;
            return Ok(FinalizeDecision::Degraded(TaskState::Incomplete));
        }

        // Archive assembly happens inside finalization; its failure makes
        // the run INCOMPLETE but never leaves it RUNNING.
        let mut finalize_failed = false;
        if job.include_archive {
            finalize_failed = !self.build_run_archive(&run, &job).await?;
        }

        // Close out the bookkeeping record, then derive the run status.
        if let Some(run_record) = self.run_record(run_id).await? {
            self.finalize_provider(run_record.id).await?;
        }

        let provider_states: Vec<TaskState> = self
            .provider_records(run_id)
            .await?
            .iter()
            .map(|r| r.status)
            .collect();
        let mut status = derive_run_status(&provider_states).unwrap_or(TaskState::Incomplete);
        if finalize_failed {
            status = TaskState::Incomplete;
        }

        self.apply_terminal(&run, &job, status, finalize_failed).await?;
        Ok(FinalizeDecision::Finalized(status))
    }

    /// Provider records of a run, excluding the reserved bookkeeping record.
    async fn provider_records(&self, run_id: Uuid) -> Result<Vec<ProviderTaskRecord>> {
        Ok(self
            .store
            .provider_tasks_for_run(run_id)
            .await?
            .into_iter()
            .filter(|r| !r.is_run_record())
            .collect())
    }

    async fn run_record(&self, run_id: Uuid) -> Result<Option<ProviderTaskRecord>> {
        Ok(self
            .store
            .provider_tasks_for_run(run_id)
            .await?
            .into_iter()
            .find(ProviderTaskRecord::is_run_record))
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.finalize.retry_interval_secs as f64;
        let factor = self.config.finalize.backoff_multiplier.powi(attempt as i32);
        let capped = (base * factor).min(self.config.finalize.max_interval_secs as f64);
        Duration::from_secs_f64(capped)
    }

    /// Drive the archive task: gather every live result, delegate assembly,
    /// record the RunZipFile. Returns `false` when archiving failed.
    async fn build_run_archive(&self, run: &ExportRun, job: &Job) -> Result<bool> {
        let Some(run_record) = self.run_record(run.id).await? else {
            return Ok(true);
        };
        let archive_task = self
            .store
            .tasks_for_provider(run_record.id)
            .await?
            .into_iter()
            .find(|t| t.name == ARCHIVE_TASK);
        let Some(archive_task) = archive_task else {
            return Ok(true);
        };
        if archive_task.status.is_finished() {
            // At-least-once delivery: a repeated barrier must not zip twice.
            return Ok(archive_task.status == TaskState::Success);
        }

        self.store
            .transition_task(archive_task.id, &[TaskState::Pending], TaskState::Running)
            .await?;

        let mut files: BTreeMap<PathBuf, PathBuf> = BTreeMap::new();
        let mut covered = Vec::new();
        let providers = self.provider_records(run.id).await?;
        for record in &providers {
            let mut any = false;
            for task in self.store.tasks_for_provider(record.id).await? {
                let Some(result_id) = task.result else { continue };
                let Some(result) = self.store.result(result_id).await? else { continue };
                if result.deleted {
                    continue;
                }
                let staged = self
                    .config
                    .staging
                    .provider_dir(run.id, &record.provider_slug)
                    .join(&result.filename);
                let archived = PathBuf::from("data")
                    .join(&record.provider_slug)
                    .join(&result.filename);
                files.insert(staged, archived);
                any = true;
            }
            if any {
                covered.push(record.id);
            }
        }

        let manifest = ArchiveManifest {
            run_id: run.id.to_string(),
            job_name: job.normalized_name(),
            provider_slugs: providers.iter().map(|r| r.provider_slug.clone()).collect(),
        };

        match self.archiver.build_archive(files, manifest).await {
            Ok(path) => {
                let filename = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| format!("{}.zip", run.id));
                let size_mb = std::fs::metadata(&path)
                    .map(|m| m.len() as f64 / 1024.0 / 1024.0)
                    .unwrap_or(0.0);
                let result = TaskResult::new(&filename, size_mb, path.to_string_lossy());
                self.store.insert_result(&result).await?;
                self.store.set_task_result(archive_task.id, result.id).await?;
                self.store
                    .transition_task(archive_task.id, &[TaskState::Running], TaskState::Success)
                    .await?;
                self.store.set_task_finished(archive_task.id).await?;

                let mut zip = RunZipFile::new(run.id, covered);
                zip.completed(result.id);
                self.store.insert_run_zip_file(&zip).await?;

                self.publisher.publish(
                    events::ARCHIVE_CREATED,
                    json!({ "run_id": run.id, "archive": filename }),
                );
                Ok(true)
            }
            Err(err) => {
                error!(run_id = %run.id, error = %err, "Archive assembly failed");
                self.store
                    .transition_task(archive_task.id, &[TaskState::Running], TaskState::Failed)
                    .await?;
                self.store.set_task_finished(archive_task.id).await?;
                self.store
                    .record_task_failure(&TaskFailure::new(archive_task.id, err.to_string()))
                    .await?;
                self.publisher.publish(
                    events::FINALIZE_FAILED,
                    json!({ "run_id": run.id, "error": err.to_string() }),
                );
                Ok(false)
            }
        }
    }

    /// Stamp the run terminal, release staging, notify once, and enforce
    /// retention.
    async fn apply_terminal(
        &self,
        run: &ExportRun,
        job: &Job,
        status: TaskState,
        finalize_failed: bool,
    ) -> Result<()> {
        self.store
            .update_run_status(
                run.id,
                &[TaskState::Submitted, TaskState::Pending, TaskState::Running],
                status,
            )
            .await?;
        self.store.set_run_finished(run.id).await?;

        if !self.config.staging.keep_stage {
            let dir = self.config.staging.run_dir(run.id);
            if dir.is_dir() {
                if let Err(err) = std::fs::remove_dir_all(&dir) {
                    error!(path = %dir.display(), error = %err, "Failed to release staging");
                }
            }
        }

        // Single-use stamp: a second barrier invocation sends nothing.
        if self.store.set_run_notified(run.id).await? {
            let (verb, level, subject) = if finalize_failed {
                (
                    NotificationVerb::RunFailed,
                    NotificationLevel::Error,
                    "Your export DataPack failed to finalize.",
                )
            } else {
                match status {
                    TaskState::Completed => (
                        NotificationVerb::RunCompleted,
                        NotificationLevel::Success,
                        "Your export DataPack is ready.",
                    ),
                    TaskState::Canceled => (
                        NotificationVerb::RunCanceled,
                        NotificationLevel::Warning,
                        "Your export DataPack was CANCELED.",
                    ),
                    _ => (
                        NotificationVerb::RunFailed,
                        NotificationLevel::Warning,
                        "Your export DataPack completed with errors.",
                    ),
                }
            };
            let status_url = format!(
                "{}/status/{}",
                self.config.notifications.site_url.trim_end_matches('/'),
                job.id
            );
            let notification = Notification {
                recipient: run.user.clone(),
                verb,
                level,
                subject: subject.to_string(),
                body: format!("Run {} finished as {status}. See {status_url}", run.id),
            };
            if let Err(err) = self.notifier.notify(notification).await {
                error!(run_id = %run.id, error = %err, "Failed to send outcome notification");
            }
        }

        let reaped = enforce_retention(
            &self.store,
            job.id,
            self.config.retention.max_runs_per_job,
        )
        .await?;
        if reaped > 0 {
            info!(job_id = %job.id, reaped = reaped, "Retention reaped old runs at finalize");
        }

        self.publisher.publish(
            events::RUN_FINALIZED,
            json!({ "run_id": run.id, "status": status.to_string() }),
        );
        Ok(())
    }
}
