//! # Run Builder
//!
//! Creates export runs from jobs: validation, clone lineage, expiration,
//! the run-started notification, and the retention policy that bounds how
//! many runs a job may accumulate.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::constants::events;
use crate::error::{ExportError, Result};
use crate::events::EventPublisher;
use crate::models::ExportRun;
use crate::services::{Notification, NotificationLevel, NotificationVerb, Notifier};
use crate::store::StateStore;

/// Soft-delete the oldest runs of a job beyond the configured maximum,
/// releasing their results. Returns how many runs were reaped.
pub async fn enforce_retention(
    store: &Arc<dyn StateStore>,
    job_id: Uuid,
    max_runs: usize,
) -> Result<usize> {
    let runs = store.runs_for_job(job_id).await?;
    let live: Vec<&ExportRun> = runs.iter().filter(|r| !r.deleted).collect();
    if live.len() <= max_runs {
        return Ok(0);
    }

    let mut reaped = 0;
    // Newest first from the store; everything past the cap goes.
    for run in live.into_iter().skip(max_runs) {
        info!(run_id = %run.id, job_id = %job_id, "Retention: soft-deleting old run");
        for record in store.provider_tasks_for_run(run.id).await? {
            for task in store.tasks_for_provider(record.id).await? {
                if let Some(result_id) = task.result {
                    store.soft_delete_result(result_id).await?;
                }
            }
        }
        store.soft_delete_run(run.id, None).await?;
        reaped += 1;
    }
    Ok(reaped)
}

/// Builds runs for jobs.
pub struct RunBuilder {
    store: Arc<dyn StateStore>,
    notifier: Arc<dyn Notifier>,
    publisher: EventPublisher,
    config: OrchestratorConfig,
}

impl RunBuilder {
    pub fn new(
        store: Arc<dyn StateStore>,
        notifier: Arc<dyn Notifier>,
        publisher: EventPublisher,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            publisher,
            config,
        }
    }

    /// Create a new run for a job in SUBMITTED state.
    ///
    /// `clone` references an earlier run to record lineage from. The job
    /// must carry provider requests; retention is enforced so one job
    /// cannot accumulate unbounded runs.
    pub async fn create_run(
        &self,
        job_id: Uuid,
        user: Option<&str>,
        clone: Option<Uuid>,
    ) -> Result<ExportRun> {
        let job = self
            .store
            .job(job_id)
            .await?
            .ok_or(ExportError::not_found("job", job_id))?;

        if job.provider_requests.is_empty() {
            return Err(ExportError::Validation(
                "This job does not have any data sources or formats associated with it; \
                 try cloning the job or submitting a new request"
                    .into(),
            ));
        }

        let user = user.unwrap_or(&job.user).to_string();
        let run = match clone {
            Some(parent_id) => {
                let parent = self
                    .store
                    .run(parent_id)
                    .await?
                    .ok_or(ExportError::not_found("run", parent_id))?;
                ExportRun::cloned_from(&parent, &user, self.config.retention.run_expiration_days)
            }
            None => ExportRun::submitted(job_id, &user, self.config.retention.run_expiration_days),
        };

        self.store.insert_run(&run).await?;
        debug!(run_id = %run.id, job_id = %job_id, "Created export run");

        let reaped =
            enforce_retention(&self.store, job_id, self.config.retention.max_runs_per_job).await?;
        if reaped > 0 {
            debug!(job_id = %job_id, reaped = reaped, "Retention reaped old runs at create");
        }

        self.publisher
            .publish(events::RUN_STARTED, json!({ "run_id": run.id, "user": user }));
        let notification = Notification {
            recipient: run.user.clone(),
            verb: NotificationVerb::RunStarted,
            level: NotificationLevel::Info,
            subject: format!("Your export '{}' has started processing.", job.name),
            body: format!("Export run {} was submitted.", run.id),
        };
        if let Err(err) = self.notifier.notify(notification).await {
            error!(run_id = %run.id, error = %err, "Failed to send run-started notification");
        }

        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Job, ProviderRequest};
    use crate::services::RecordingNotifier;
    use crate::state_machine::TaskState;
    use crate::store::MemoryStateStore;

    fn geometry() -> serde_json::Value {
        serde_json::json!({
            "type": "Polygon",
            "coordinates": [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0], [0.0, 0.0]]]
        })
    }

    async fn builder_with_job(
        requests: Vec<ProviderRequest>,
    ) -> (Arc<MemoryStateStore>, Arc<RecordingNotifier>, RunBuilder, Job) {
        let store: Arc<MemoryStateStore> = Arc::new(MemoryStateStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let builder = RunBuilder::new(
            store.clone(),
            notifier.clone(),
            EventPublisher::default(),
            OrchestratorConfig::default(),
        );
        let job = Job::new("Test Export", "user", geometry(), requests).unwrap();
        store.insert_job(&job).await.unwrap();
        (store, notifier, builder, job)
    }

    #[tokio::test]
    async fn test_create_run_submitted_with_expiration() {
        let (_store, notifier, builder, job) =
            builder_with_job(vec![ProviderRequest::new("osm", ["gpkg"])]).await;
        let run = builder.create_run(job.id, None, None).await.unwrap();
        assert_eq!(run.status, TaskState::Submitted);
        assert_eq!(run.user, "user");
        assert!(run.expiration > run.created_at);
        assert_eq!(notifier.verbs(), vec![NotificationVerb::RunStarted]);
    }

    #[tokio::test]
    async fn test_create_run_requires_provider_requests() {
        let (_store, _notifier, builder, job) = builder_with_job(vec![]).await;
        let err = builder.create_run(job.id, None, None).await.unwrap_err();
        assert!(matches!(err, ExportError::Validation(_)));
    }

    #[tokio::test]
    async fn test_clone_records_parent() {
        let (_store, _notifier, builder, job) =
            builder_with_job(vec![ProviderRequest::new("osm", ["gpkg"])]).await;
        let parent = builder.create_run(job.id, None, None).await.unwrap();
        let clone = builder
            .create_run(job.id, Some("other"), Some(parent.id))
            .await
            .unwrap();
        assert_eq!(clone.parent_run, Some(parent.id));
        assert_eq!(clone.user, "other");
    }

    #[tokio::test]
    async fn test_retention_soft_deletes_oldest() {
        let (store, _notifier, builder, job) =
            builder_with_job(vec![ProviderRequest::new("osm", ["gpkg"])]).await;
        // Default retention keeps 3 runs per job.
        let mut created = Vec::new();
        for _ in 0..5 {
            created.push(builder.create_run(job.id, None, None).await.unwrap());
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let runs = store.runs_for_job(job.id).await.unwrap();
        let live: Vec<_> = runs.iter().filter(|r| !r.deleted).collect();
        assert_eq!(live.len(), 3);
        // The oldest runs are the deleted ones.
        let deleted: Vec<_> = runs.iter().filter(|r| r.deleted).collect();
        assert_eq!(deleted.len(), 2);
        let oldest_two: Vec<Uuid> = created.iter().take(2).map(|r| r.id).collect();
        for run in deleted {
            assert!(oldest_two.contains(&run.id));
        }
    }
}
