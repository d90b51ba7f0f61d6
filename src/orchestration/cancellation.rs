//! # Cancellation & Failure Propagator
//!
//! Fans a cancel, abort-on-error, or delete signal out to every non-terminal
//! task of a provider chain. Cancellation is cooperative and multi-point:
//! the state store is marked first (so queued tasks refuse at pickup), the
//! progress cache gets a `CANCELED` flag any in-flight subprocess can poll,
//! and live processes get a soft kill via their cancellation token with a
//! hard pid kill after a bounded grace period.
//!
//! Cleanup is explicit orchestration invoked by the deleting component, not
//! a framework hook: the order of operations here is the order that runs.

use std::sync::Arc;

use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::ProgressCache;
use crate::config::OrchestratorConfig;
use crate::constants::events;
use crate::error::{ExportError, Result};
use crate::events::EventPublisher;
use crate::execution::substrate::TokenRegistry;
use crate::models::{ExportTaskRecord, TaskFailure};
use crate::services::{Notification, NotificationLevel, NotificationVerb, Notifier};
use crate::state_machine::TaskState;
use crate::store::StateStore;

const CACHE_MODEL: &str = "ExportTaskRecord";
const CACHE_STATUS_ATTR: &str = "status";

/// Why the fan-out is happening. Drives terminal marking and result cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelMode {
    /// A user asked for the provider (or run) to stop.
    User,
    /// A primary task failed; pending dependents are meaningless.
    AbortOnError,
    /// The run is being deleted; produced results are released too.
    Delete,
}

/// Fans cancel/abort/delete signals across a provider chain.
pub struct CancellationPropagator {
    store: Arc<dyn StateStore>,
    cache: Arc<dyn ProgressCache>,
    tokens: Arc<TokenRegistry>,
    notifier: Arc<dyn Notifier>,
    publisher: EventPublisher,
    config: OrchestratorConfig,
}

impl CancellationPropagator {
    pub fn new(
        store: Arc<dyn StateStore>,
        cache: Arc<dyn ProgressCache>,
        tokens: Arc<TokenRegistry>,
        notifier: Arc<dyn Notifier>,
        publisher: EventPublisher,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            cache,
            tokens,
            notifier,
            publisher,
            config,
        }
    }

    /// Cancel every non-terminal task under a provider task, mark the
    /// provider task itself, and record the acting user.
    pub async fn cancel_provider_task(
        &self,
        provider_task_id: Uuid,
        acting_user: Option<&str>,
        reason: Option<&str>,
        mode: CancelMode,
    ) -> Result<()> {
        let record = self
            .store
            .provider_task(provider_task_id)
            .await?
            .ok_or(ExportError::not_found("provider task", provider_task_id))?;

        info!(
            provider_task = %provider_task_id,
            provider = %record.provider_slug,
            mode = ?mode,
            user = acting_user,
            "Propagating cancel across provider chain"
        );

        let tasks = self.store.tasks_for_provider(provider_task_id).await?;
        for task in &tasks {
            self.cancel_task(task, acting_user, reason, mode).await?;
        }

        // The provider task's terminal state is written here, not derived:
        // user cancellation is an external decision, not an aggregate.
        let applied = self
            .store
            .update_provider_task_status(
                provider_task_id,
                &[TaskState::Pending, TaskState::Running],
                TaskState::Canceled,
            )
            .await?;
        if applied {
            self.store
                .set_provider_task_finished(provider_task_id)
                .await?;
            self.publisher.publish(
                events::PROVIDER_CANCELED,
                json!({ "provider_task_id": provider_task_id, "user": acting_user }),
            );
        }
        Ok(())
    }

    /// Cancel every provider chain of a run, fanned out concurrently. The
    /// reserved "run" record is left alone except on delete, so the
    /// finalization barrier can still derive and report the run's terminal
    /// state.
    pub async fn cancel_run(
        &self,
        run_id: Uuid,
        acting_user: Option<&str>,
        mode: CancelMode,
    ) -> Result<()> {
        let records = self.store.provider_tasks_for_run(run_id).await?;
        let fan_out = records
            .iter()
            .filter(|record| !record.is_run_record() || mode == CancelMode::Delete)
            .map(|record| self.cancel_provider_task(record.id, acting_user, None, mode));
        futures::future::try_join_all(fan_out).await?;
        Ok(())
    }

    /// Invoked when an `abort_on_error` task fails: cancel the still-PENDING
    /// work siblings (finished work is untouched, and the bookkeeping
    /// finalize step still runs to derive the provider's status), then run
    /// the run-level error handler.
    pub async fn abort_chain(&self, provider_task_id: Uuid, failed_task_name: &str) -> Result<()> {
        let record = self
            .store
            .provider_task(provider_task_id)
            .await?
            .ok_or(ExportError::not_found("provider task", provider_task_id))?;

        warn!(
            provider_task = %provider_task_id,
            failed_task = failed_task_name,
            "Primary task failed, aborting chain"
        );

        let tasks = self.store.tasks_for_provider(provider_task_id).await?;
        let reason = format!("Canceled after failure of '{failed_task_name}'");
        for task in &tasks {
            if !task.category.is_work() || task.status != TaskState::Pending {
                continue;
            }
            self.cancel_task(task, None, Some(&reason), CancelMode::AbortOnError)
                .await?;
        }

        self.run_error_handler(record.run_id, failed_task_name).await
    }

    /// Delete a run: the cancel fan-out with result release, then the soft
    /// delete and its notification.
    pub async fn delete_run(&self, run_id: Uuid, acting_user: Option<&str>) -> Result<()> {
        let run = self
            .store
            .run(run_id)
            .await?
            .ok_or(ExportError::not_found("run", run_id))?;

        self.cancel_run(run_id, acting_user, CancelMode::Delete).await?;
        self.store.soft_delete_run(run_id, acting_user).await?;
        self.cleanup_staging(run_id);

        self.publisher.publish(
            events::RUN_DELETED,
            json!({ "run_id": run_id, "user": acting_user }),
        );
        let notification = Notification {
            recipient: run.user.clone(),
            verb: NotificationVerb::RunDeleted,
            level: NotificationLevel::Warning,
            subject: "Your export DataPack was deleted.".to_string(),
            body: format!("Export run {run_id} was deleted."),
        };
        if let Err(err) = self.notifier.notify(notification).await {
            error!(run_id = %run_id, error = %err, "Failed to send deletion notification");
        }
        Ok(())
    }

    /// Run-level error handler: staging cleanup plus the failure
    /// notification to the user and the error address. Does not touch run
    /// status — the finalization barrier derives that once every chain is
    /// done.
    pub async fn run_error_handler(&self, run_id: Uuid, failed_task_name: &str) -> Result<()> {
        let run = self
            .store
            .run(run_id)
            .await?
            .ok_or(ExportError::not_found("run", run_id))?;

        self.cleanup_staging(run_id);

        self.publisher.publish(
            events::RUN_FAILED,
            json!({ "run_id": run_id, "failed_task": failed_task_name }),
        );

        let status_url = format!(
            "{}/status/{}",
            self.config.notifications.site_url.trim_end_matches('/'),
            run.job_id
        );
        for recipient in [
            run.user.as_str(),
            self.config.notifications.error_address.as_str(),
        ] {
            let notification = Notification {
                recipient: recipient.to_string(),
                verb: NotificationVerb::RunFailed,
                level: NotificationLevel::Error,
                subject: "Your export DataPack has a failure.".to_string(),
                body: format!("Task '{failed_task_name}' failed. See {status_url}"),
            };
            if let Err(err) = self.notifier.notify(notification).await {
                error!(run_id = %run_id, error = %err, "Failed to send failure notification");
            }
        }
        Ok(())
    }

    /// Cancel one task: guarded state write, cooperative cache flag, and a
    /// soft-then-hard kill when a live process exists. A task with no live
    /// process is a pure state write.
    async fn cancel_task(
        &self,
        task: &ExportTaskRecord,
        acting_user: Option<&str>,
        reason: Option<&str>,
        mode: CancelMode,
    ) -> Result<()> {
        if !task.is_finished() {
            let applied = self
                .store
                .transition_task(
                    task.id,
                    &[TaskState::Pending, TaskState::Running],
                    TaskState::Canceled,
                )
                .await?;
            if applied {
                if let Some(user) = acting_user {
                    self.store.set_task_cancel_user(task.id, user).await?;
                }
                self.store.set_task_finished(task.id).await?;
                let message = reason
                    .map(String::from)
                    .unwrap_or_else(|| format!("'{}' canceled", task.name));
                self.store
                    .record_task_failure(&TaskFailure::new(task.id, &message))
                    .await?;
                self.publisher.publish(
                    events::TASK_CANCELED,
                    json!({ "task_id": task.id, "user": acting_user }),
                );
            }
        }

        // Cooperative flag: any in-flight subprocess polling its own status
        // can detect the cancel and unwind cleanly.
        self.cache
            .set(
                CACHE_MODEL,
                task.id,
                CACHE_STATUS_ATTR,
                json!(TaskState::Canceled.to_string()),
                self.config.cache.ttl(),
            )
            .await;

        if mode == CancelMode::Delete {
            if let Some(result_id) = task.result {
                self.store.soft_delete_result(result_id).await?;
            }
        }

        if task.has_live_process() {
            let softly = self.tokens.cancel(task.id);
            info!(
                task_id = %task.id,
                pid = task.pid,
                soft_kill = softly,
                "Requested graceful shutdown of live task"
            );
            self.escalate_hard_kill(task.id, task.pid);
        }
        Ok(())
    }

    /// After the grace period, kill the OS process if the task is somehow
    /// still running.
    fn escalate_hard_kill(&self, task_id: Uuid, pid: i32) {
        let store = Arc::clone(&self.store);
        let grace = self.config.cancel_grace();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            match store.task(task_id).await {
                Ok(Some(task)) if task.status == TaskState::Running || task.pid > 0 => {
                    warn!(task_id = %task_id, pid = pid, "Grace expired, hard-killing task process");
                    kill_process(pid).await;
                }
                _ => {}
            }
        });
    }

    fn cleanup_staging(&self, run_id: Uuid) {
        if self.config.staging.keep_stage {
            return;
        }
        let dir = self.config.staging.run_dir(run_id);
        if dir.is_dir() {
            if let Err(err) = std::fs::remove_dir_all(&dir) {
                error!(path = %dir.display(), error = %err, "Failed to remove staging directory");
            }
        }
    }
}

/// Best-effort OS-level kill. Tasks that never spawned keep pid -1 and are
/// never targeted.
async fn kill_process(pid: i32) {
    if pid <= 0 {
        return;
    }
    match tokio::process::Command::new("kill")
        .arg("-9")
        .arg(pid.to_string())
        .status()
        .await
    {
        Ok(status) if status.success() => info!(pid = pid, "Killed task process"),
        Ok(_) => info!(pid = pid, "Process already gone"),
        Err(err) => warn!(pid = pid, error = %err, "Failed to signal task process"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryProgressCache;
    use crate::models::{ExportRun, ProviderTaskRecord, TaskCategory};
    use crate::services::RecordingNotifier;
    use crate::store::MemoryStateStore;

    struct Fixture {
        store: Arc<MemoryStateStore>,
        cache: Arc<MemoryProgressCache>,
        notifier: Arc<RecordingNotifier>,
        tokens: Arc<TokenRegistry>,
        propagator: CancellationPropagator,
        run: ExportRun,
        provider_task: ProviderTaskRecord,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStateStore::new());
        let cache = Arc::new(MemoryProgressCache::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let tokens = Arc::new(TokenRegistry::new());
        let propagator = CancellationPropagator::new(
            store.clone(),
            cache.clone(),
            tokens.clone(),
            notifier.clone(),
            EventPublisher::default(),
            OrchestratorConfig::default(),
        );
        let run = ExportRun::submitted(Uuid::new_v4(), "user", 14);
        store.insert_run(&run).await.unwrap();
        let provider_task = ProviderTaskRecord::pending(run.id, "osm", "OpenStreetMap");
        store.insert_provider_task(&provider_task).await.unwrap();
        Fixture {
            store,
            cache,
            notifier,
            tokens,
            propagator,
            run,
            provider_task,
        }
    }

    async fn add_task(
        fixture: &Fixture,
        name: &str,
        category: TaskCategory,
        status: TaskState,
    ) -> ExportTaskRecord {
        let mut task = ExportTaskRecord::pending(fixture.provider_task.id, name, category);
        task.status = status;
        fixture.store.insert_task(&task).await.unwrap();
        task
    }

    #[tokio::test]
    async fn test_cancel_marks_all_nonterminal_tasks() {
        let fixture = fixture().await;
        let collect =
            add_task(&fixture, "OpenStreetMap Data (.gpkg)", TaskCategory::Collect, TaskState::Running)
                .await;
        let convert =
            add_task(&fixture, "Geopackage (.gpkg)", TaskCategory::Convert, TaskState::Pending).await;
        let done =
            add_task(&fixture, "ESRI Shapefile (.shp)", TaskCategory::Convert, TaskState::Success)
                .await;

        fixture
            .propagator
            .cancel_provider_task(fixture.provider_task.id, Some("admin"), None, CancelMode::User)
            .await
            .unwrap();

        let collect = fixture.store.task(collect.id).await.unwrap().unwrap();
        let convert = fixture.store.task(convert.id).await.unwrap().unwrap();
        let done = fixture.store.task(done.id).await.unwrap().unwrap();
        assert_eq!(collect.status, TaskState::Canceled);
        assert_eq!(convert.status, TaskState::Canceled);
        assert_eq!(convert.cancel_user.as_deref(), Some("admin"));
        // Finished work is untouched.
        assert_eq!(done.status, TaskState::Success);

        let record = fixture
            .store
            .provider_task(fixture.provider_task.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, TaskState::Canceled);
        assert!(record.finished_at.is_some());

        // Cooperative cancel flag is visible to polling subprocesses.
        let flag = fixture
            .cache
            .get(CACHE_MODEL, collect.id, CACHE_STATUS_ATTR)
            .await;
        assert_eq!(flag, Some(json!("CANCELED")));
    }

    #[tokio::test]
    async fn test_abort_chain_cancels_exactly_pending_work_siblings() {
        let fixture = fixture().await;
        let failed =
            add_task(&fixture, "OpenStreetMap Data (.gpkg)", TaskCategory::Collect, TaskState::Failed)
                .await;
        let pending_a =
            add_task(&fixture, "Geopackage (.gpkg)", TaskCategory::Convert, TaskState::Pending).await;
        let pending_b =
            add_task(&fixture, "ESRI Shapefile (.shp)", TaskCategory::Convert, TaskState::Pending)
                .await;
        let pending_c =
            add_task(&fixture, "Keyhole Markup Language (.kml)", TaskCategory::Convert, TaskState::Pending)
                .await;
        let succeeded =
            add_task(&fixture, "SQLITE Format (.sqlite)", TaskCategory::Convert, TaskState::Success)
                .await;
        let finalize =
            add_task(&fixture, "Finalize Provider", TaskCategory::Finalize, TaskState::Pending).await;

        fixture
            .propagator
            .abort_chain(fixture.provider_task.id, &failed.name)
            .await
            .unwrap();

        for id in [pending_a.id, pending_b.id, pending_c.id] {
            let task = fixture.store.task(id).await.unwrap().unwrap();
            assert_eq!(task.status, TaskState::Canceled);
        }
        // SUCCESS siblings stay SUCCESS, the finalize step stays pending so
        // it can derive the provider's status, and the failed task keeps
        // its failure.
        assert_eq!(
            fixture.store.task(succeeded.id).await.unwrap().unwrap().status,
            TaskState::Success
        );
        assert_eq!(
            fixture.store.task(finalize.id).await.unwrap().unwrap().status,
            TaskState::Pending
        );
        assert_eq!(
            fixture.store.task(failed.id).await.unwrap().unwrap().status,
            TaskState::Failed
        );

        // The run-level error handler notified the user and error address.
        assert_eq!(fixture.notifier.sent_count(), 2);
        assert!(fixture.notifier.subjects()[0].contains("failure"));
    }

    #[tokio::test]
    async fn test_delete_releases_results() {
        let fixture = fixture().await;
        let result = crate::models::TaskResult::new("osm.gpkg", 12.0, "downloads/osm.gpkg");
        fixture.store.insert_result(&result).await.unwrap();
        let mut task = ExportTaskRecord::pending(
            fixture.provider_task.id,
            "Geopackage (.gpkg)",
            TaskCategory::Convert,
        );
        task.status = TaskState::Success;
        task.result = Some(result.id);
        fixture.store.insert_task(&task).await.unwrap();

        fixture
            .propagator
            .delete_run(fixture.run.id, Some("admin"))
            .await
            .unwrap();

        let run = fixture.store.run(fixture.run.id).await.unwrap().unwrap();
        assert!(run.deleted);
        assert_eq!(run.delete_user.as_deref(), Some("admin"));
        let result = fixture.store.result(result.id).await.unwrap().unwrap();
        assert!(result.deleted);
        assert!(fixture
            .notifier
            .verbs()
            .contains(&NotificationVerb::RunDeleted));
    }

    #[tokio::test]
    async fn test_cancel_without_live_process_is_pure_state_write() {
        let fixture = fixture().await;
        let task =
            add_task(&fixture, "Geopackage (.gpkg)", TaskCategory::Convert, TaskState::Pending).await;
        assert_eq!(fixture.tokens.live_count(), 0);

        fixture
            .propagator
            .cancel_provider_task(fixture.provider_task.id, None, None, CancelMode::User)
            .await
            .unwrap();

        let task = fixture.store.task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskState::Canceled);
        // No token existed and none was created: nothing to kill.
        assert_eq!(fixture.tokens.live_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_run_leaves_run_record_for_barrier() {
        let fixture = fixture().await;
        let run_record = ProviderTaskRecord::run_record(fixture.run.id);
        fixture.store.insert_provider_task(&run_record).await.unwrap();
        add_task(&fixture, "OpenStreetMap Data (.gpkg)", TaskCategory::Collect, TaskState::Pending)
            .await;

        fixture
            .propagator
            .cancel_run(fixture.run.id, Some("user"), CancelMode::User)
            .await
            .unwrap();

        let record = fixture
            .store
            .provider_task(fixture.provider_task.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, TaskState::Canceled);
        // The bookkeeping record stays pending so finalization still runs.
        let run_record = fixture.store.provider_task(run_record.id).await.unwrap().unwrap();
        assert_eq!(run_record.status, TaskState::Pending);
    }
}
