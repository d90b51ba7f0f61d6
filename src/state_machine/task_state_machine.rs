//! Per-task lifecycle state machine.
//!
//! Owns the authoritative transition rules for a single export task and the
//! race-closing pickup check: a task moving to RUNNING first re-checks
//! whether it, its provider task, or its run was already canceled while it
//! sat in the queue, and raises a [`CancellationSignal`] instead of doing
//! work when so.

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::constants::events;
use crate::error::CancellationSignal;
use crate::events::EventPublisher;
use crate::store::{StateStore, StoreError};

use super::events::TaskLifecycleEvent;
use super::states::TaskState;

/// Errors raised by the task state machine.
#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("Invalid transition from {from} on event '{event}'")]
    InvalidTransition { from: TaskState, event: &'static str },

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("State store error: {0}")]
    Store(#[from] StoreError),
}

pub type TransitionResult<T> = std::result::Result<T, TransitionError>;

/// Outcome of attempting a transition.
#[derive(Debug)]
pub enum TransitionOutcome {
    /// The transition applied; the task is now in this state.
    Transitioned(TaskState),
    /// Another writer already moved the task to a terminal state.
    AlreadyTerminal(TaskState),
    /// A cancel was observed at pickup; the task must not run.
    Canceled(CancellationSignal),
}

/// State machine over a [`StateStore`]-backed task row.
pub struct TaskStateMachine<S: StateStore + ?Sized> {
    store: Arc<S>,
    publisher: EventPublisher,
}

impl<S: StateStore + ?Sized> Clone for TaskStateMachine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            publisher: self.publisher.clone(),
        }
    }
}

impl<S: StateStore + ?Sized> TaskStateMachine<S> {
    pub fn new(store: Arc<S>, publisher: EventPublisher) -> Self {
        Self { store, publisher }
    }

    /// The target state for an event from a given state. Pure; the guarded
    /// store write enforces it under concurrency.
    pub fn determine_target_state(
        current: TaskState,
        event: &TaskLifecycleEvent,
    ) -> TransitionResult<TaskState> {
        let target = match (current, event) {
            (TaskState::Pending, TaskLifecycleEvent::Start) => TaskState::Running,

            (TaskState::Running, TaskLifecycleEvent::Succeed) => TaskState::Success,

            (TaskState::Running, TaskLifecycleEvent::Fail(_)) => TaskState::Failed,
            (TaskState::Pending, TaskLifecycleEvent::Fail(_)) => TaskState::Failed,

            (TaskState::Pending, TaskLifecycleEvent::Cancel { .. }) => TaskState::Canceled,
            (TaskState::Running, TaskLifecycleEvent::Cancel { .. }) => TaskState::Canceled,

            (from, event) => {
                return Err(TransitionError::InvalidTransition {
                    from,
                    event: event.event_type(),
                })
            }
        };
        Ok(target)
    }

    /// Move a task to RUNNING for the given worker.
    ///
    /// Closes the queued-then-canceled race: if the task, its provider task,
    /// or its run is already CANCELED, the task is marked CANCELED (if not
    /// already) and a cancellation signal is returned instead.
    pub async fn start(
        &self,
        task_id: Uuid,
        worker: &str,
        pid: i32,
    ) -> TransitionResult<TransitionOutcome> {
        let task = self
            .store
            .task(task_id)
            .await?
            .ok_or(TransitionError::TaskNotFound(task_id))?;
        let provider_task = self.store.provider_task(task.provider_task_id).await?;
        let run = match &provider_task {
            Some(pt) => self.store.run(pt.run_id).await?,
            None => None,
        };

        let canceled_upstream = task.status == TaskState::Canceled
            || provider_task
                .as_ref()
                .is_some_and(|pt| pt.status == TaskState::Canceled)
            || run.as_ref().is_some_and(|r| r.status == TaskState::Canceled);

        if canceled_upstream {
            debug!(task_id = %task_id, "Cancel observed at pickup, refusing to start");
            self.store
                .transition_task(task_id, &[TaskState::Pending], TaskState::Canceled)
                .await?;
            self.publisher.publish(
                events::TASK_CANCELED,
                serde_json::json!({ "task_id": task_id, "at": "pickup" }),
            );
            return Ok(TransitionOutcome::Canceled(CancellationSignal::new(
                task.name,
                task.cancel_user,
            )));
        }

        let target = Self::determine_target_state(TaskState::Pending, &TaskLifecycleEvent::Start)?;
        let applied = self
            .store
            .transition_task(task_id, &[TaskState::Pending], target)
            .await?;
        if !applied {
            // Someone beat us to the row; re-read and report what happened.
            let current = self
                .store
                .task(task_id)
                .await?
                .ok_or(TransitionError::TaskNotFound(task_id))?;
            if current.status == TaskState::Canceled {
                return Ok(TransitionOutcome::Canceled(CancellationSignal::new(
                    current.name,
                    current.cancel_user,
                )));
            }
            return Ok(TransitionOutcome::AlreadyTerminal(current.status));
        }

        self.store.set_task_started(task_id, worker, pid).await?;

        // First task starting pulls the provider task and run into RUNNING.
        if let Some(pt) = &provider_task {
            self.store
                .update_provider_task_status(pt.id, &[TaskState::Pending], TaskState::Running)
                .await?;
            if let Some(r) = &run {
                let was_submitted = self
                    .store
                    .update_run_status(
                        r.id,
                        &[TaskState::Submitted, TaskState::Pending],
                        TaskState::Running,
                    )
                    .await?;
                if was_submitted {
                    self.store.set_run_started(r.id).await?;
                }
            }
        }

        self.publisher.publish(
            events::TASK_STARTED,
            serde_json::json!({ "task_id": task_id, "worker": worker }),
        );
        Ok(TransitionOutcome::Transitioned(TaskState::Running))
    }

    /// Mark a running task successful.
    pub async fn succeed(&self, task_id: Uuid) -> TransitionResult<TransitionOutcome> {
        let target = Self::determine_target_state(TaskState::Running, &TaskLifecycleEvent::Succeed)?;
        let applied = self
            .store
            .transition_task(task_id, &[TaskState::Running], target)
            .await?;
        if !applied {
            return self.already_terminal(task_id).await;
        }
        self.store.set_task_finished(task_id).await?;
        self.publisher.publish(
            events::TASK_COMPLETED,
            serde_json::json!({ "task_id": task_id }),
        );
        Ok(TransitionOutcome::Transitioned(TaskState::Success))
    }

    /// Mark a task failed. A task canceled underneath us stays CANCELED:
    /// the failure is then a side effect of the forced unwind.
    pub async fn fail(&self, task_id: Uuid, reason: &str) -> TransitionResult<TransitionOutcome> {
        let applied = self
            .store
            .transition_task(
                task_id,
                &[TaskState::Running, TaskState::Pending],
                TaskState::Failed,
            )
            .await?;
        if !applied {
            return self.already_terminal(task_id).await;
        }
        self.store.set_task_finished(task_id).await?;
        self.store
            .record_task_failure(&crate::models::TaskFailure::new(task_id, reason))
            .await?;
        self.publisher.publish(
            events::TASK_FAILED,
            serde_json::json!({ "task_id": task_id, "reason": reason }),
        );
        Ok(TransitionOutcome::Transitioned(TaskState::Failed))
    }

    /// Cancel a task that has not finished.
    pub async fn cancel(
        &self,
        task_id: Uuid,
        user: Option<&str>,
    ) -> TransitionResult<TransitionOutcome> {
        let applied = self
            .store
            .transition_task(
                task_id,
                &[TaskState::Pending, TaskState::Running],
                TaskState::Canceled,
            )
            .await?;
        if !applied {
            return self.already_terminal(task_id).await;
        }
        if let Some(user) = user {
            self.store.set_task_cancel_user(task_id, user).await?;
        }
        self.store.set_task_finished(task_id).await?;
        self.publisher.publish(
            events::TASK_CANCELED,
            serde_json::json!({ "task_id": task_id, "user": user }),
        );
        Ok(TransitionOutcome::Transitioned(TaskState::Canceled))
    }

    async fn already_terminal(&self, task_id: Uuid) -> TransitionResult<TransitionOutcome> {
        let current = self
            .store
            .task(task_id)
            .await?
            .ok_or(TransitionError::TaskNotFound(task_id))?;
        if !current.status.is_terminal_for_task() {
            warn!(
                task_id = %task_id,
                status = %current.status,
                "Guarded transition lost to a non-terminal writer"
            );
        }
        Ok(TransitionOutcome::AlreadyTerminal(current.status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExportRun, ExportTaskRecord, ProviderTaskRecord, TaskCategory};
    use crate::store::MemoryStateStore;

    async fn seed(
        store: &MemoryStateStore,
    ) -> (ExportRun, ProviderTaskRecord, ExportTaskRecord) {
        let run = ExportRun::submitted(Uuid::new_v4(), "user", 14);
        store.insert_run(&run).await.unwrap();
        let provider_task = ProviderTaskRecord::pending(run.id, "osm", "OpenStreetMap");
        store.insert_provider_task(&provider_task).await.unwrap();
        let task = ExportTaskRecord::pending(
            provider_task.id,
            "OpenStreetMap Data (.gpkg)",
            TaskCategory::Collect,
        );
        store.insert_task(&task).await.unwrap();
        (run, provider_task, task)
    }

    fn machine(store: &Arc<MemoryStateStore>) -> TaskStateMachine<MemoryStateStore> {
        TaskStateMachine::new(Arc::clone(store), EventPublisher::default())
    }

    #[test]
    fn test_target_states() {
        use TaskLifecycleEvent as E;
        assert_eq!(
            TaskStateMachine::<MemoryStateStore>::determine_target_state(TaskState::Pending, &E::Start)
                .unwrap(),
            TaskState::Running
        );
        assert_eq!(
            TaskStateMachine::<MemoryStateStore>::determine_target_state(TaskState::Running, &E::Succeed)
                .unwrap(),
            TaskState::Success
        );
        assert!(TaskStateMachine::<MemoryStateStore>::determine_target_state(
            TaskState::Success,
            &E::Start
        )
        .is_err());
        assert!(TaskStateMachine::<MemoryStateStore>::determine_target_state(
            TaskState::Pending,
            &E::Succeed
        )
        .is_err());
    }

    #[tokio::test]
    async fn test_start_moves_hierarchy_to_running() {
        let store = Arc::new(MemoryStateStore::new());
        let (run, provider_task, task) = seed(&store).await;
        let sm = machine(&store);

        let outcome = sm.start(task.id, "worker-1", 4242).await.unwrap();
        assert!(matches!(outcome, TransitionOutcome::Transitioned(TaskState::Running)));

        let task = store.task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskState::Running);
        assert_eq!(task.pid, 4242);
        assert_eq!(task.worker.as_deref(), Some("worker-1"));

        let pt = store.provider_task(provider_task.id).await.unwrap().unwrap();
        assert_eq!(pt.status, TaskState::Running);
        let run = store.run(run.id).await.unwrap().unwrap();
        assert_eq!(run.status, TaskState::Running);
        assert!(run.started_at.is_some());
    }

    #[tokio::test]
    async fn test_pickup_recheck_observes_provider_cancel() {
        let store = Arc::new(MemoryStateStore::new());
        let (_run, provider_task, task) = seed(&store).await;
        store
            .update_provider_task_status(provider_task.id, &[TaskState::Pending], TaskState::Canceled)
            .await
            .unwrap();

        let sm = machine(&store);
        let outcome = sm.start(task.id, "worker-1", 1).await.unwrap();
        assert!(matches!(outcome, TransitionOutcome::Canceled(_)));

        // The task itself was marked canceled without ever running.
        let task = store.task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskState::Canceled);
        assert!(task.started_at.is_none());
    }

    #[tokio::test]
    async fn test_pickup_recheck_observes_run_cancel() {
        let store = Arc::new(MemoryStateStore::new());
        let (run, _provider_task, task) = seed(&store).await;
        store
            .update_run_status(run.id, &[TaskState::Submitted], TaskState::Canceled)
            .await
            .unwrap();

        let sm = machine(&store);
        let outcome = sm.start(task.id, "worker-1", 1).await.unwrap();
        assert!(matches!(outcome, TransitionOutcome::Canceled(_)));
    }

    #[tokio::test]
    async fn test_cancel_pending_never_observes_running() {
        let store = Arc::new(MemoryStateStore::new());
        let (_run, _provider_task, task) = seed(&store).await;
        let sm = machine(&store);

        let outcome = sm.cancel(task.id, Some("admin")).await.unwrap();
        assert!(matches!(outcome, TransitionOutcome::Transitioned(TaskState::Canceled)));

        // Starting afterwards refuses to run.
        let outcome = sm.start(task.id, "worker-1", 1).await.unwrap();
        assert!(matches!(outcome, TransitionOutcome::Canceled(_)));
        let task = store.task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskState::Canceled);
        assert_eq!(task.cancel_user.as_deref(), Some("admin"));
    }

    #[tokio::test]
    async fn test_fail_preserves_cancel() {
        let store = Arc::new(MemoryStateStore::new());
        let (_run, _provider_task, task) = seed(&store).await;
        let sm = machine(&store);

        sm.cancel(task.id, None).await.unwrap();
        let outcome = sm.fail(task.id, "worker died").await.unwrap();
        assert!(matches!(outcome, TransitionOutcome::AlreadyTerminal(TaskState::Canceled)));
    }

    #[tokio::test]
    async fn test_succeed_records_finish() {
        let store = Arc::new(MemoryStateStore::new());
        let (_run, _provider_task, task) = seed(&store).await;
        let sm = machine(&store);

        sm.start(task.id, "worker-1", 77).await.unwrap();
        sm.succeed(task.id).await.unwrap();

        let task = store.task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskState::Success);
        assert!(task.finished_at.is_some());
        assert_eq!(task.pid, -1);
    }
}
