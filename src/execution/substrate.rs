//! Execution substrate contract.
//!
//! Abstracts the distributed task-queue technology: chains are submitted
//! with a queue and priority, and cancellation reaches live work through a
//! handle. The orchestrator never assumes which backend is underneath.

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::constants::TaskPriority;
use crate::error::ExportError;
use crate::orchestration::task_graph::ExecutableChain;

use super::token::CancellationToken;

/// Handle to a submitted chain.
#[derive(Debug, Clone)]
pub struct SubmitHandle {
    pub id: Uuid,
    pub queue: String,
    /// Task ids covered by the submission, for targeted cancellation.
    pub task_ids: Vec<Uuid>,
}

/// Errors from the substrate.
#[derive(Debug, thiserror::Error)]
pub enum SubstrateError {
    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Unknown submission handle: {0}")]
    UnknownHandle(Uuid),

    #[error("Submission failed: {0}")]
    SubmitFailed(String),
}

impl From<SubstrateError> for ExportError {
    fn from(err: SubstrateError) -> Self {
        ExportError::Substrate(err.to_string())
    }
}

/// A task-queue backend able to run chains and cancel live work.
#[async_trait]
pub trait ExecutionSubstrate: Send + Sync {
    /// Submit a chain for execution on its queue. At-least-once delivery is
    /// assumed; consumers must be idempotent.
    async fn submit(
        &self,
        chain: ExecutableChain,
        priority: TaskPriority,
    ) -> Result<SubmitHandle, SubstrateError>;

    /// Best-effort cancel of a submission: ask the work to stop gracefully;
    /// the caller escalates to a process kill after its grace period.
    async fn cancel(&self, handle_id: Uuid, pid: i32) -> Result<(), SubstrateError>;

    /// Advisory depth of a queue, for observability.
    fn queue_depth(&self, queue: &str) -> usize;
}

/// Shared registry of live per-task cancellation tokens.
///
/// The substrate registers a token when a task starts executing; the
/// cancellation propagator trips it to deliver a soft kill without either
/// side holding a reference to the other.
#[derive(Debug, Default)]
pub struct TokenRegistry {
    tokens: DashMap<Uuid, CancellationToken>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or fetch) the token for a task.
    pub fn register(&self, task_id: Uuid) -> CancellationToken {
        self.tokens
            .entry(task_id)
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    /// Trip a task's token. A task with no registered token has no live
    /// process; cancellation is then a pure state write.
    pub fn cancel(&self, task_id: Uuid) -> bool {
        match self.tokens.get(&task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop a finished task's token.
    pub fn remove(&self, task_id: Uuid) {
        self.tokens.remove(&task_id);
    }

    pub fn live_count(&self) -> usize {
        self.tokens.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_cancel() {
        let registry = TokenRegistry::new();
        let task_id = Uuid::new_v4();
        let token = registry.register(task_id);
        assert!(!token.is_canceled());

        assert!(registry.cancel(task_id));
        assert!(token.is_canceled());
    }

    #[test]
    fn test_cancel_without_live_process() {
        let registry = TokenRegistry::new();
        assert!(!registry.cancel(Uuid::new_v4()));
    }

    #[test]
    fn test_remove_drops_token() {
        let registry = TokenRegistry::new();
        let task_id = Uuid::new_v4();
        registry.register(task_id);
        assert_eq!(registry.live_count(), 1);
        registry.remove(task_id);
        assert_eq!(registry.live_count(), 0);
    }
}
