//! Notifier contract.
//!
//! User-visible notifications (run started, completed, failed, canceled,
//! deleted) go through this collaborator. Only the finalization barrier and
//! the run-level error handler are allowed to call it: individual task
//! failures stay silent until the run reaches a terminal state.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What happened, from the recipient's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationVerb {
    RunStarted,
    RunCompleted,
    RunFailed,
    RunCanceled,
    RunDeleted,
}

impl NotificationVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStarted => "run_started",
            Self::RunCompleted => "run_completed",
            Self::RunFailed => "run_failed",
            Self::RunCanceled => "run_canceled",
            Self::RunDeleted => "run_deleted",
        }
    }
}

/// Severity shown to the recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// One outgoing notification.
#[derive(Debug, Clone)]
pub struct Notification {
    pub recipient: String,
    pub verb: NotificationVerb,
    pub level: NotificationLevel,
    pub subject: String,
    pub body: String,
}

/// Errors from notification delivery. Delivery failures are logged, never
/// allowed to fail a run.
#[derive(Debug, thiserror::Error)]
#[error("Notification delivery failed: {0}")]
pub struct NotifyError(pub String);

/// The notification contract.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// Default notifier: structured log lines only.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        tracing::info!(
            recipient = %notification.recipient,
            verb = notification.verb.as_str(),
            level = ?notification.level,
            subject = %notification.subject,
            "notification"
        );
        Ok(())
    }
}

/// Recording double for asserting notification behavior in tests.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    pub sent: parking_lot::Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn verbs(&self) -> Vec<NotificationVerb> {
        self.sent.lock().iter().map(|n| n.verb).collect()
    }

    pub fn subjects(&self) -> Vec<String> {
        self.sent.lock().iter().map(|n| n.subject.clone()).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        self.sent.lock().push(notification);
        Ok(())
    }
}
