use serde::{Deserialize, Serialize};

/// Events that can trigger task state transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TaskLifecycleEvent {
    /// A worker picked the task up.
    Start,
    /// The task produced its result.
    Succeed,
    /// The task failed with an error message.
    Fail(String),
    /// An external cancel was requested, optionally by a named user.
    Cancel { user: Option<String> },
}

impl TaskLifecycleEvent {
    /// String representation of the event type for logging.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Succeed => "succeed",
            Self::Fail(_) => "fail",
            Self::Cancel { .. } => "cancel",
        }
    }

    /// Error message for failure events.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Fail(msg) => Some(msg),
            _ => None,
        }
    }

    /// Whether this event moves the task to a terminal state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Start)
    }

    pub fn fail_with_error(error: impl Into<String>) -> Self {
        Self::Fail(error.into())
    }

    pub fn cancel_by(user: impl Into<String>) -> Self {
        Self::Cancel {
            user: Some(user.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_types() {
        assert_eq!(TaskLifecycleEvent::Start.event_type(), "start");
        assert_eq!(TaskLifecycleEvent::cancel_by("admin").event_type(), "cancel");
        assert_eq!(
            TaskLifecycleEvent::fail_with_error("boom").error_message(),
            Some("boom")
        );
    }

    #[test]
    fn test_terminal_events() {
        assert!(!TaskLifecycleEvent::Start.is_terminal());
        assert!(TaskLifecycleEvent::Succeed.is_terminal());
        assert!(TaskLifecycleEvent::Fail("x".into()).is_terminal());
        assert!(TaskLifecycleEvent::Cancel { user: None }.is_terminal());
    }
}
