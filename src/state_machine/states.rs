use serde::{Deserialize, Serialize};
use std::fmt;

/// Flat status vocabulary shared by tasks, provider tasks, and runs.
///
/// `SUCCESS`/`FAILED`/`CANCELED` are terminal for a task;
/// `COMPLETED`/`INCOMPLETE`/`CANCELED` are terminal for a provider task and
/// for a run. Statuses serialize in wire form (`"SUCCESS"`) for parity with
/// persisted records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Initial state of a created run, before pickup.
    Submitted,
    /// Initial state of tasks and provider tasks at graph-compile time.
    Pending,
    /// A worker is executing the unit.
    Running,
    /// Task produced its result.
    Success,
    /// Task hit an unhandled error or the execution time limit.
    Failed,
    /// An external cancel signal was observed.
    Canceled,
    /// Aggregate: at least one child failed.
    Incomplete,
    /// Aggregate: every child succeeded.
    Completed,
}

impl TaskState {
    /// States from which no further transition happens, at any level.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Canceled | Self::Incomplete | Self::Completed
        )
    }

    /// States that make an aggregate INCOMPLETE. FAILED outranks CANCELED
    /// when mixed: cancellation-on-failure is a side effect of the failure,
    /// not an independent user action.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Self::Failed | Self::Incomplete)
    }

    /// Terminal for a single task.
    pub fn is_terminal_for_task(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Canceled)
    }

    /// Terminal for a provider task or a run.
    pub fn is_terminal_for_aggregate(&self) -> bool {
        matches!(self, Self::Completed | Self::Incomplete | Self::Canceled)
    }

    /// The unit has not started doing work yet.
    pub fn is_not_started(&self) -> bool {
        matches!(self, Self::Submitted | Self::Pending)
    }

    /// A worker is actively processing the unit.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl Default for TaskState {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Submitted => write!(f, "SUBMITTED"),
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Success => write!(f, "SUCCESS"),
            Self::Failed => write!(f, "FAILED"),
            Self::Canceled => write!(f, "CANCELED"),
            Self::Incomplete => write!(f, "INCOMPLETE"),
            Self::Completed => write!(f, "COMPLETED"),
        }
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUBMITTED" => Ok(Self::Submitted),
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            "CANCELED" => Ok(Self::Canceled),
            "INCOMPLETE" => Ok(Self::Incomplete),
            "COMPLETED" => Ok(Self::Completed),
            _ => Err(format!("Invalid task state: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_checks() {
        assert!(TaskState::Success.is_terminal_for_task());
        assert!(TaskState::Failed.is_terminal_for_task());
        assert!(TaskState::Canceled.is_terminal_for_task());
        assert!(!TaskState::Running.is_terminal_for_task());
        assert!(!TaskState::Completed.is_terminal_for_task());

        assert!(TaskState::Completed.is_terminal_for_aggregate());
        assert!(TaskState::Incomplete.is_terminal_for_aggregate());
        assert!(TaskState::Canceled.is_terminal_for_aggregate());
        assert!(!TaskState::Success.is_terminal_for_aggregate());
    }

    #[test]
    fn test_finished_group() {
        for state in [
            TaskState::Success,
            TaskState::Failed,
            TaskState::Canceled,
            TaskState::Incomplete,
            TaskState::Completed,
        ] {
            assert!(state.is_finished());
        }
        for state in [TaskState::Submitted, TaskState::Pending, TaskState::Running] {
            assert!(!state.is_finished());
        }
    }

    #[test]
    fn test_incomplete_group_excludes_canceled() {
        assert!(TaskState::Failed.is_incomplete());
        assert!(TaskState::Incomplete.is_incomplete());
        assert!(!TaskState::Canceled.is_incomplete());
    }

    #[test]
    fn test_string_conversion() {
        assert_eq!(TaskState::Running.to_string(), "RUNNING");
        assert_eq!("INCOMPLETE".parse::<TaskState>().unwrap(), TaskState::Incomplete);
        assert!("running".parse::<TaskState>().is_err());
    }

    #[test]
    fn test_state_serde() {
        let json = serde_json::to_string(&TaskState::Canceled).unwrap();
        assert_eq!(json, "\"CANCELED\"");
        let parsed: TaskState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, TaskState::Canceled);
    }
}
