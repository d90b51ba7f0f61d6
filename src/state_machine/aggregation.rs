//! Derived aggregate status.
//!
//! A provider task's status is a pure function of its work tasks' statuses,
//! and a run's status is a pure function of its provider tasks' statuses.
//! No hidden state: re-running either derivation always yields the same
//! answer, which is what lets the finalization barrier be idempotent.

use super::states::TaskState;

/// Derive a provider task's terminal status from its work tasks.
///
/// Returns `None` while any task is still non-terminal. Once all are
/// terminal: all CANCELED ⇒ CANCELED; any FAILED ⇒ INCOMPLETE; otherwise
/// COMPLETED. FAILED outranks CANCELED when mixed.
pub fn derive_provider_status(tasks: &[TaskState]) -> Option<TaskState> {
    if tasks.is_empty() || !tasks.iter().all(TaskState::is_terminal_for_task) {
        return None;
    }
    if tasks.iter().all(|s| *s == TaskState::Canceled) {
        Some(TaskState::Canceled)
    } else if tasks.iter().any(|s| *s == TaskState::Failed) {
        Some(TaskState::Incomplete)
    } else {
        Some(TaskState::Completed)
    }
}

/// Derive a run's terminal status from its provider tasks (the reserved
/// "run" bookkeeping record excluded by the caller).
///
/// Returns `None` while any provider task is still non-terminal. Once all
/// are terminal: all CANCELED ⇒ CANCELED; any INCOMPLETE ⇒ INCOMPLETE;
/// otherwise COMPLETED.
pub fn derive_run_status(provider_tasks: &[TaskState]) -> Option<TaskState> {
    if provider_tasks.is_empty() || !provider_tasks.iter().all(TaskState::is_finished) {
        return None;
    }
    if provider_tasks.iter().all(|s| *s == TaskState::Canceled) {
        Some(TaskState::Canceled)
    } else if provider_tasks.iter().any(TaskState::is_incomplete) {
        Some(TaskState::Incomplete)
    } else {
        Some(TaskState::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_provider_all_success() {
        let tasks = [TaskState::Success, TaskState::Success, TaskState::Success];
        assert_eq!(derive_provider_status(&tasks), Some(TaskState::Completed));
    }

    #[test]
    fn test_provider_all_canceled() {
        let tasks = [TaskState::Canceled, TaskState::Canceled];
        assert_eq!(derive_provider_status(&tasks), Some(TaskState::Canceled));
    }

    #[test]
    fn test_provider_failure_outranks_cancel() {
        // One real failure plus forced cancellations is a failure outcome,
        // not a cancel outcome.
        let tasks = [TaskState::Failed, TaskState::Canceled, TaskState::Canceled];
        assert_eq!(derive_provider_status(&tasks), Some(TaskState::Incomplete));
    }

    #[test]
    fn test_provider_partial_cancel_with_successes() {
        let tasks = [TaskState::Success, TaskState::Canceled];
        assert_eq!(derive_provider_status(&tasks), Some(TaskState::Completed));
    }

    #[test]
    fn test_provider_waits_for_nonterminal() {
        let tasks = [TaskState::Success, TaskState::Running];
        assert_eq!(derive_provider_status(&tasks), None);
        let tasks = [TaskState::Success, TaskState::Pending];
        assert_eq!(derive_provider_status(&tasks), None);
    }

    #[test]
    fn test_provider_empty_is_undecided() {
        assert_eq!(derive_provider_status(&[]), None);
    }

    #[test]
    fn test_run_mixed_canceled_and_completed() {
        // A canceled provider alongside a completed one is not all-canceled,
        // and a cancel is not a failure: run completes.
        let providers = [TaskState::Canceled, TaskState::Completed];
        assert_eq!(derive_run_status(&providers), Some(TaskState::Completed));
    }

    #[test]
    fn test_run_incomplete_wins_over_cancel() {
        let providers = [TaskState::Incomplete, TaskState::Canceled];
        assert_eq!(derive_run_status(&providers), Some(TaskState::Incomplete));
    }

    #[test]
    fn test_run_all_canceled() {
        let providers = [TaskState::Canceled, TaskState::Canceled];
        assert_eq!(derive_run_status(&providers), Some(TaskState::Canceled));
    }

    #[test]
    fn test_run_waits_for_nonterminal() {
        let providers = [TaskState::Completed, TaskState::Running];
        assert_eq!(derive_run_status(&providers), None);
    }

    fn terminal_task_state() -> impl Strategy<Value = TaskState> {
        prop_oneof![
            Just(TaskState::Success),
            Just(TaskState::Failed),
            Just(TaskState::Canceled),
        ]
    }

    fn finished_aggregate_state() -> impl Strategy<Value = TaskState> {
        prop_oneof![
            Just(TaskState::Completed),
            Just(TaskState::Incomplete),
            Just(TaskState::Canceled),
        ]
    }

    proptest! {
        // Re-running the aggregation twice yields the same status: the
        // derivation is a pure function of its inputs.
        #[test]
        fn prop_provider_derivation_is_deterministic(
            tasks in prop::collection::vec(terminal_task_state(), 1..12)
        ) {
            let first = derive_provider_status(&tasks);
            let second = derive_provider_status(&tasks);
            prop_assert_eq!(first, second);
            prop_assert!(first.is_some());
            prop_assert!(first.unwrap().is_terminal_for_aggregate());
        }

        #[test]
        fn prop_run_derivation_is_deterministic(
            providers in prop::collection::vec(finished_aggregate_state(), 1..8)
        ) {
            let first = derive_run_status(&providers);
            let second = derive_run_status(&providers);
            prop_assert_eq!(first, second);
            prop_assert!(first.is_some());
        }
    }
}
