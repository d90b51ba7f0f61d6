//! # State Machine
//!
//! Authoritative transition rules for task, provider-task, and run status.
//! Task transitions go through [`TaskStateMachine`]; aggregate statuses are
//! pure derivations in [`aggregation`], which is what makes finalization
//! idempotent and re-runnable.

pub mod aggregation;
pub mod events;
pub mod states;
pub mod task_state_machine;

pub use aggregation::{derive_provider_status, derive_run_status};
pub use events::TaskLifecycleEvent;
pub use states::TaskState;
pub use task_state_machine::{
    TaskStateMachine, TransitionError, TransitionOutcome, TransitionResult,
};
