//! # Execution
//!
//! The execution substrate: the queue-backend contract, the in-process
//! tokio implementation, per-step handlers with their typed dispatch table,
//! and cooperative cancellation tokens.

pub mod handlers;
pub mod local;
pub mod substrate;
pub mod token;

pub use handlers::{HandlerRegistry, StepContext, StepHandler, StepOutcome};
pub use local::{ChainRunner, LocalSubstrate};
pub use substrate::{ExecutionSubstrate, SubmitHandle, SubstrateError, TokenRegistry};
pub use token::CancellationToken;
