//! Lifecycle event bus.

pub mod publisher;

pub use publisher::{EventPublisher, PublishedEvent};
