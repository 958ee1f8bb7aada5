//! Task event outbox and its delivery.

pub mod publisher;

pub use publisher::{EventPublisher, FlushReport};
