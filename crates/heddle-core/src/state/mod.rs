//! Durable state access shared by every component.

pub mod manager;

pub use manager::{StateManager, Transaction};
