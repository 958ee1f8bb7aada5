//! Resource leases with a TTL.

pub mod manager;

pub use manager::{DEFAULT_TTL, LockManager, LockScope, MAX_TTL};
