//! Utility modules for the replicator.

pub mod errors;
pub mod logger;

pub use errors::{ReplicationError, Result, Severity};
