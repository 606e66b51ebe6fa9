//! ZFS Replicator Library
//!
//! Replicates a tree of ZFS volumes to a remote host with daily
//! snapshot-based full and incremental sends over an mbuffer relay.

pub mod command;
pub mod config;
pub mod diff;
pub mod host;
pub mod inventory;
pub mod lock;
pub mod process;
pub mod remote;
pub mod replicator;
pub mod report;
pub mod snapshot;
pub mod transfer;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use crate::config::Parameters;
pub use crate::replicator::Replicator;
pub use crate::utils::errors::ReplicationError;
pub type Result<T> = std::result::Result<T, ReplicationError>;
