//! Error types for the replicator.

use std::path::PathBuf;
use thiserror::Error;

use crate::host::Side;

#[derive(Error, Debug)]
pub enum ReplicationError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cannot connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },

    #[error("Unable to verify server identity! Server returned this fingerprint: {actual} (expected {expected})")]
    IdentityMismatch { expected: String, actual: String },

    #[error("Authentication rejected by server: {0}")]
    Auth(String),

    #[error("Remote command `{command}` failed: {reason}")]
    RemoteExec { command: String, reason: String },

    #[error("Remote shell write failed: {0}")]
    RemoteShell(String),

    #[error("Volume listing failed on {side} side: {reason}")]
    InventoryQuery { side: Side, reason: String },

    #[error("Process table query failed on {side} side: {reason}")]
    ProcessQuery { side: Side, reason: String },

    #[error("{0}")]
    TransferExec(TransferFailure),

    #[error("Relay process on port {port} still running on {side} side after {polls} polls")]
    DrainTimeout { side: Side, port: u16, polls: u32 },

    #[error("cannot find source snapshot suitable for {volume} within {lookback_days} days")]
    NoSuitableBase { volume: String, lookback_days: u32 },

    #[error("Another replication run holds the lock {}", .0.display())]
    AlreadyRunning(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which part of a transfer pipeline failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    /// Captured output was not empty
    Output,
    /// Receiver never showed up on the remote side
    Receiver,
    /// `zfs send` exited non-zero
    Send,
    /// Local relay exited non-zero
    Relay,
    /// Target snapshot missing remotely after the transfer drained
    Receive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFailure {
    pub stage: FailureStage,
    pub message: String,
}

impl std::fmt::Display for TransferFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.stage {
            FailureStage::Output => write!(f, "{}", self.message),
            stage => write!(f, "{:?} stage failed: {}", stage, self.message),
        }
    }
}

/// Whether an error aborts the whole run or only the current volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Fatal,
    PerVolume,
}

impl ReplicationError {
    pub fn severity(&self) -> Severity {
        match self {
            ReplicationError::TransferExec(_) | ReplicationError::NoSuitableBase { .. } => {
                Severity::PerVolume
            }
            _ => Severity::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }

    /// Process exit code for a run aborted by this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            ReplicationError::DrainTimeout { .. } => 2,
            _ => 1,
        }
    }
}

impl From<config::ConfigError> for ReplicationError {
    fn from(err: config::ConfigError) -> Self {
        ReplicationError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ReplicationError>;
