//! Per-volume outcome reporting and the end-of-run summary.

use std::fmt;
use std::time::Duration;

use crate::transfer::TransferMode;
use crate::utils::errors::ReplicationError;

/// Position in a work list, displayed as a percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub index: usize,
    pub total: usize,
}

impl Progress {
    pub fn new(index: usize, total: usize) -> Self {
        Self { index, total }
    }

    /// Share of the list already processed, 0-100.
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.index as f64 / self.total as f64 * 100.0
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:5.1}%]", self.percent())
    }
}

/// What happened to one volume.
#[derive(Debug)]
pub enum VolumeOutcome {
    Synced { mode: TransferMode, elapsed: Duration },
    AlreadySynced,
    /// Dry run: the transfer that would have been issued
    Planned(TransferMode),
    /// Per-volume failure; the run went on
    Failed(ReplicationError),
}

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub full_synced: usize,
    pub incremental_synced: usize,
    pub already_synced: usize,
    pub planned: usize,
    pub failed: usize,
    pub ignored: usize,
    pub failed_volumes: Vec<String>,
}

impl RunSummary {
    pub fn record(&mut self, volume: &str, outcome: &VolumeOutcome) {
        match outcome {
            VolumeOutcome::Synced { mode: TransferMode::Full, .. } => self.full_synced += 1,
            VolumeOutcome::Synced { .. } => self.incremental_synced += 1,
            VolumeOutcome::AlreadySynced => self.already_synced += 1,
            VolumeOutcome::Planned(_) => self.planned += 1,
            VolumeOutcome::Failed(_) => {
                self.failed += 1;
                self.failed_volumes.push(volume.to_string());
            }
        }
    }

    pub fn synced(&self) -> usize {
        self.full_synced + self.incremental_synced
    }
}

/// Log one outcome line.
pub fn report_outcome(progress: Progress, volume: &str, outcome: &VolumeOutcome) {
    match outcome {
        VolumeOutcome::Synced { mode, elapsed } => tracing::info!(
            progress = %progress,
            volume,
            kind = mode_name(mode),
            elapsed_secs = elapsed.as_secs_f64(),
            "{} Synced {:<60} OK in {:7.2} seconds",
            progress,
            volume,
            elapsed.as_secs_f64()
        ),
        VolumeOutcome::AlreadySynced => tracing::info!(
            progress = %progress,
            volume,
            "{} {:<60} already synced",
            progress,
            volume
        ),
        VolumeOutcome::Planned(mode) => tracing::info!(
            progress = %progress,
            volume,
            kind = mode_name(mode),
            "{} Would sync {:<60} ({})",
            progress,
            volume,
            describe_mode(mode)
        ),
        VolumeOutcome::Failed(ReplicationError::NoSuitableBase { .. }) => tracing::error!(
            progress = %progress,
            volume,
            "{} ERROR WITH {:<60}: cannot find source snapshot suitable",
            progress,
            volume
        ),
        VolumeOutcome::Failed(err) => tracing::error!(
            progress = %progress,
            volume,
            error = %err,
            "{} Synced {:<60} FAILED: {}",
            progress,
            volume,
            err.to_string().trim_end()
        ),
    }
}

fn mode_name(mode: &TransferMode) -> &'static str {
    match mode {
        TransferMode::Full => "full",
        TransferMode::Incremental { .. } => "incremental",
    }
}

fn describe_mode(mode: &TransferMode) -> String {
    match mode {
        TransferMode::Full => "full".to_string(),
        TransferMode::Incremental { base } => format!("incremental from @{}", base),
    }
}
