//! Snapshot labels and base-snapshot resolution for incremental transfers.

use std::fmt;

use chrono::{Days, NaiveDate};

use crate::command::Toolbox;
use crate::host::Host;
use crate::utils::errors::Result;

/// Date label of a daily snapshot, rendered `YYYY-MM-DD.000000Z`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotLabel(NaiveDate);

impl SnapshotLabel {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    /// Label `days` before this one.
    pub fn days_before(&self, days: u32) -> Option<Self> {
        self.0.checked_sub_days(Days::new(u64::from(days))).map(Self)
    }

    /// Full snapshot name for a volume.
    pub fn of(&self, volume: &str) -> String {
        format!("{}@{}", volume, self)
    }
}

impl fmt::Display for SnapshotLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.000000Z", self.0.format("%Y-%m-%d"))
    }
}

/// What an incremental transfer should do for one volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Today's snapshot is already on the remote side
    AlreadySynced,
    /// Send the increment from this snapshot to today's
    Base(SnapshotLabel),
    /// No common snapshot inside the lookback window
    NoSuitableBase,
}

/// Whether `volume@label` exists on `host`. Queried each time, never cached.
pub fn snapshot_exists(
    host: &dyn Host,
    tools: &Toolbox,
    volume: &str,
    label: SnapshotLabel,
) -> Result<bool> {
    let name = label.of(volume);
    let output = host.execute(&tools.list_snapshot(&name))?;
    Ok(output.stdout.trim() == name)
}

/// Finds the base snapshot for an incremental transfer of `remote_volume`.
#[derive(Debug, Clone)]
pub struct SnapshotResolver<'a> {
    tools: &'a Toolbox,
    lookback_days: u32,
}

impl<'a> SnapshotResolver<'a> {
    pub fn new(tools: &'a Toolbox, lookback_days: u32) -> Self {
        Self {
            tools,
            lookback_days,
        }
    }

    pub fn lookback_days(&self) -> u32 {
        self.lookback_days
    }

    /// Checks today first, then walks back one day at a time up to the
    /// lookback depth. At most `1 + lookback_days` remote queries.
    pub fn resolve(
        &self,
        remote: &dyn Host,
        remote_volume: &str,
        today: SnapshotLabel,
    ) -> Result<Resolution> {
        if snapshot_exists(remote, self.tools, remote_volume, today)? {
            return Ok(Resolution::AlreadySynced);
        }

        for depth in 1..=self.lookback_days {
            let Some(candidate) = today.days_before(depth) else {
                break;
            };
            if snapshot_exists(remote, self.tools, remote_volume, candidate)? {
                tracing::debug!(volume = remote_volume, base = %candidate, depth, "Found base snapshot");
                return Ok(Resolution::Base(candidate));
            }
        }

        Ok(Resolution::NoSuitableBase)
    }
}
