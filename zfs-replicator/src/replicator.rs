//! One replication run: inventory, diff, full transfers, incremental
//! transfers, cleanup.

use std::time::Duration;

use chrono::Utc;

use crate::command::Toolbox;
use crate::config::{Parameters, PollBudget};
use crate::diff::{PathMapping, VolumeSetDiff};
use crate::host::{Host, LocalHost, LocalShell, RemoteHost};
use crate::inventory::list_volumes;
use crate::process::ProcessSynchronizer;
use crate::remote::{ConnectOptions, RemoteSession};
use crate::report::{report_outcome, Progress, RunSummary, VolumeOutcome};
use crate::snapshot::{Resolution, SnapshotLabel, SnapshotResolver};
use crate::transfer::{SuccessPolicy, TransferJob, TransferOrchestrator};
use crate::utils::errors::{ReplicationError, Result};

/// Settings of a run, derived from [`Parameters`].
#[derive(Debug, Clone)]
pub struct Replicator {
    tools: Toolbox,
    mapping: PathMapping,
    ignore_prefixes: Vec<String>,
    remote_addr: String,
    lookback_days: u32,
    drain: PollBudget,
    ready: PollBudget,
    settle: Duration,
    policy: SuccessPolicy,
    dry_run: bool,
}

impl Replicator {
    pub fn new(params: &Parameters) -> Self {
        Self {
            tools: Toolbox::from_parameters(params),
            mapping: PathMapping::new(&params.zfs_local_path, &params.zfs_distant_path),
            ignore_prefixes: params.ignore_prefixes(),
            remote_addr: params.ssh_host.clone(),
            lookback_days: params.lookback_days,
            drain: params.drain_budget(),
            ready: params.ready_budget(),
            settle: params.ready_settle(),
            policy: if params.strict_exit_status {
                SuccessPolicy::StrictExitStatus
            } else {
                SuccessPolicy::EmptyOutput
            },
            dry_run: false,
        }
    }

    pub fn with_policy(mut self, policy: SuccessPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Plan and resolve only; never launch, send or kill anything.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Inventory both sides and partition the local volumes.
    pub fn plan(&self, local: &dyn Host, remote: &dyn Host) -> Result<VolumeSetDiff> {
        tracing::info!("Retrieving distant volumes ...");
        let remote_volumes = list_volumes(remote, &self.tools, &self.mapping.remote_root)?;

        tracing::info!("Retrieving local volumes ...");
        let local_volumes = list_volumes(local, &self.tools, &self.mapping.local_root)?;

        let diff = VolumeSetDiff::compute(
            &local_volumes,
            &remote_volumes,
            &self.ignore_prefixes,
            &self.mapping,
        );
        tracing::info!(
            total = diff.total(),
            full = diff.needs_full.len(),
            incremental = diff.needs_incremental.len(),
            ignored = diff.ignored.len(),
            "We have {} existing volumes that do not exist on target",
            diff.needs_full.len()
        );
        Ok(diff)
    }

    /// Run the whole replication, then clean leftover relays on both sides
    /// whatever the result.
    pub fn run<L, R>(&self, local: &L, remote: &mut R, today: SnapshotLabel) -> Result<RunSummary>
    where
        L: LocalHost,
        R: RemoteHost,
    {
        let sync = ProcessSynchronizer::new(&self.tools, self.drain, self.ready);
        let result = self.replicate(local, remote, today, &sync);

        if !self.dry_run {
            self.cleanup(local, &*remote, &sync);
        }

        match &result {
            Ok(summary) => tracing::info!(
                synced = summary.synced(),
                already_synced = summary.already_synced,
                failed = summary.failed,
                ignored = summary.ignored,
                "Finished !"
            ),
            Err(e) => tracing::error!(error = %e, "Replication aborted"),
        }
        result
    }

    fn replicate<L, R>(
        &self,
        local: &L,
        remote: &mut R,
        today: SnapshotLabel,
        sync: &ProcessSynchronizer<'_>,
    ) -> Result<RunSummary>
    where
        L: LocalHost,
        R: RemoteHost,
    {
        let diff = self.plan(local, &*remote)?;
        let mut summary = RunSummary {
            ignored: diff.ignored.len(),
            ..Default::default()
        };
        for volume in &diff.ignored {
            tracing::debug!(volume = %volume, "Ignored, missing on target");
        }

        let orchestrator = TransferOrchestrator::new(
            &self.tools,
            sync,
            self.remote_addr.clone(),
            self.settle,
            self.policy,
        );
        let resolver = SnapshotResolver::new(&self.tools, self.lookback_days);

        for (index, volume) in diff.needs_full.iter().enumerate() {
            let progress = Progress::new(index, diff.needs_full.len());
            let job = TransferJob::full(volume, &self.mapping.to_remote(volume), today);
            tracing::info!(progress = %progress, volume = %volume, "{} Syncing {} ...", progress, volume);

            let outcome = self
                .transfer(&orchestrator, local, remote, &job)
                .or_else(per_volume)?;
            report_outcome(progress, volume, &outcome);
            summary.record(volume, &outcome);
        }

        tracing::info!(
            "We have {} volumes to sync with incremental method",
            diff.needs_incremental.len()
        );

        for (index, volume) in diff.needs_incremental.iter().enumerate() {
            let progress = Progress::new(index, diff.needs_incremental.len());
            let remote_volume = self.mapping.to_remote(volume);

            let attempt = match resolver.resolve(&*remote, &remote_volume, today) {
                Err(e) => Err(e),
                Ok(Resolution::AlreadySynced) => Ok(VolumeOutcome::AlreadySynced),
                Ok(Resolution::NoSuitableBase) => Err(ReplicationError::NoSuitableBase {
                    volume: volume.clone(),
                    lookback_days: resolver.lookback_days(),
                }),
                Ok(Resolution::Base(base)) => {
                    tracing::info!(
                        progress = %progress,
                        volume = %volume,
                        base = %base,
                        "{} Syncing {} from @{} ...",
                        progress,
                        volume,
                        base
                    );
                    let job = TransferJob::incremental(volume, &remote_volume, base, today);
                    self.transfer(&orchestrator, local, remote, &job)
                }
            };
            let outcome = attempt.or_else(per_volume)?;
            report_outcome(progress, volume, &outcome);
            summary.record(volume, &outcome);
        }

        Ok(summary)
    }

    fn transfer<L, R>(
        &self,
        orchestrator: &TransferOrchestrator<'_>,
        local: &L,
        remote: &mut R,
        job: &TransferJob,
    ) -> Result<VolumeOutcome>
    where
        L: LocalHost,
        R: RemoteHost,
    {
        if self.dry_run {
            return Ok(VolumeOutcome::Planned(job.mode));
        }

        let report = orchestrator.execute(local, remote, job)?;
        match report.failure {
            None => Ok(VolumeOutcome::Synced {
                mode: job.mode,
                elapsed: report.elapsed,
            }),
            Some(failure) => Err(ReplicationError::TransferExec(failure)),
        }
    }

    /// Best effort: kill whatever relay is still bound to the port.
    fn cleanup(
        &self,
        local: &dyn Host,
        remote: &dyn Host,
        sync: &ProcessSynchronizer<'_>,
    ) {
        for host in [remote, local] {
            if let Err(e) = sync.kill_drain(host) {
                tracing::warn!(side = %host.side(), error = %e, "Relay cleanup failed");
            }
        }
    }
}

/// Per-volume errors end up in the summary; anything else aborts the run.
fn per_volume(err: ReplicationError) -> Result<VolumeOutcome> {
    if err.is_fatal() {
        Err(err)
    } else {
        Ok(VolumeOutcome::Failed(err))
    }
}

/// Today's snapshot label (UTC).
pub fn today() -> SnapshotLabel {
    SnapshotLabel::new(Utc::now().date_naive())
}

/// Connect, replicate, disconnect. The remote session is released on every
/// path once it has been opened.
pub fn run_with_session(params: &Parameters, replicator: &Replicator) -> Result<RunSummary> {
    let local = LocalShell::new();
    let mut session = RemoteSession::connect(&ConnectOptions::from_parameters(params))?;

    let result = replicator.run(&local, &mut session, today());

    session.disconnect();
    result
}
