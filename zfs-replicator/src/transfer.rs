//! Transfer orchestration: one full or incremental send of one volume.
//!
//! The receiving pipeline is started on the remote interactive channel, the
//! sending pipeline runs locally, and both relays are drained before the
//! next transfer may use the port.

use std::thread;
use std::time::{Duration, Instant};

use crate::command::{pipeline_to_shell, Toolbox};
use crate::host::{LocalHost, PipelineOutput, RemoteHost};
use crate::process::{DrainStatus, ProcessSynchronizer, ReadyStatus};
use crate::snapshot::{snapshot_exists, SnapshotLabel};
use crate::utils::errors::{FailureStage, ReplicationError, Result, TransferFailure};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Full,
    Incremental { base: SnapshotLabel },
}

/// One volume to move, created right before it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferJob {
    pub volume: String,
    pub remote_volume: String,
    pub mode: TransferMode,
    pub target: SnapshotLabel,
}

impl TransferJob {
    pub fn full(volume: &str, remote_volume: &str, target: SnapshotLabel) -> Self {
        Self {
            volume: volume.to_string(),
            remote_volume: remote_volume.to_string(),
            mode: TransferMode::Full,
            target,
        }
    }

    pub fn incremental(
        volume: &str,
        remote_volume: &str,
        base: SnapshotLabel,
        target: SnapshotLabel,
    ) -> Self {
        Self {
            volume: volume.to_string(),
            remote_volume: remote_volume.to_string(),
            mode: TransferMode::Incremental { base },
            target,
        }
    }
}

/// How a finished pipeline is judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SuccessPolicy {
    /// Success iff the sending pipeline printed nothing
    #[default]
    EmptyOutput,
    /// Also require every stage to exit zero and the target snapshot to
    /// exist remotely afterwards
    StrictExitStatus,
}

/// Result of one transfer attempt that did not abort the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub elapsed: Duration,
    pub failure: Option<TransferFailure>,
    /// Local relay pid killed after a failure
    pub killed_relay: Option<u32>,
}

impl TransferReport {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

pub struct TransferOrchestrator<'a> {
    tools: &'a Toolbox,
    sync: &'a ProcessSynchronizer<'a>,
    remote_addr: String,
    settle: Duration,
    policy: SuccessPolicy,
}

impl<'a> TransferOrchestrator<'a> {
    pub fn new(
        tools: &'a Toolbox,
        sync: &'a ProcessSynchronizer<'a>,
        remote_addr: impl Into<String>,
        settle: Duration,
        policy: SuccessPolicy,
    ) -> Self {
        Self {
            tools,
            sync,
            remote_addr: remote_addr.into(),
            settle,
            policy,
        }
    }

    /// Shell line started in the background on the remote side.
    pub fn receive_command(&self, job: &TransferJob) -> String {
        format!(
            "{} 2>&1",
            pipeline_to_shell(&[self.tools.relay_listen(), self.tools.receive(&job.remote_volume)])
        )
    }

    pub fn send_stages(&self, job: &TransferJob) -> Vec<crate::command::CommandLine> {
        let target = job.target.of(&job.volume);
        let base = match job.mode {
            TransferMode::Full => None,
            TransferMode::Incremental { base } => Some(base.of(&job.volume)),
        };
        vec![
            self.tools.send(base.as_deref(), &target),
            self.tools.relay_forward(&self.remote_addr),
        ]
    }

    /// Run one transfer. `Err` only for failures that must abort the run;
    /// a failed transfer is reported in the returned report.
    pub fn execute<L, R>(&self, local: &L, remote: &mut R, job: &TransferJob) -> Result<TransferReport>
    where
        L: LocalHost,
        R: RemoteHost,
    {
        let start = Instant::now();

        remote.launch_background(&self.receive_command(job))?;

        let failure = match self.sync.wait_for_listener(&*remote)? {
            ReadyStatus::Ready => {
                thread::sleep(self.settle);
                self.send(local, job)
            }
            ReadyStatus::TimedOut => Some(TransferFailure {
                stage: FailureStage::Receiver,
                message: format!(
                    "receiver did not start listening on port {}",
                    self.sync.port()
                ),
            }),
        };

        let killed_relay = match failure {
            Some(_) => self.sync.kill_drain(local)?,
            None => None,
        };
        // A receiver that came up after the readiness budget waits for a
        // sender that will never connect.
        if matches!(&failure, Some(f) if f.stage == FailureStage::Receiver) {
            self.sync.kill_drain(&*remote)?;
        }

        self.drain(local)?;
        self.drain(&*remote)?;

        let failure = match (failure, self.policy) {
            (None, SuccessPolicy::StrictExitStatus) => self.verify_received(&*remote, job)?,
            (failure, _) => failure,
        };

        Ok(TransferReport {
            elapsed: start.elapsed(),
            failure,
            killed_relay,
        })
    }

    fn send<L: LocalHost>(&self, local: &L, job: &TransferJob) -> Option<TransferFailure> {
        match local.run_pipeline(&self.send_stages(job)) {
            Ok(output) => self.judge(&output),
            Err(e) => Some(TransferFailure {
                stage: FailureStage::Send,
                message: e.to_string(),
            }),
        }
    }

    /// Classify a finished sending pipeline according to the policy.
    pub fn judge(&self, output: &PipelineOutput) -> Option<TransferFailure> {
        if self.policy == SuccessPolicy::StrictExitStatus {
            let stages = [FailureStage::Send, FailureStage::Relay];
            for (stage, status) in stages.into_iter().zip(&output.stages) {
                if !status.success() {
                    let message = match status.exit_code {
                        Some(code) => format!("{} exited with {}: {}", status.program, code, status.output.trim()),
                        None => format!("{} killed by signal: {}", status.program, status.output.trim()),
                    };
                    return Some(TransferFailure { stage, message });
                }
            }
        }

        let text = output.combined_output();
        if text.is_empty() {
            None
        } else {
            Some(TransferFailure {
                stage: FailureStage::Output,
                message: text,
            })
        }
    }

    fn drain(&self, host: &dyn crate::host::Host) -> Result<()> {
        match self.sync.wait_for_drain(host)? {
            DrainStatus::Drained => Ok(()),
            DrainStatus::TimedOut => Err(ReplicationError::DrainTimeout {
                side: host.side(),
                port: self.sync.port(),
                polls: self.sync.drain_budget().max_polls,
            }),
        }
    }

    fn verify_received(
        &self,
        remote: &dyn crate::host::Host,
        job: &TransferJob,
    ) -> Result<Option<TransferFailure>> {
        if snapshot_exists(remote, self.tools, &job.remote_volume, job.target)? {
            return Ok(None);
        }
        Ok(Some(TransferFailure {
            stage: FailureStage::Receive,
            message: format!("{} missing after transfer", job.target.of(&job.remote_volume)),
        }))
    }
}
