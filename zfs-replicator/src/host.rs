//! The two sides of a replication run.
//!
//! [`Host`] is what every component needs from a machine: run a command to
//! completion and signal a process. The local side additionally runs the
//! sending pipeline; the remote side additionally launches commands in the
//! background on its interactive channel.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};

use nix::fcntl::OFlag;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{pipe2, Pid};

use crate::command::CommandLine;
use crate::utils::errors::{ReplicationError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Local,
    Remote,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Local => f.write_str("local"),
            Side::Remote => f.write_str("remote"),
        }
    }
}

/// Captured result of a command run to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// Exit status and captured text of one pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageStatus {
    pub program: String,
    /// `None` when the stage was killed by a signal
    pub exit_code: Option<i32>,
    pub output: String,
}

impl StageStatus {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Result of a local pipeline, one entry per stage in pipeline order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineOutput {
    pub stages: Vec<StageStatus>,
}

impl PipelineOutput {
    /// Everything the pipeline printed, stage by stage.
    pub fn combined_output(&self) -> String {
        self.stages
            .iter()
            .map(|stage| stage.output.as_str())
            .collect::<String>()
    }
}

pub trait Host {
    fn side(&self) -> Side;

    /// Run a command to completion and capture its output.
    fn execute(&self, command: &CommandLine) -> Result<CommandOutput>;

    /// Send SIGTERM to a process. Best effort.
    fn terminate(&self, pid: u32) -> Result<()>;
}

/// The sending side.
pub trait LocalHost: Host {
    /// Run `stages` connected stdout-to-stdin and wait for all of them.
    fn run_pipeline(&self, stages: &[CommandLine]) -> Result<PipelineOutput>;
}

/// The receiving side.
pub trait RemoteHost: Host {
    /// Start a command that keeps running after this call returns.
    fn launch_background(&mut self, command: &str) -> Result<()>;
}

/// This machine, driven through `std::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalShell;

impl LocalShell {
    pub fn new() -> Self {
        Self
    }
}

fn exit_code(status: ExitStatus) -> Option<i32> {
    status.code()
}

impl Host for LocalShell {
    fn side(&self) -> Side {
        Side::Local
    }

    fn execute(&self, command: &CommandLine) -> Result<CommandOutput> {
        let output = Command::new(command.program())
            .args(command.arguments())
            .stdin(Stdio::null())
            .output()?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_status: exit_code(output.status).unwrap_or(-1),
        })
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        let pid = i32::try_from(pid).map_err(|_| {
            ReplicationError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("pid {} out of range", pid),
            ))
        })?;
        kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(std::io::Error::from)?;
        Ok(())
    }
}

impl LocalHost for LocalShell {
    fn run_pipeline(&self, stages: &[CommandLine]) -> Result<PipelineOutput> {
        let mut children = Vec::with_capacity(stages.len());
        let mut readers = Vec::with_capacity(stages.len());
        let mut previous_stdout = None;

        for (index, stage) in stages.iter().enumerate() {
            let last = index + 1 == stages.len();
            let stdin = match previous_stdout.take() {
                Some(stdout) => Stdio::from(stdout),
                None => Stdio::null(),
            };

            // One pipe per stage carries stderr, plus stdout for the last
            // stage, so the captured text keeps the order it was written in.
            let (output_read, output_write) =
                pipe2(OFlag::O_CLOEXEC).map_err(std::io::Error::from)?;
            let stdout = if last {
                Stdio::from(output_write.try_clone()?)
            } else {
                Stdio::piped()
            };

            let mut child = Command::new(stage.program())
                .args(stage.arguments())
                .stdin(stdin)
                .stdout(stdout)
                .stderr(Stdio::from(output_write))
                .spawn()?;

            if !last {
                previous_stdout = child.stdout.take();
            }
            children.push(child);

            let mut output = File::from(output_read);
            readers.push(std::thread::spawn(move || {
                let mut text = Vec::new();
                let _ = output.read_to_end(&mut text);
                String::from_utf8_lossy(&text).into_owned()
            }));
        }

        let mut output = PipelineOutput::default();
        for ((stage, mut child), reader) in stages.iter().zip(children).zip(readers) {
            let status = child.wait()?;
            let text = reader.join().unwrap_or_default();
            output.stages.push(StageStatus {
                program: stage.program().to_string(),
                exit_code: exit_code(status),
                output: text,
            });
        }

        tracing::debug!(stages = output.stages.len(), "Pipeline finished");
        Ok(output)
    }
}
