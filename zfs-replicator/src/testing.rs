//! In-memory hosts for unit tests.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;

use crate::command::{CommandLine, Toolbox};
use crate::config::{Parameters, RelayConfig};
use crate::host::{CommandOutput, Host, LocalHost, PipelineOutput, RemoteHost, Side, StageStatus};
use crate::snapshot::SnapshotLabel;
use crate::utils::errors::{ReplicationError, Result};

pub const RELAY_PID: u32 = 4242;

pub fn toolbox() -> Toolbox {
    Toolbox::new(
        "zfs",
        RelayConfig {
            program: "mbuffer".into(),
            ..RelayConfig::default()
        },
    )
}

pub fn label(date: &str) -> SnapshotLabel {
    SnapshotLabel::new(NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap())
}

pub fn sample_parameters() -> Parameters {
    Parameters {
        ssh_host: "backup.example.org".into(),
        ssh_port: 22,
        ssh_fingerprint: "4f2a190cabcdef0123456789abcdef01".into(),
        ssh_auth_user: "replicator".into(),
        ssh_auth_pub: "/root/.ssh/id_rsa.pub".into(),
        ssh_auth_priv: "/root/.ssh/id_rsa".into(),
        ssh_auth_pass: "secret".into(),
        ssh_cipher: None,
        zfs_local_path: "tank".into(),
        zfs_distant_path: "tank".into(),
        zfs_ignore_paths: String::new(),
        zfs_bin: "zfs".into(),
        mbuffer_bin: "mbuffer".into(),
        relay_port: 31330,
        relay_block_size: "128k".into(),
        relay_timeout: 600,
        relay_memory: "100M".into(),
        drain_poll_interval_ms: 0,
        drain_max_polls: 50,
        ready_poll_interval_ms: 0,
        ready_max_polls: 5,
        ready_settle_ms: 0,
        lookback_days: 9,
        strict_exit_status: false,
        lock_file: std::env::temp_dir().join("zfs-replicate-test.lock"),
        log_level: "info".into(),
    }
}

/// A scripted host. Answers snapshot lookups from its snapshot set, the
/// process table from its relay state, and everything else from canned
/// responses (empty success by default).
pub struct FakeHost {
    side: Side,
    responses: RefCell<HashMap<String, CommandOutput>>,
    snapshots: RefCell<HashSet<String>>,
    executed: RefCell<Vec<String>>,
    launched: RefCell<Vec<String>>,
    pipelines: RefCell<Vec<Vec<String>>>,
    terminated: RefCell<Vec<u32>>,
    fail_execute: Cell<bool>,
    relay_visible_for: Cell<u32>,
    relay_stuck: Cell<bool>,
    relay_starts_in: Cell<Option<u32>>,
    relay_listening: Cell<bool>,
    ps_error: RefCell<Option<String>>,
    ps_queries: Cell<usize>,
    launch_starts_relay: Cell<bool>,
    pipeline_output: RefCell<Option<PipelineOutput>>,
    pipeline_leaves_relay: Cell<bool>,
}

impl FakeHost {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            responses: RefCell::new(HashMap::new()),
            snapshots: RefCell::new(HashSet::new()),
            executed: RefCell::new(Vec::new()),
            launched: RefCell::new(Vec::new()),
            pipelines: RefCell::new(Vec::new()),
            terminated: RefCell::new(Vec::new()),
            fail_execute: Cell::new(false),
            relay_visible_for: Cell::new(0),
            relay_stuck: Cell::new(false),
            relay_starts_in: Cell::new(None),
            relay_listening: Cell::new(false),
            ps_error: RefCell::new(None),
            ps_queries: Cell::new(0),
            launch_starts_relay: Cell::new(true),
            pipeline_output: RefCell::new(None),
            pipeline_leaves_relay: Cell::new(false),
        }
    }

    pub fn respond(&self, command: &str, output: CommandOutput) {
        self.responses.borrow_mut().insert(command.to_string(), output);
    }

    pub fn add_snapshot(&self, name: &str) {
        self.snapshots.borrow_mut().insert(name.to_string());
    }

    pub fn fail_execute(&self) {
        self.fail_execute.set(true);
    }

    /// The next `probes` process-table queries show a live relay.
    pub fn show_relay_for(&self, probes: u32) {
        self.relay_visible_for.set(probes);
    }

    pub fn set_relay_stuck(&self, stuck: bool) {
        self.relay_stuck.set(stuck);
    }

    /// A relay appears after `probes` empty process-table queries and keeps
    /// listening until terminated.
    pub fn start_relay_after(&self, probes: u32) {
        self.relay_starts_in.set(Some(probes));
    }

    /// Every process-table query exits 1 with `stderr`.
    pub fn break_process_table(&self, stderr: &str) {
        *self.ps_error.borrow_mut() = Some(stderr.to_string());
    }

    pub fn set_launch_starts_relay(&self, starts: bool) {
        self.launch_starts_relay.set(starts);
    }

    pub fn set_pipeline_output(&self, output: PipelineOutput) {
        *self.pipeline_output.borrow_mut() = Some(output);
    }

    pub fn set_pipeline_leaves_relay(&self, leaves: bool) {
        self.pipeline_leaves_relay.set(leaves);
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.borrow().clone()
    }

    pub fn launched(&self) -> Vec<String> {
        self.launched.borrow().clone()
    }

    pub fn pipelines(&self) -> Vec<Vec<String>> {
        self.pipelines.borrow().clone()
    }

    pub fn terminated(&self) -> Vec<u32> {
        self.terminated.borrow().clone()
    }

    pub fn process_table_queries(&self) -> usize {
        self.ps_queries.get()
    }

    fn process_table(&self) -> String {
        self.ps_queries.set(self.ps_queries.get() + 1);
        match self.relay_starts_in.get() {
            Some(0) => {
                self.relay_starts_in.set(None);
                self.relay_listening.set(true);
            }
            Some(remaining) => self.relay_starts_in.set(Some(remaining - 1)),
            None => {}
        }

        let visible = self.relay_visible_for.get();
        let live = if self.relay_stuck.get() || self.relay_listening.get() {
            true
        } else if visible > 0 {
            self.relay_visible_for.set(visible - 1);
            true
        } else {
            false
        };

        let mut table = String::from("    1 /sbin/init\n  812 /usr/sbin/sshd -D\n");
        if live {
            let relay_args = match self.side {
                Side::Remote => "-4 -I 31330".to_string(),
                Side::Local => "-O backup.example.org:31330".to_string(),
            };
            table.push_str(&format!(
                " {} /usr/bin/mbuffer -q -s 128k -W 600 -m 100M {}\n",
                RELAY_PID, relay_args
            ));
        }
        table
    }

    fn lookup_snapshot(&self, command: &CommandLine) -> Option<CommandOutput> {
        let args = command.arguments();
        let is_lookup = args.len() == 5 && args[0] == "list" && args[4].contains('@');
        if !is_lookup {
            return None;
        }
        let name = &args[4];
        Some(if self.snapshots.borrow().contains(name) {
            CommandOutput {
                stdout: format!("{}\n", name),
                ..Default::default()
            }
        } else {
            CommandOutput {
                stderr: format!("cannot open '{}': dataset does not exist\n", name),
                exit_status: 1,
                ..Default::default()
            }
        })
    }
}

impl Host for FakeHost {
    fn side(&self) -> Side {
        self.side
    }

    fn execute(&self, command: &CommandLine) -> Result<CommandOutput> {
        let line = command.to_shell();
        self.executed.borrow_mut().push(line.clone());

        if self.fail_execute.get() {
            return Err(ReplicationError::RemoteExec {
                command: line,
                reason: "channel closed".into(),
            });
        }

        if command.program() == "ps" {
            if let Some(stderr) = self.ps_error.borrow().clone() {
                self.ps_queries.set(self.ps_queries.get() + 1);
                return Ok(CommandOutput {
                    stderr,
                    exit_status: 1,
                    ..Default::default()
                });
            }
            return Ok(CommandOutput {
                stdout: self.process_table(),
                ..Default::default()
            });
        }

        if let Some(output) = self.lookup_snapshot(command) {
            return Ok(output);
        }

        Ok(self
            .responses
            .borrow()
            .get(&line)
            .cloned()
            .unwrap_or_default())
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        self.terminated.borrow_mut().push(pid);
        self.relay_visible_for.set(0);
        self.relay_listening.set(false);
        Ok(())
    }
}

impl LocalHost for FakeHost {
    fn run_pipeline(&self, stages: &[CommandLine]) -> Result<PipelineOutput> {
        self.pipelines
            .borrow_mut()
            .push(stages.iter().map(CommandLine::to_shell).collect());

        if self.pipeline_leaves_relay.get() {
            self.relay_visible_for.set(1);
        }

        let scripted = self.pipeline_output.borrow().clone();
        Ok(scripted.unwrap_or_else(|| PipelineOutput {
            stages: stages
                .iter()
                .map(|stage| StageStatus {
                    program: stage.program().to_string(),
                    exit_code: Some(0),
                    output: String::new(),
                })
                .collect(),
        }))
    }
}

impl RemoteHost for FakeHost {
    fn launch_background(&mut self, command: &str) -> Result<()> {
        self.launched.borrow_mut().push(command.to_string());
        if self.launch_starts_relay.get() {
            self.relay_visible_for.set(1);
        }
        Ok(())
    }
}
