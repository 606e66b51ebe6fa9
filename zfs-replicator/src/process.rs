//! Relay process tracking on both sides.
//!
//! The relay bound to the fixed port is the only shared resource between
//! transfers, so every transfer ends by waiting until no relay for that port
//! is left in either process table.

use std::thread;

use crate::command::Toolbox;
use crate::config::PollBudget;
use crate::host::Host;
use crate::utils::errors::{ReplicationError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStatus {
    Drained,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyStatus {
    Ready,
    TimedOut,
}

/// Finds the relay process for the fixed port in `ps -eo pid=,args=` output.
pub fn find_relay_pid(process_table: &str, relay_name: &str, port: u16) -> Option<u32> {
    let port = port.to_string();
    let port_suffix = format!(":{}", port);

    process_table.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let pid = fields.next()?.parse::<u32>().ok()?;
        let program = fields.next()?;
        let program_name = program.rsplit('/').next().unwrap_or(program);
        if program_name != relay_name {
            return None;
        }
        fields
            .any(|arg| arg == port || arg.ends_with(&port_suffix))
            .then_some(pid)
    })
}

pub struct ProcessSynchronizer<'a> {
    tools: &'a Toolbox,
    drain: PollBudget,
    ready: PollBudget,
}

impl<'a> ProcessSynchronizer<'a> {
    pub fn new(tools: &'a Toolbox, drain: PollBudget, ready: PollBudget) -> Self {
        Self {
            tools,
            drain,
            ready,
        }
    }

    pub fn drain_budget(&self) -> PollBudget {
        self.drain
    }

    pub fn port(&self) -> u16 {
        self.tools.relay().port
    }

    /// Pid of the relay holding the port on `host`, if any.
    ///
    /// A failed `ps` has empty stdout, which must not read as "no relay".
    pub fn find_relay(&self, host: &dyn Host) -> Result<Option<u32>> {
        let output = host.execute(&self.tools.process_table())?;
        if !output.success() {
            return Err(ReplicationError::ProcessQuery {
                side: host.side(),
                reason: format!(
                    "exit status {}: {}",
                    output.exit_status,
                    output.stderr.trim()
                ),
            });
        }
        let relay = self.tools.relay();
        Ok(find_relay_pid(&output.stdout, relay.process_name(), relay.port))
    }

    /// Block until the relay is gone from `host`, at most `max_polls` probes.
    pub fn wait_for_drain(&self, host: &dyn Host) -> Result<DrainStatus> {
        for poll in 0..self.drain.max_polls {
            match self.find_relay(host)? {
                None => {
                    tracing::debug!(side = %host.side(), polls = poll + 1, "Relay drained");
                    return Ok(DrainStatus::Drained);
                }
                Some(pid) => {
                    tracing::trace!(side = %host.side(), pid, poll, "Relay still running");
                    if poll + 1 < self.drain.max_polls {
                        thread::sleep(self.drain.interval);
                    }
                }
            }
        }

        tracing::error!(
            side = %host.side(),
            port = self.port(),
            polls = self.drain.max_polls,
            "Relay did not drain, giving up"
        );
        Ok(DrainStatus::TimedOut)
    }

    /// Block until a relay shows up on `host`, at most `max_polls` probes.
    pub fn wait_for_listener(&self, host: &dyn Host) -> Result<ReadyStatus> {
        for poll in 0..self.ready.max_polls {
            if let Some(pid) = self.find_relay(host)? {
                tracing::debug!(side = %host.side(), pid, polls = poll + 1, "Relay listening");
                return Ok(ReadyStatus::Ready);
            }
            if poll + 1 < self.ready.max_polls {
                thread::sleep(self.ready.interval);
            }
        }
        Ok(ReadyStatus::TimedOut)
    }

    /// Send SIGTERM to the relay on `host` if one is running. Does not wait.
    pub fn kill_drain(&self, host: &dyn Host) -> Result<Option<u32>> {
        let Some(pid) = self.find_relay(host)? else {
            return Ok(None);
        };
        tracing::warn!(side = %host.side(), pid, "Cleaning relay process");
        if let Err(e) = host.terminate(pid) {
            tracing::warn!(side = %host.side(), pid, error = %e, "Failed to terminate relay");
        }
        Ok(Some(pid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Side;
    use crate::testing::{toolbox, FakeHost};
    use std::time::Duration;

    const PS_OUTPUT: &str = "\
    1 /sbin/init
  812 /usr/sbin/sshd -D
 4242 /usr/bin/mbuffer -q -s 128k -W 600 -m 100M -4 -I 31330
 4243 /sbin/zfs recv -F backup/tank/a
";

    fn budget(max_polls: u32) -> PollBudget {
        PollBudget {
            interval: Duration::from_millis(0),
            max_polls,
        }
    }

    #[test]
    fn test_find_listening_relay() {
        assert_eq!(find_relay_pid(PS_OUTPUT, "mbuffer", 31330), Some(4242));
        assert_eq!(find_relay_pid(PS_OUTPUT, "mbuffer", 31331), None);
    }

    #[test]
    fn test_find_forwarding_relay() {
        let table = " 900 mbuffer -q -s 128k -W 600 -m 100M -O backup.example.org:31330\n";
        assert_eq!(find_relay_pid(table, "mbuffer", 31330), Some(900));
    }

    #[test]
    fn test_ignores_other_programs_mentioning_port() {
        let table = " 77 sh -c mbuffer -I 31330\n 78 grep 31330\n 79 mbuffer -I 313301\n";
        assert_eq!(find_relay_pid(table, "mbuffer", 31330), None);
    }

    #[test]
    fn test_wait_for_drain_times_out_after_exact_budget() {
        let tools = toolbox();
        let host = FakeHost::new(Side::Local);
        host.set_relay_stuck(true);

        let sync = ProcessSynchronizer::new(&tools, budget(25), budget(1));
        assert_eq!(sync.wait_for_drain(&host).unwrap(), DrainStatus::TimedOut);
        assert_eq!(host.process_table_queries(), 25);
    }

    #[test]
    fn test_wait_for_drain_returns_once_relay_exits() {
        let tools = toolbox();
        let host = FakeHost::new(Side::Remote);
        host.show_relay_for(3);

        let sync = ProcessSynchronizer::new(&tools, budget(100), budget(1));
        assert_eq!(sync.wait_for_drain(&host).unwrap(), DrainStatus::Drained);
        assert_eq!(host.process_table_queries(), 4);
    }

    #[test]
    fn test_wait_for_listener() {
        let tools = toolbox();
        let host = FakeHost::new(Side::Remote);
        let sync = ProcessSynchronizer::new(&tools, budget(1), budget(5));
        assert_eq!(sync.wait_for_listener(&host).unwrap(), ReadyStatus::TimedOut);
        assert_eq!(host.process_table_queries(), 5);

        host.show_relay_for(1);
        assert_eq!(sync.wait_for_listener(&host).unwrap(), ReadyStatus::Ready);
    }

    #[test]
    fn test_failed_process_table_is_an_error() {
        let tools = toolbox();
        let host = FakeHost::new(Side::Remote);
        host.break_process_table("ps: unrecognized option: o");
        let sync = ProcessSynchronizer::new(&tools, budget(10), budget(10));

        let err = sync.wait_for_drain(&host).unwrap_err();
        assert!(matches!(
            err,
            ReplicationError::ProcessQuery { side: Side::Remote, .. }
        ));
        assert!(err.to_string().contains("unrecognized option"));
        assert!(sync.wait_for_listener(&host).is_err());
        assert!(sync.kill_drain(&host).is_err());
        assert_eq!(host.process_table_queries(), 3);
    }

    #[test]
    fn test_kill_drain_terminates_found_relay() {
        let tools = toolbox();
        let host = FakeHost::new(Side::Local);
        let sync = ProcessSynchronizer::new(&tools, budget(1), budget(1));

        assert_eq!(sync.kill_drain(&host).unwrap(), None);
        assert!(host.terminated().is_empty());

        host.show_relay_for(1);
        let pid = sync.kill_drain(&host).unwrap();
        assert_eq!(pid, Some(crate::testing::RELAY_PID));
        assert_eq!(host.terminated(), vec![crate::testing::RELAY_PID]);
    }
}
