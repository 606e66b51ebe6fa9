//! Command lines for the external tools the replicator drives.
//!
//! A [`CommandLine`] is kept as program + arguments so the local side can
//! spawn it directly, and rendered with POSIX shell quoting when it has to
//! travel over an SSH channel.

use std::fmt;

use crate::config::{Parameters, RelayConfig};

/// A single external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Render for a POSIX shell.
    pub fn to_shell(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|word| shell_quote(word))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_shell())
    }
}

/// Render a pipeline (`a | b | c`) for a POSIX shell.
pub fn pipeline_to_shell(stages: &[CommandLine]) -> String {
    stages
        .iter()
        .map(CommandLine::to_shell)
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Quote a word for a POSIX shell. Words made only of safe characters are
/// returned untouched so logged commands stay readable.
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:@,=+%".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Builders for the ZFS, relay and process-table commands.
#[derive(Debug, Clone)]
pub struct Toolbox {
    zfs: String,
    relay: RelayConfig,
}

impl Toolbox {
    pub fn new(zfs: impl Into<String>, relay: RelayConfig) -> Self {
        Self {
            zfs: zfs.into(),
            relay,
        }
    }

    pub fn from_parameters(params: &Parameters) -> Self {
        Self::new(params.zfs_bin.clone(), params.relay())
    }

    pub fn relay(&self) -> &RelayConfig {
        &self.relay
    }

    /// `zfs list -H -o name -r -t filesystem,volume <root>`
    pub fn list_volumes(&self, root: &str) -> CommandLine {
        CommandLine::new(&self.zfs)
            .args(["list", "-H", "-o", "name", "-r", "-t", "filesystem,volume"])
            .arg(root)
    }

    /// `zfs list -H -o name <volume@label>`
    pub fn list_snapshot(&self, snapshot: &str) -> CommandLine {
        CommandLine::new(&self.zfs)
            .args(["list", "-H", "-o", "name"])
            .arg(snapshot)
    }

    /// `zfs send [-I <base>] <target>`
    pub fn send(&self, base: Option<&str>, target: &str) -> CommandLine {
        let cmd = CommandLine::new(&self.zfs).arg("send");
        let cmd = match base {
            Some(base) => cmd.arg("-I").arg(base),
            None => cmd,
        };
        cmd.arg(target)
    }

    /// `zfs recv -F <volume>`
    pub fn receive(&self, volume: &str) -> CommandLine {
        CommandLine::new(&self.zfs).args(["recv", "-F"]).arg(volume)
    }

    fn relay_base(&self) -> CommandLine {
        CommandLine::new(&self.relay.program)
            .arg("-q")
            .arg("-s")
            .arg(&self.relay.block_size)
            .arg("-W")
            .arg(self.relay.timeout_secs.to_string())
            .arg("-m")
            .arg(&self.relay.memory)
    }

    /// Relay listening on the fixed port (receiving side).
    pub fn relay_listen(&self) -> CommandLine {
        self.relay_base()
            .arg("-4")
            .arg("-I")
            .arg(self.relay.port.to_string())
    }

    /// Relay forwarding to `host:port` (sending side).
    pub fn relay_forward(&self, host: &str) -> CommandLine {
        self.relay_base()
            .arg("-O")
            .arg(format!("{}:{}", host, self.relay.port))
    }

    /// Process table listing, one `pid args...` line per process.
    pub fn process_table(&self) -> CommandLine {
        CommandLine::new("ps").args(["-eo", "pid=,args="])
    }

    /// SIGTERM through the shell, for hosts only reachable by command.
    pub fn terminate(pid: u32) -> CommandLine {
        CommandLine::new("kill").arg(pid.to_string())
    }
}
