//! Configuration management for the replicator.
//!
//! Parameters are read from an INI (or TOML) file and can be overridden with
//! `ZFS_REPLICATE_*` environment variables.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::errors::{ReplicationError, Result};

/// Prefix for environment variable overrides
pub const ENV_PREFIX: &str = "ZFS_REPLICATE";

#[derive(Debug, Clone, Deserialize)]
pub struct Parameters {
    /// Remote host running the receiving side
    pub ssh_host: String,

    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    /// Expected host key fingerprint (hex, separators ignored)
    pub ssh_fingerprint: String,

    pub ssh_auth_user: String,
    pub ssh_auth_pub: PathBuf,
    pub ssh_auth_priv: PathBuf,

    /// Private key passphrase, empty for none
    #[serde(default)]
    pub ssh_auth_pass: String,

    /// Cipher preference passed to libssh2 (e.g. `aes128-ctr`)
    #[serde(default)]
    pub ssh_cipher: Option<String>,

    /// Local root of the replicated tree
    pub zfs_local_path: String,

    /// Remote root the local tree is mapped onto
    pub zfs_distant_path: String,

    /// Comma-separated local prefixes never bootstrapped remotely
    #[serde(default)]
    pub zfs_ignore_paths: String,

    #[serde(default = "default_zfs_bin")]
    pub zfs_bin: String,

    #[serde(default = "default_mbuffer_bin")]
    pub mbuffer_bin: String,

    #[serde(default = "default_relay_port")]
    pub relay_port: u16,

    #[serde(default = "default_relay_block_size")]
    pub relay_block_size: String,

    /// Relay network timeout in seconds
    #[serde(default = "default_relay_timeout")]
    pub relay_timeout: u32,

    #[serde(default = "default_relay_memory")]
    pub relay_memory: String,

    #[serde(default = "default_poll_interval_ms")]
    pub drain_poll_interval_ms: u64,

    #[serde(default = "default_drain_max_polls")]
    pub drain_max_polls: u32,

    #[serde(default = "default_poll_interval_ms")]
    pub ready_poll_interval_ms: u64,

    #[serde(default = "default_ready_max_polls")]
    pub ready_max_polls: u32,

    #[serde(default = "default_ready_settle_ms")]
    pub ready_settle_ms: u64,

    /// Days scanned backwards for a common snapshot
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,

    /// Check every pipeline stage instead of only the captured output
    #[serde(default)]
    pub strict_exit_status: bool,

    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Relay tool invocation settings shared by both sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub program: String,
    pub port: u16,
    pub block_size: String,
    pub timeout_secs: u32,
    pub memory: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            program: default_mbuffer_bin(),
            port: default_relay_port(),
            block_size: default_relay_block_size(),
            timeout_secs: default_relay_timeout(),
            memory: default_relay_memory(),
        }
    }
}

impl RelayConfig {
    /// Program name as it shows up in the process table.
    pub fn process_name(&self) -> &str {
        Path::new(&self.program)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(&self.program)
    }
}

/// Bounded polling settings for one kind of wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBudget {
    pub interval: Duration,
    pub max_polls: u32,
}

// Default values
fn default_ssh_port() -> u16 {
    22
}

fn default_zfs_bin() -> String {
    "/sbin/zfs".to_string()
}

fn default_mbuffer_bin() -> String {
    "/usr/bin/mbuffer".to_string()
}

fn default_relay_port() -> u16 {
    31330
}

fn default_relay_block_size() -> String {
    "128k".to_string()
}

fn default_relay_timeout() -> u32 {
    600
}

fn default_relay_memory() -> String {
    "100M".to_string()
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_drain_max_polls() -> u32 {
    6000 // 5 minutes at 50ms
}

fn default_ready_max_polls() -> u32 {
    200
}

fn default_ready_settle_ms() -> u64 {
    100
}

fn default_lookback_days() -> u32 {
    9
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("/var/lock/zfs-replicate.lock")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Parameters {
    /// Load parameters from a file (format picked from its extension) with
    /// environment overrides applied on top.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ReplicationError::Config(format!(
                "Cannot read {}",
                path.display()
            )));
        }

        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .build()?;

        let params: Parameters = settings.try_deserialize()?;
        params.validate()?;
        Ok(params)
    }

    /// Reject parameter sets the run cannot work with.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("ssh_host", self.ssh_host.as_str()),
            ("ssh_auth_user", self.ssh_auth_user.as_str()),
            ("zfs_local_path", self.zfs_local_path.as_str()),
            ("zfs_distant_path", self.zfs_distant_path.as_str()),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(ReplicationError::Config(format!("`{}` must not be empty", key)));
            }
        }

        let fingerprint = self.fingerprint();
        if !matches!(fingerprint.len(), 32 | 40 | 64) {
            return Err(ReplicationError::Config(format!(
                "`ssh_fingerprint` must be an MD5, SHA-1 or SHA-256 hex digest, got {} hex digits",
                fingerprint.len()
            )));
        }

        if self.drain_max_polls == 0 || self.ready_max_polls == 0 {
            return Err(ReplicationError::Config("poll budgets must be at least 1".into()));
        }
        if self.lookback_days == 0 {
            return Err(ReplicationError::Config("`lookback_days` must be at least 1".into()));
        }
        Ok(())
    }

    /// Configured fingerprint reduced to lowercase hex digits.
    pub fn fingerprint(&self) -> String {
        normalize_fingerprint(&self.ssh_fingerprint)
    }

    /// Ignore prefixes, empty entries dropped.
    pub fn ignore_prefixes(&self) -> Vec<String> {
        self.zfs_ignore_paths
            .split(',')
            .map(str::trim)
            .filter(|prefix| !prefix.is_empty())
            .map(String::from)
            .collect()
    }

    pub fn relay(&self) -> RelayConfig {
        RelayConfig {
            program: self.mbuffer_bin.clone(),
            port: self.relay_port,
            block_size: self.relay_block_size.clone(),
            timeout_secs: self.relay_timeout,
            memory: self.relay_memory.clone(),
        }
    }

    pub fn drain_budget(&self) -> PollBudget {
        PollBudget {
            interval: Duration::from_millis(self.drain_poll_interval_ms),
            max_polls: self.drain_max_polls,
        }
    }

    pub fn ready_budget(&self) -> PollBudget {
        PollBudget {
            interval: Duration::from_millis(self.ready_poll_interval_ms),
            max_polls: self.ready_max_polls,
        }
    }

    pub fn ready_settle(&self) -> Duration {
        Duration::from_millis(self.ready_settle_ms)
    }
}

/// Lowercase hex digits only, so `AB:CD:..` and `abcd..` compare equal.
pub fn normalize_fingerprint(raw: &str) -> String {
    raw.chars()
        .filter(char::is_ascii_hexdigit)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}
