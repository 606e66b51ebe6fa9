//! Remote channel manager.
//!
//! Two SSH sessions to the receiving host: one answers synchronous
//! request/response commands (process table, snapshot lookups), the other
//! carries a persistent interactive shell where the receiving pipeline is
//! started in the background so it outlives the call that launched it.

use std::io::{Read, Write};
use std::net::TcpStream;

use ssh2::{Channel, HashType, MethodType, Session};

use crate::command::{CommandLine, Toolbox};
use crate::config::{normalize_fingerprint, Parameters};
use crate::host::{CommandOutput, Host, RemoteHost, Side};
use crate::utils::errors::{ReplicationError, Result};

/// Everything needed to open an authenticated session.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub fingerprint: String,
    pub user: String,
    pub public_key: std::path::PathBuf,
    pub private_key: std::path::PathBuf,
    pub passphrase: Option<String>,
    pub cipher: Option<String>,
}

impl ConnectOptions {
    pub fn from_parameters(params: &Parameters) -> Self {
        Self {
            host: params.ssh_host.clone(),
            port: params.ssh_port,
            fingerprint: params.fingerprint(),
            user: params.ssh_auth_user.clone(),
            public_key: params.ssh_auth_pub.clone(),
            private_key: params.ssh_auth_priv.clone(),
            passphrase: Some(params.ssh_auth_pass.clone()).filter(|pass| !pass.is_empty()),
            cipher: params.ssh_cipher.clone().filter(|cipher| !cipher.is_empty()),
        }
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Both channels to the remote host. Owned by the run; nothing else opens
/// sessions.
pub struct RemoteSession {
    exec: Option<Session>,
    interactive: Option<Session>,
    shell: Option<Channel>,
    addr: String,
}

impl RemoteSession {
    /// Open and authenticate both sessions.
    pub fn connect(opts: &ConnectOptions) -> Result<Self> {
        tracing::info!(host = %opts.host, port = opts.port, "Connecting to remote host");
        let (exec, interactive) = open_pair(|| open_session(opts), release_session)?;
        tracing::info!(host = %opts.host, user = %opts.user, "Remote sessions authenticated");

        Ok(Self {
            exec: Some(exec),
            interactive: Some(interactive),
            shell: None,
            addr: opts.addr(),
        })
    }

    /// A session that holds no handles; `disconnect` on it is a no-op.
    pub fn disconnected() -> Self {
        Self {
            exec: None,
            interactive: None,
            shell: None,
            addr: String::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.exec.is_some() || self.interactive.is_some()
    }

    /// Run a command on the exec channel and wait for it to close.
    pub fn exec(&self, command: &str) -> Result<CommandOutput> {
        let remote_exec_error = |reason: String| ReplicationError::RemoteExec {
            command: command.to_string(),
            reason,
        };

        let sess = self
            .exec
            .as_ref()
            .ok_or_else(|| remote_exec_error("not connected".into()))?;
        let mut channel = sess
            .channel_session()
            .map_err(|e| remote_exec_error(e.to_string()))?;
        channel
            .exec(command)
            .map_err(|e| remote_exec_error(e.to_string()))?;

        let mut stdout = Vec::new();
        channel
            .read_to_end(&mut stdout)
            .map_err(|e| remote_exec_error(e.to_string()))?;
        let mut stderr = Vec::new();
        channel
            .stderr()
            .read_to_end(&mut stderr)
            .map_err(|e| remote_exec_error(e.to_string()))?;
        channel
            .wait_close()
            .map_err(|e| remote_exec_error(e.to_string()))?;
        let exit_status = channel.exit_status().unwrap_or(-1);

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_status,
        })
    }

    fn shell(&mut self) -> Result<&mut Channel> {
        if self.shell.is_none() {
            let sess = self
                .interactive
                .as_ref()
                .ok_or_else(|| ReplicationError::RemoteShell("not connected".into()))?;
            let mut channel = sess
                .channel_session()
                .map_err(|e| ReplicationError::RemoteShell(e.to_string()))?;
            channel
                .request_pty("xterm", None, None)
                .map_err(|e| ReplicationError::RemoteShell(e.to_string()))?;
            channel
                .shell()
                .map_err(|e| ReplicationError::RemoteShell(e.to_string()))?;
            self.shell = Some(channel);
        }
        self.shell
            .as_mut()
            .ok_or_else(|| ReplicationError::RemoteShell("shell unavailable".into()))
    }

    /// Write a command line into the interactive shell, backgrounded.
    pub fn launch(&mut self, command: &str) -> Result<()> {
        let line = format!("{} &\n", command);
        let shell = self.shell()?;
        shell
            .write_all(line.as_bytes())
            .and_then(|_| shell.flush())
            .map_err(|e| ReplicationError::RemoteShell(e.to_string()))?;
        tracing::debug!(command, "Launched remote background command");
        Ok(())
    }

    /// Log out and release both sessions. Safe to call repeatedly.
    pub fn disconnect(&mut self) {
        if !self.is_connected() {
            return;
        }
        if let Some(mut shell) = self.shell.take() {
            let _ = shell.write_all(b"logout\n");
            let _ = shell.flush();
            let _ = shell.send_eof();
        } else if let Some(sess) = self.interactive.as_ref() {
            logout_via_exec(sess);
        }
        if let Some(sess) = self.interactive.take() {
            let _ = sess.disconnect(None, "replication finished", None);
        }

        if let Some(sess) = self.exec.take() {
            logout_via_exec(&sess);
            let _ = sess.disconnect(None, "replication finished", None);
            tracing::info!(addr = %self.addr, "Disconnected from remote host");
        }
    }
}

/// Open the exec session, then the interactive one. If the second fails the
/// first is released before the error is returned.
fn open_pair<S>(
    mut open: impl FnMut() -> Result<S>,
    release: impl FnOnce(S),
) -> Result<(S, S)> {
    let first = open()?;
    match open() {
        Ok(second) => Ok((first, second)),
        Err(e) => {
            release(first);
            Err(e)
        }
    }
}

fn release_session(sess: Session) {
    logout_via_exec(&sess);
    let _ = sess.disconnect(None, "replication aborted", None);
}

fn logout_via_exec(sess: &Session) {
    if let Ok(mut channel) = sess.channel_session() {
        let _ = channel.exec("logout");
        let _ = channel.close();
    }
}

fn open_session(opts: &ConnectOptions) -> Result<Session> {
    let connect_error = |reason: String| ReplicationError::Connect {
        addr: opts.addr(),
        reason,
    };

    let tcp = TcpStream::connect(opts.addr()).map_err(|e| connect_error(e.to_string()))?;
    let mut sess = Session::new().map_err(|e| connect_error(e.to_string()))?;
    sess.set_tcp_stream(tcp);

    if let Some(cipher) = &opts.cipher {
        sess.method_pref(MethodType::CryptCs, cipher)
            .and_then(|_| sess.method_pref(MethodType::CryptSc, cipher))
            .map_err(|e| connect_error(format!("cipher `{}` rejected: {}", cipher, e)))?;
    }

    sess.handshake().map_err(|e| connect_error(e.to_string()))?;

    verify_host_key(&sess, &opts.fingerprint)?;

    sess.userauth_pubkey_file(
        &opts.user,
        Some(opts.public_key.as_path()),
        opts.private_key.as_path(),
        opts.passphrase.as_deref(),
    )
    .map_err(|e| ReplicationError::Auth(e.to_string()))?;

    if !sess.authenticated() {
        return Err(ReplicationError::Auth(format!(
            "public key rejected for user {}",
            opts.user
        )));
    }

    Ok(sess)
}

/// Hash algorithm implied by the length of a hex fingerprint.
fn hash_type_for(expected: &str) -> Option<HashType> {
    match expected.len() {
        32 => Some(HashType::Md5),
        40 => Some(HashType::Sha1),
        64 => Some(HashType::Sha256),
        _ => None,
    }
}

fn verify_host_key(sess: &Session, expected: &str) -> Result<()> {
    let expected = normalize_fingerprint(expected);
    let hash_type = hash_type_for(&expected).ok_or_else(|| {
        ReplicationError::Config(format!("unsupported fingerprint length {}", expected.len()))
    })?;

    let actual = sess
        .host_key_hash(hash_type)
        .map(hex::encode)
        .unwrap_or_default();

    check_fingerprint(&expected, &actual)
}

fn check_fingerprint(expected: &str, actual: &str) -> Result<()> {
    if normalize_fingerprint(expected) != normalize_fingerprint(actual) || actual.is_empty() {
        return Err(ReplicationError::IdentityMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

impl Host for RemoteSession {
    fn side(&self) -> Side {
        Side::Remote
    }

    fn execute(&self, command: &CommandLine) -> Result<CommandOutput> {
        self.exec(&command.to_shell())
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        let command = Toolbox::terminate(pid);
        let output = self.execute(&command)?;
        if output.success() {
            return Ok(());
        }
        Err(ReplicationError::RemoteExec {
            command: command.to_shell(),
            reason: format!("exit status {}: {}", output.exit_status, output.stderr.trim()),
        })
    }
}

impl RemoteHost for RemoteSession {
    fn launch_background(&mut self, command: &str) -> Result<()> {
        self.launch(command)
    }
}
