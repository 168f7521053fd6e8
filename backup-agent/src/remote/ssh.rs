//! ssh2-backed [`RemoteExec`] implementation.
//!
//! libssh2 is blocking, so every command runs on the blocking thread pool.

use super::{HostKeyPolicy, RemoteExec, SshTarget};
use crate::utils::{BackupError, Result, SshErrorKind};
use async_trait::async_trait;
use ssh2::{CheckResult, ErrorCode, KnownHostFileKind, Session};
use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// libssh2 `LIBSSH2_ERROR_FILE`: the private key could not be decoded.
const LIBSSH2_ERROR_FILE: i32 = -16;

/// Pause between polls when neither output stream has data.
const OUTPUT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Public-key SSH command runner.
#[derive(Debug, Clone)]
pub struct SshRunner {
    key_path: PathBuf,
    host_keys: HostKeyPolicy,
    connect_timeout: Duration,
}

impl SshRunner {
    pub fn new(key_path: PathBuf, host_keys: HostKeyPolicy, connect_timeout: Duration) -> Self {
        Self {
            key_path,
            host_keys,
            connect_timeout,
        }
    }

    fn run_blocking(&self, target: &SshTarget, command: &str) -> Result<Vec<u8>> {
        let private_key = std::fs::read_to_string(&self.key_path).map_err(|e| {
            BackupError::ssh(
                SshErrorKind::KeyUnreadable,
                format!("cannot read private key {}: {}", self.key_path.display(), e),
            )
        })?;
        if !private_key.contains("PRIVATE KEY") {
            return Err(BackupError::ssh(
                SshErrorKind::KeyUnparsable,
                format!("{} is not a PEM/OpenSSH private key", self.key_path.display()),
            ));
        }

        let tcp = connect(target, self.connect_timeout)?;
        let mut sess = Session::new()
            .map_err(|e| BackupError::ssh(SshErrorKind::Session, e))?;
        sess.set_tcp_stream(tcp);
        sess.handshake()
            .map_err(|e| BackupError::ssh(SshErrorKind::Handshake, e))?;

        self.check_host_key(&sess, target)?;

        sess.userauth_pubkey_memory(&target.user, None, &private_key, None)
            .map_err(|e| match e.code() {
                ErrorCode::Session(LIBSSH2_ERROR_FILE) => BackupError::ssh(
                    SshErrorKind::KeyUnparsable,
                    format!("cannot parse private key {}: {}", self.key_path.display(), e),
                ),
                _ => BackupError::ssh(
                    SshErrorKind::Authentication,
                    format!("public key rejected for {}: {}", target.user, e),
                ),
            })?;
        if !sess.authenticated() {
            return Err(BackupError::ssh(
                SshErrorKind::Authentication,
                format!("public key rejected for {}", target.user),
            ));
        }

        info!(host = %target.host, port = target.port, "Connected with SSH");

        let mut channel = sess
            .channel_session()
            .map_err(|e| BackupError::ssh(SshErrorKind::Session, e))?;
        channel
            .exec(command)
            .map_err(|e| BackupError::ssh(SshErrorKind::Session, e))?;

        sess.set_blocking(false);
        let drained = drain_interleaved(channel.stream(0), channel.stderr(), OUTPUT_POLL_INTERVAL);
        sess.set_blocking(true);
        let (stdout, stderr) = drained.map_err(|e| BackupError::ssh(SshErrorKind::Output, e))?;
        let stderr = String::from_utf8_lossy(&stderr);
        if !stderr.trim().is_empty() {
            debug!(stderr = %stderr.trim(), "Remote command wrote to stderr");
        }

        channel
            .wait_close()
            .map_err(|e| BackupError::ssh(SshErrorKind::Output, e))?;
        let status = channel
            .exit_status()
            .map_err(|e| BackupError::ssh(SshErrorKind::Output, e))?;

        if status != 0 {
            return Err(BackupError::ssh(
                SshErrorKind::NonZeroExit,
                format!("`{}` exited with status {}: {}", command, status, stderr.trim()),
            ));
        }

        debug!(bytes = stdout.len(), command, "Remote command finished");
        Ok(stdout)
    }

    fn check_host_key(&self, sess: &Session, target: &SshTarget) -> Result<()> {
        let known_hosts_path = match &self.host_keys {
            HostKeyPolicy::AcceptAny => {
                warn!(
                    host = %target.host,
                    "Host key verification disabled (SSH_ACCEPT_ANY_HOST_KEY); the server identity is not checked"
                );
                return Ok(());
            }
            HostKeyPolicy::Verify { known_hosts } => known_hosts,
        };

        let (key, _) = sess.host_key().ok_or_else(|| {
            BackupError::ssh(SshErrorKind::HostKey, "server presented no host key")
        })?;

        let mut known_hosts = sess
            .known_hosts()
            .map_err(|e| BackupError::ssh(SshErrorKind::HostKey, e))?;
        known_hosts
            .read_file(known_hosts_path, KnownHostFileKind::OpenSSH)
            .map_err(|e| {
                BackupError::ssh(
                    SshErrorKind::HostKey,
                    format!("cannot read {}: {}", known_hosts_path.display(), e),
                )
            })?;

        match known_hosts.check_port(&target.host, target.port, key) {
            CheckResult::Match => Ok(()),
            CheckResult::NotFound => Err(BackupError::ssh(
                SshErrorKind::HostKey,
                format!(
                    "{} is not listed in {}",
                    target.address(),
                    known_hosts_path.display()
                ),
            )),
            CheckResult::Mismatch => Err(BackupError::ssh(
                SshErrorKind::HostKey,
                format!("host key for {} does not match {}", target.address(), known_hosts_path.display()),
            )),
            CheckResult::Failure => Err(BackupError::ssh(
                SshErrorKind::HostKey,
                format!("failed to check host key for {}", target.address()),
            )),
        }
    }
}

fn connect(target: &SshTarget, timeout: Duration) -> Result<TcpStream> {
    let address = target.address();
    let addrs = (target.host.as_str(), target.port)
        .to_socket_addrs()
        .map_err(|e| BackupError::ssh(SshErrorKind::Connect, format!("cannot resolve {}: {}", address, e)))?;

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }

    Err(BackupError::ssh(
        SshErrorKind::Connect,
        match last_error {
            Some(e) => format!("unable to connect to {}: {}", address, e),
            None => format!("{} resolved to no addresses", address),
        },
    ))
}

#[async_trait]
impl RemoteExec for SshRunner {
    async fn run(&self, target: &SshTarget, command: &str) -> Result<Vec<u8>> {
        let runner = self.clone();
        let target = target.clone();
        let command = command.to_string();

        tokio::task::spawn_blocking(move || runner.run_blocking(&target, &command))
            .await
            .map_err(|e| BackupError::ssh(SshErrorKind::Session, format!("ssh task failed: {}", e)))?
    }
}

/// Reads both streams of a non-blocking channel until each reports EOF.
///
/// Alternating between them keeps a command that fills one stream from stalling
/// on a full channel window while the other is being read.
fn drain_interleaved<O, E>(mut stdout: O, mut stderr: E, idle: Duration) -> io::Result<(Vec<u8>, Vec<u8>)>
where
    O: Read,
    E: Read,
{
    let mut out = Vec::new();
    let mut err = Vec::new();
    let mut out_done = false;
    let mut err_done = false;
    let mut buf = [0u8; 32 * 1024];

    while !(out_done && err_done) {
        let mut progressed = false;
        if !out_done {
            match poll_read(&mut stdout, &mut buf)? {
                Some(0) => out_done = true,
                Some(n) => {
                    out.extend_from_slice(&buf[..n]);
                    progressed = true;
                }
                None => {}
            }
        }
        if !err_done {
            match poll_read(&mut stderr, &mut buf)? {
                Some(0) => err_done = true,
                Some(n) => {
                    err.extend_from_slice(&buf[..n]);
                    progressed = true;
                }
                None => {}
            }
        }
        if !progressed && !(out_done && err_done) {
            std::thread::sleep(idle);
        }
    }
    Ok((out, err))
}

/// `None` when the read would block.
fn poll_read<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<Option<usize>> {
    match reader.read(buf) {
        Ok(n) => Ok(Some(n)),
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => Ok(None),
        Err(e) => Err(e),
    }
}
