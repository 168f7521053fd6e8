//! Single rsync attempt with live output streaming.

use super::{AttemptFailure, SyncOperation, SyncTarget};
use crate::remote::HostKeyPolicy;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

/// Number of trailing stderr lines kept for classification and error context.
const STDERR_TAIL_LINES: usize = 20;

/// Runs `rsync -azL --progress` over ssh.
#[derive(Debug, Clone)]
pub struct RsyncCommand {
    program: PathBuf,
    key_path: Option<PathBuf>,
    host_keys: HostKeyPolicy,
}

impl RsyncCommand {
    pub fn new(key_path: Option<PathBuf>, host_keys: HostKeyPolicy) -> Self {
        Self {
            program: PathBuf::from("rsync"),
            key_path,
            host_keys,
        }
    }

    /// Use a different rsync binary.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// The `-e` remote shell, carrying port, key and host key options.
    pub fn remote_shell(&self, port: u16) -> String {
        let mut shell = format!("ssh -p {} -o BatchMode=yes", port);
        if let Some(key) = &self.key_path {
            shell.push_str(&format!(" -i {}", shell_quote(&key.to_string_lossy())));
        }
        match &self.host_keys {
            HostKeyPolicy::AcceptAny => {
                shell.push_str(" -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null");
            }
            HostKeyPolicy::Verify { known_hosts } => {
                shell.push_str(&format!(
                    " -o StrictHostKeyChecking=yes -o UserKnownHostsFile={}",
                    shell_quote(&known_hosts.to_string_lossy())
                ));
            }
        }
        shell
    }

    pub fn args(&self, target: &SyncTarget) -> Vec<String> {
        vec![
            // archive, compress, dereference symlinks
            "-azL".to_string(),
            "--progress".to_string(),
            "-e".to_string(),
            self.remote_shell(target.port),
            target.remote_spec(),
            target.destination.to_string_lossy().into_owned(),
        ]
    }
}

#[async_trait]
impl SyncOperation for RsyncCommand {
    async fn run_once(&self, target: &SyncTarget) -> Result<(), AttemptFailure> {
        if let HostKeyPolicy::AcceptAny = self.host_keys {
            warn!(host = %target.host, "Host key verification disabled for rsync (SSH_ACCEPT_ANY_HOST_KEY)");
        }

        let mut child = Command::new(&self.program)
            .args(self.args(target))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                AttemptFailure::Spawn(format!("{}: {}", self.program.display(), e))
            })?;

        // Both pipes are drained while the child runs so neither can fill up and stall it.
        let stdout = child
            .stdout
            .take()
            .map(|pipe| tokio::spawn(drain_stdout(pipe, target.verbose)));
        let stderr = child.stderr.take().map(|pipe| tokio::spawn(drain_stderr(pipe)));

        let status = child
            .wait()
            .await
            .map_err(|e| AttemptFailure::Spawn(format!("failed to wait for rsync: {}", e)))?;

        if let Some(handle) = stdout {
            let _ = handle.await;
        }
        let stderr_tail = match stderr {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        if status.success() {
            Ok(())
        } else {
            Err(AttemptFailure::Exited {
                code: status.code(),
                stderr: stderr_tail,
            })
        }
    }
}

async fn drain_stdout<R>(pipe: R, verbose: bool)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    while let Some(line) = next_line(&mut reader).await {
        if verbose {
            info!("[rsync] {}", line);
        }
    }
}

/// Logs every stderr line and returns the last few joined by newlines.
async fn drain_stderr<R>(pipe: R) -> String
where
    R: AsyncRead + Unpin,
{
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut reader = BufReader::new(pipe);
    while let Some(line) = next_line(&mut reader).await {
        warn!("[rsync] {}", line);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail).join("\n")
}

/// Next newline-terminated line, decoded lossily. `None` at end of stream or
/// on a read error, which also ends the stream.
async fn next_line<R>(reader: &mut R) -> Option<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    match reader.read_until(b'\n', &mut buf).await {
        Ok(0) => None,
        Ok(_) => {
            while matches!(buf.last(), Some(b'\n' | b'\r')) {
                buf.pop();
            }
            Some(String::from_utf8_lossy(&buf).into_owned())
        }
        Err(e) => {
            warn!(error = %e, "Failed to read rsync output");
            None
        }
    }
}

fn shell_quote(value: &str) -> String {
    if value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "/._-~".contains(c))
    {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}
