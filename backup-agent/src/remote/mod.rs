//! Remote command execution over SSH.

pub mod ssh;

use crate::utils::Result;
use async_trait::async_trait;
use std::path::PathBuf;

pub use ssh::SshRunner;

/// How the remote host's identity is checked.
///
/// `AcceptAny` trusts whatever key the server presents. It has to be chosen
/// explicitly (`SSH_ACCEPT_ANY_HOST_KEY=true`) and is logged on every use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    Verify { known_hosts: PathBuf },
    AcceptAny,
}

/// Login coordinates for a remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl SshTarget {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Runs one command on a remote host and returns its stdout.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    async fn run(&self, target: &SshTarget, command: &str) -> Result<Vec<u8>>;
}
