//! Error taxonomy for the backup pipeline.

use std::fmt;
use thiserror::Error;

/// Which step of an SSH command execution failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshErrorKind {
    KeyUnreadable,
    KeyUnparsable,
    Connect,
    Handshake,
    HostKey,
    Authentication,
    Session,
    NonZeroExit,
    Output,
}

impl fmt::Display for SshErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SshErrorKind::KeyUnreadable => "key unreadable",
            SshErrorKind::KeyUnparsable => "key unparsable",
            SshErrorKind::Connect => "connect",
            SshErrorKind::Handshake => "handshake",
            SshErrorKind::HostKey => "host key",
            SshErrorKind::Authentication => "authentication",
            SshErrorKind::Session => "session",
            SshErrorKind::NonZeroExit => "non-zero exit",
            SshErrorKind::Output => "output",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    #[error("I/O error: {0}")]
    TerminalIo(String),

    #[error("{context}: {source}")]
    Resource {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Remote API error during {operation}: {message}")]
    RemoteApi {
        operation: &'static str,
        message: String,
    },

    #[error("SSH error ({kind}): {message}")]
    Ssh { kind: SshErrorKind, message: String },

    #[error("Sync failed after exhausting {attempts} attempts: {last}")]
    SyncExhausted {
        attempts: u32,
        #[source]
        last: Box<BackupError>,
    },

    #[error("Sync failed with a non-retryable error on attempt {attempt}: {last}")]
    SyncRejected {
        attempt: u32,
        #[source]
        last: Box<BackupError>,
    },

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl BackupError {
    pub fn resource(context: impl Into<String>, source: std::io::Error) -> Self {
        BackupError::Resource {
            context: context.into(),
            source,
        }
    }

    pub fn remote_api(operation: &'static str, message: impl fmt::Display) -> Self {
        BackupError::RemoteApi {
            operation,
            message: message.to_string(),
        }
    }

    pub fn ssh(kind: SshErrorKind, message: impl fmt::Display) -> Self {
        BackupError::Ssh {
            kind,
            message: message.to_string(),
        }
    }

    /// True when a sync gave up because every attempt failed transiently.
    pub fn is_exhausted_retries(&self) -> bool {
        matches!(self, BackupError::SyncExhausted { .. })
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_and_rejected_are_distinct() {
        let exhausted = BackupError::SyncExhausted {
            attempts: 5,
            last: Box::new(BackupError::TransientIo("connection closed".into())),
        };
        let rejected = BackupError::SyncRejected {
            attempt: 1,
            last: Box::new(BackupError::TerminalIo("permission denied".into())),
        };

        assert!(exhausted.is_exhausted_retries());
        assert!(!rejected.is_exhausted_retries());
        assert!(exhausted.to_string().contains("exhausting 5 attempts"));
        assert!(rejected.to_string().contains("non-retryable"));
    }

    #[test]
    fn test_ssh_error_display_names_kind() {
        let err = BackupError::ssh(SshErrorKind::NonZeroExit, "exit status 1");
        assert_eq!(err.to_string(), "SSH error (non-zero exit): exit status 1");
    }
}
