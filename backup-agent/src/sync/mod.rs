//! Remote directory synchronization with retry and exponential backoff.
//!
//! The engine wraps a single-attempt [`SyncOperation`] (rsync in production)
//! and decides after every failed attempt whether to back off and try again.

pub mod rsync;

use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use rsync::RsyncCommand;

/// Destination used when the request leaves it unset.
pub const DEFAULT_DESTINATION_DIR: &str = "temp_files";

/// rsync exit codes that indicate the transport broke rather than the request being wrong:
/// 10 socket I/O, 12 protocol data stream, 30 data timeout, 35 daemon connect timeout.
/// 255 is left out: ssh exits with it for authentication failures too.
const TRANSIENT_EXIT_CODES: &[i32] = &[10, 12, 30, 35];

/// Upper bound for a single backoff sleep.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60 * 60);

/// Largest accepted backoff multiplier.
pub const MAX_BACKOFF_MULTIPLIER: f64 = 10.0;

/// Lower-cased stderr fragments that mark a dropped connection.
const DROPPED_CONNECTION_SIGNATURES: &[&str] = &[
    "connection closed by remote server",
    "connection closed by",
    "connection reset by peer",
    "connection unexpectedly closed",
    "connection timed out",
    "broken pipe",
    "timeout in data send/receive",
];

/// How a failed attempt is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientClassifier {
    /// Only dropped-connection failures (stderr signature or transport exit code) are retried.
    ConnectionDropped,
    /// Every non-zero exit is retried. A tool that cannot be started never is.
    AnyFailure,
}

impl TransientClassifier {
    pub fn is_transient(&self, failure: &AttemptFailure) -> bool {
        match failure {
            AttemptFailure::Spawn(_) => false,
            AttemptFailure::Exited { code, stderr } => match self {
                TransientClassifier::AnyFailure => true,
                TransientClassifier::ConnectionDropped => {
                    let stderr = stderr.to_ascii_lowercase();
                    DROPPED_CONNECTION_SIGNATURES
                        .iter()
                        .any(|sig| stderr.contains(sig))
                        || code.is_some_and(|c| TRANSIENT_EXIT_CODES.contains(&c))
                }
            },
        }
    }
}

/// Retry tuning, fixed for the life of the process.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    pub classifier: TransientClassifier,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        backoff_multiplier: f64,
        classifier: TransientClassifier,
    ) -> Result<Self> {
        if max_attempts == 0 {
            return Err(BackupError::Configuration(
                "sync max attempts must be at least 1".into(),
            ));
        }
        if !backoff_multiplier.is_finite()
            || !(1.0..=MAX_BACKOFF_MULTIPLIER).contains(&backoff_multiplier)
        {
            return Err(BackupError::Configuration(format!(
                "sync backoff multiplier must be between 1.0 and {}, got {}",
                MAX_BACKOFF_MULTIPLIER, backoff_multiplier
            )));
        }
        Ok(Self {
            max_attempts,
            initial_delay,
            backoff_multiplier,
            classifier,
        })
    }

    /// Delay slept after the given failed attempt (1-based), capped at [`MAX_RETRY_DELAY`].
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        scale_delay(self.initial_delay, self.backoff_multiplier.powi(exponent))
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        scale_delay(delay, self.backoff_multiplier)
    }
}

/// `delay * factor`, saturating at [`MAX_RETRY_DELAY`].
fn scale_delay(delay: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor)
        .unwrap_or(MAX_RETRY_DELAY)
        .min(MAX_RETRY_DELAY)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            classifier: TransientClassifier::ConnectionDropped,
        }
    }
}

/// What to mirror and where.
#[derive(Debug, Clone, Default)]
pub struct SyncRequest {
    pub user: Option<String>,
    pub host: Option<String>,
    pub port: u16,
    pub remote_dir: String,
    pub destination: Option<PathBuf>,
    /// Surface the tool's stdout (progress lines) as well as stderr
    pub verbose: bool,
}

/// Validated form of [`SyncRequest`] handed to each attempt.
#[derive(Debug, Clone)]
pub struct SyncTarget {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub remote_dir: String,
    pub destination: PathBuf,
    pub verbose: bool,
}

impl SyncTarget {
    /// `user@host:dir` as understood by rsync.
    pub fn remote_spec(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.remote_dir)
    }
}

/// Why a single attempt failed.
#[derive(Debug, Clone)]
pub enum AttemptFailure {
    /// The tool could not be started or waited on
    Spawn(String),
    /// The tool ran and exited unsuccessfully; `stderr` holds its last lines
    Exited { code: Option<i32>, stderr: String },
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptFailure::Spawn(msg) => write!(f, "failed to run sync command: {}", msg),
            AttemptFailure::Exited { code, stderr } => {
                match code {
                    Some(code) => write!(f, "sync command exited with status {}", code)?,
                    None => write!(f, "sync command terminated by signal")?,
                }
                if !stderr.is_empty() {
                    write!(f, ": {}", stderr)?;
                }
                Ok(())
            }
        }
    }
}

/// One attempt at mirroring the remote directory.
#[async_trait]
pub trait SyncOperation: Send + Sync {
    async fn run_once(&self, target: &SyncTarget) -> std::result::Result<(), AttemptFailure>;
}

/// Successful sync summary.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub destination: PathBuf,
    pub attempts: u32,
}

pub type SyncResult = Result<SyncReport>;

/// Retrying driver around a [`SyncOperation`].
#[derive(Clone)]
pub struct SyncEngine {
    operation: Arc<dyn SyncOperation>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl SyncEngine {
    pub fn new(operation: Arc<dyn SyncOperation>, policy: RetryPolicy) -> Self {
        Self::with_cancel(operation, policy, CancellationToken::new())
    }

    /// Create an engine that stops retrying once `cancel` fires.
    pub fn with_cancel(
        operation: Arc<dyn SyncOperation>,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        info!(
            max_attempts = policy.max_attempts,
            initial_delay = ?policy.initial_delay,
            multiplier = policy.backoff_multiplier,
            classifier = ?policy.classifier,
            "Sync retry policy configured"
        );
        Self {
            operation,
            policy,
            cancel,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Mirror the remote directory, retrying transient failures.
    pub async fn sync(&self, request: &SyncRequest) -> SyncResult {
        let target = prepare_target(request).await?;
        let max_attempts = self.policy.max_attempts;
        let mut delay = self.policy.initial_delay;
        let mut attempt = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(BackupError::Cancelled(format!(
                    "sync of {} cancelled before attempt {}",
                    target.remote_spec(),
                    attempt + 1
                )));
            }
            attempt += 1;

            info!(
                remote = %target.remote_spec(),
                destination = %target.destination.display(),
                attempt,
                max_attempts,
                "Starting sync attempt"
            );

            let failure = match self.operation.run_once(&target).await {
                Ok(()) => {
                    info!(
                        destination = %target.destination.display(),
                        attempts = attempt,
                        "Sync finished"
                    );
                    return Ok(SyncReport {
                        destination: target.destination,
                        attempts: attempt,
                    });
                }
                Err(failure) => failure,
            };

            if !self.policy.classifier.is_transient(&failure) {
                warn!(attempt, error = %failure, "Sync attempt failed with a non-retryable error");
                return Err(BackupError::SyncRejected {
                    attempt,
                    last: Box::new(BackupError::TerminalIo(failure.to_string())),
                });
            }

            if attempt >= max_attempts {
                warn!(attempt, error = %failure, "Sync attempt failed, no attempts left");
                return Err(BackupError::SyncExhausted {
                    attempts: attempt,
                    last: Box::new(BackupError::TransientIo(failure.to_string())),
                });
            }

            warn!(
                attempt,
                max_attempts,
                retry_in = ?delay,
                error = %failure,
                "Sync attempt failed transiently, retrying"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => {
                    return Err(BackupError::Cancelled(format!(
                        "sync of {} cancelled while waiting to retry",
                        target.remote_spec()
                    )));
                }
            }

            delay = self.policy.next_delay(delay);
        }
    }
}

/// Validate the request and make sure the destination exists.
async fn prepare_target(request: &SyncRequest) -> Result<SyncTarget> {
    let user = request
        .user
        .clone()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| BackupError::Configuration("remote user is required for sync".into()))?;
    let host = request
        .host
        .clone()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| BackupError::Configuration("remote host is required for sync".into()))?;
    if request.remote_dir.is_empty() {
        return Err(BackupError::Configuration(
            "remote source directory is required for sync".into(),
        ));
    }

    let destination = request
        .destination
        .clone()
        .filter(|d| !d.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DESTINATION_DIR));

    if !destination.exists() {
        info!(destination = %destination.display(), "Creating sync destination directory");
    }
    tokio::fs::create_dir_all(&destination).await.map_err(|e| {
        BackupError::resource(
            format!("failed to create destination directory {}", destination.display()),
            e,
        )
    })?;

    Ok(SyncTarget {
        user,
        host,
        port: request.port,
        remote_dir: request.remote_dir.clone(),
        destination,
        verbose: request.verbose,
    })
}
