//! Byte-level progress for artifact uploads.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Minimum spacing between two progress log lines.
const REPORT_INTERVAL: Duration = Duration::from_millis(250);

/// Snapshot handed to a [`ProgressCallback`] after every chunk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UploadProgress {
    /// Bytes read from the source so far
    pub bytes_read: u64,

    /// Size of the source
    pub total_bytes: u64,

    /// Average rate since the upload started, in MB/s
    pub rate_mb_per_s: f64,
}

impl UploadProgress {
    pub fn new(bytes_read: u64, total_bytes: u64, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        let rate_mb_per_s = if secs > 0.0 {
            bytes_read as f64 / secs / BYTES_PER_MB
        } else {
            0.0
        };
        Self {
            bytes_read,
            total_bytes,
            rate_mb_per_s,
        }
    }

    /// Percentage complete (0-100)
    pub fn percent(&self) -> f64 {
        if self.total_bytes > 0 {
            (self.bytes_read as f64 / self.total_bytes as f64) * 100.0
        } else {
            100.0
        }
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_read >= self.total_bytes
    }
}

/// Observer for upload progress. Must not affect the upload itself.
pub type ProgressCallback = Arc<dyn Fn(UploadProgress) + Send + Sync>;

/// Callback that logs progress at debug level, at most four times a second
/// plus once on completion.
pub fn log_reporter(name: impl Into<String>) -> ProgressCallback {
    let name = name.into();
    let last_report: Mutex<Option<Instant>> = Mutex::new(None);

    Arc::new(move |progress: UploadProgress| {
        let now = Instant::now();
        let Ok(mut last) = last_report.lock() else {
            return;
        };
        let due = last.map_or(true, |t| now.duration_since(t) >= REPORT_INTERVAL);
        if !due && !progress.is_complete() {
            return;
        }
        *last = Some(now);

        debug!(
            file = %name,
            "Uploading: {}/{} ({:.2}%) at {:.2}MB/s",
            format_bytes(progress.bytes_read),
            format_bytes(progress.total_bytes),
            progress.percent(),
            progress.rate_mb_per_s
        );
    })
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}
