//! WordPress backup agent library.
//!
//! Pulls a site's database dump and files over SSH/rsync, packages the files
//! into a ZIP archive and uploads both to Google Drive on a schedule.

pub mod archive;
pub mod config;
pub mod daemon;
pub mod job;
pub mod remote;
pub mod storage;
pub mod sync;
pub mod transfer;
pub mod utils;
pub mod wpe;

// Re-export commonly used types
pub use config::Config;
pub use job::{BackupJob, BackupJobSpec, JobReport, PhaseOutcome};
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
