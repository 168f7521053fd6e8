//! Long-running mode: scheduled backups until a shutdown signal.

pub mod scheduler;
pub mod shutdown;

use crate::config::Config;
use crate::job::{BackupJob, BackupJobSpec, JobReport};
use async_trait::async_trait;
use chrono::Local;
use scheduler::ScheduledTask;
use std::sync::Arc;
use tracing::error;

pub use scheduler::{JobRunner, Schedule, Scheduler};
pub use shutdown::ShutdownCoordinator;

/// Scheduled unit of work: a fresh [`BackupJobSpec`] per trigger.
pub struct BackupTask {
    job: Arc<BackupJob>,
    config: Arc<Config>,
}

impl BackupTask {
    pub fn new(job: Arc<BackupJob>, config: Arc<Config>) -> Self {
        Self { job, config }
    }

    /// Build this run's [`BackupJobSpec`] and execute it. `None` when the configuration is incomplete.
    pub async fn run_once(&self) -> Option<JobReport> {
        match BackupJobSpec::from_config(&self.config, Local::now()) {
            Ok(spec) => Some(self.job.run(&spec).await),
            Err(e) => {
                error!(error = %e, "Cannot start backup job");
                None
            }
        }
    }
}

#[async_trait]
impl ScheduledTask for BackupTask {
    async fn run(&self) {
        self.run_once().await;
    }
}
