//! One backup run: database phase, then file phase.

use crate::archive::create_zip_archive;
use crate::config::{Config, PhaseConfig};
use crate::remote::{RemoteExec, SshTarget};
use crate::storage::{UploadedArtifact, Uploader};
use crate::sync::{SyncEngine, SyncRequest};
use crate::utils::{BackupError, Result};
use bytes::Bytes;
use chrono::{DateTime, TimeZone};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Shared by every artifact of one run.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H%M%S";

/// Immutable inputs of one job invocation.
#[derive(Debug, Clone)]
pub struct BackupJobSpec {
    pub user: Option<String>,
    pub host: Option<String>,
    pub port: u16,
    pub remote_dir: Option<String>,
    pub staging_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub site: String,
    pub timestamp: String,
}

impl BackupJobSpec {
    pub fn from_config<Tz>(config: &Config, now: DateTime<Tz>) -> Result<Self>
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        let site = config.site_name.clone().ok_or_else(|| {
            BackupError::Configuration("SITE_NAME is required".into())
        })?;
        Ok(Self {
            user: config.remote.user.clone(),
            host: config.remote.host.clone(),
            port: config.remote.port,
            remote_dir: config.remote.source_dir.clone(),
            staging_dir: config.paths.staging_dir.clone(),
            archive_dir: config.paths.archive_dir.clone(),
            site,
            timestamp: now.format(TIMESTAMP_FORMAT).to_string(),
        })
    }

    fn user(&self) -> Result<&str> {
        self.user
            .as_deref()
            .ok_or_else(|| BackupError::Configuration("SSH_USER is required".into()))
    }

    fn ssh_target(&self) -> Result<SshTarget> {
        let host = self
            .host
            .clone()
            .ok_or_else(|| BackupError::Configuration("SSH_HOST is required".into()))?;
        Ok(SshTarget {
            user: self.user()?.to_string(),
            host,
            port: self.port,
        })
    }

    fn remote_dir(&self) -> Result<&str> {
        self.remote_dir
            .as_deref()
            .filter(|d| !d.is_empty())
            .ok_or_else(|| BackupError::Configuration("REMOTE_SITE_DIR is required".into()))
    }

    /// `<user>-database-dump-<timestamp>.sql`
    pub fn database_dump_name(&self) -> Result<String> {
        Ok(format!("{}-database-dump-{}.sql", self.user()?, self.timestamp))
    }

    /// `<site>-wordpress-files-backup-<timestamp>.zip`
    pub fn archive_name(&self) -> String {
        format!("{}-wordpress-files-backup-{}.zip", self.site, self.timestamp)
    }

    pub fn archive_path(&self) -> PathBuf {
        self.archive_dir.join(self.archive_name())
    }
}

/// Last component of a remote path, ignoring trailing slashes.
pub fn remote_basename(remote_dir: &str) -> &str {
    let trimmed = remote_dir.trim_end_matches('/');
    match trimmed.rsplit('/').next() {
        Some(name) if !name.is_empty() => name,
        _ => trimmed,
    }
}

/// Job behaviour fixed for the life of the process.
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub phases: PhaseConfig,
    pub db_export_command: String,
    pub keep_local_archive: bool,
    pub verbose: bool,
}

impl JobSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            phases: config.phases,
            db_export_command: config.remote.db_export_command.clone(),
            keep_local_archive: config.paths.keep_local_archive,
            verbose: config.verbose,
        }
    }
}

#[derive(Debug)]
pub enum PhaseOutcome {
    Succeeded(UploadedArtifact),
    Failed(BackupError),
    Skipped,
}

impl PhaseOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, PhaseOutcome::Failed(_))
    }
}

impl fmt::Display for PhaseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseOutcome::Succeeded(artifact) => write!(f, "uploaded {}", artifact.name),
            PhaseOutcome::Failed(e) => write!(f, "failed: {}", e),
            PhaseOutcome::Skipped => f.write_str("skipped"),
        }
    }
}

#[derive(Debug)]
pub struct JobReport {
    pub site: String,
    pub timestamp: String,
    pub database: PhaseOutcome,
    pub files: PhaseOutcome,
}

impl JobReport {
    pub fn is_success(&self) -> bool {
        !self.database.is_failed() && !self.files.is_failed()
    }
}

pub struct BackupJob {
    remote: Arc<dyn RemoteExec>,
    sync: SyncEngine,
    uploader: Arc<Uploader>,
    settings: JobSettings,
}

impl BackupJob {
    pub fn new(
        remote: Arc<dyn RemoteExec>,
        sync: SyncEngine,
        uploader: Arc<Uploader>,
        settings: JobSettings,
    ) -> Self {
        Self {
            remote,
            sync,
            uploader,
            settings,
        }
    }

    /// Run both phases. Phase failures are recorded in the report, never returned.
    pub async fn run(&self, spec: &BackupJobSpec) -> JobReport {
        info!(site = %spec.site, timestamp = %spec.timestamp, "Starting backup job");

        let database = if self.settings.phases.database {
            outcome("database", self.database_phase(spec).await)
        } else {
            info!("Database backup disabled");
            PhaseOutcome::Skipped
        };

        let files = if self.settings.phases.files {
            outcome("files", self.file_phase(spec).await)
        } else {
            info!("File backup disabled");
            PhaseOutcome::Skipped
        };

        let report = JobReport {
            site: spec.site.clone(),
            timestamp: spec.timestamp.clone(),
            database,
            files,
        };
        if report.is_success() {
            info!(site = %report.site, database = %report.database, files = %report.files, "Backup job finished");
        } else {
            warn!(site = %report.site, database = %report.database, files = %report.files, "Backup job finished with failures");
        }
        report
    }

    async fn database_phase(&self, spec: &BackupJobSpec) -> Result<UploadedArtifact> {
        let target = spec.ssh_target()?;
        let name = spec.database_dump_name()?;

        info!(host = %target.host, command = %self.settings.db_export_command, "Starting database backup");
        let dump = self
            .remote
            .run(&target, &self.settings.db_export_command)
            .await?;
        info!(bytes = dump.len(), "Database dump received");

        self.uploader
            .upload_buffer_in_site_folder(&spec.site, &name, Bytes::from(dump))
            .await
    }

    async fn file_phase(&self, spec: &BackupJobSpec) -> Result<UploadedArtifact> {
        let remote_dir = spec.remote_dir()?.to_string();

        tokio::fs::create_dir_all(&spec.archive_dir)
            .await
            .map_err(|e| {
                BackupError::resource(
                    format!("unable to create {}", spec.archive_dir.display()),
                    e,
                )
            })?;

        info!(remote_dir = %remote_dir, "Starting file backup");
        let request = SyncRequest {
            user: spec.user.clone(),
            host: spec.host.clone(),
            port: spec.port,
            remote_dir: remote_dir.clone(),
            destination: Some(spec.staging_dir.clone()),
            verbose: self.settings.verbose,
        };
        let synced = self.sync.sync(&request).await?;

        let source = synced.destination.join(remote_basename(&remote_dir));
        let archive_path = spec.archive_path();
        let summary = {
            let archive_path = archive_path.clone();
            tokio::task::spawn_blocking(move || create_zip_archive(&archive_path, &source))
                .await
                .map_err(|e| BackupError::TerminalIo(format!("archive task failed: {}", e)))??
        };

        let artifact = self
            .uploader
            .upload_file_in_site_folder(&spec.site, &summary.path)
            .await?;

        if self.settings.keep_local_archive {
            info!(archive = %archive_path.display(), "Keeping local archive");
        } else if let Err(e) = tokio::fs::remove_file(&archive_path).await {
            warn!(archive = %archive_path.display(), error = %e, "Failed to delete local archive");
        }

        Ok(artifact)
    }
}

fn outcome(phase: &str, result: Result<UploadedArtifact>) -> PhaseOutcome {
    match result {
        Ok(artifact) => {
            info!(phase, name = %artifact.name, id = %artifact.id, "Backup phase succeeded");
            PhaseOutcome::Succeeded(artifact)
        }
        Err(e) => {
            error!(phase, error = %e, "Backup phase failed");
            PhaseOutcome::Failed(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use crate::storage::FolderLayout;
    use crate::sync::{AttemptFailure, RetryPolicy, SyncOperation, SyncTarget};
    use crate::utils::SshErrorKind;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct FixedRemote {
        output: std::result::Result<Vec<u8>, SshErrorKind>,
        commands: Mutex<Vec<(SshTarget, String)>>,
    }

    impl FixedRemote {
        fn ok(output: &[u8]) -> Arc<Self> {
            Arc::new(Self {
                output: Ok(output.to_vec()),
                commands: Mutex::new(Vec::new()),
            })
        }

        fn failing(kind: SshErrorKind) -> Arc<Self> {
            Arc::new(Self {
                output: Err(kind),
                commands: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl RemoteExec for FixedRemote {
        async fn run(&self, target: &SshTarget, command: &str) -> Result<Vec<u8>> {
            self.commands
                .lock()
                .unwrap()
                .push((target.clone(), command.to_string()));
            match &self.output {
                Ok(bytes) => Ok(bytes.clone()),
                Err(kind) => Err(BackupError::ssh(*kind, "scripted failure")),
            }
        }
    }

    /// Writes a small site tree where rsync would put it.
    struct FakeMirror;

    #[async_trait]
    impl SyncOperation for FakeMirror {
        async fn run_once(&self, target: &SyncTarget) -> std::result::Result<(), AttemptFailure> {
            let root = target.destination.join(remote_basename(&target.remote_dir));
            std::fs::create_dir_all(root.join("wp-content/uploads")).unwrap();
            std::fs::write(root.join("index.php"), b"<?php").unwrap();
            Ok(())
        }
    }

    struct BrokenMirror;

    #[async_trait]
    impl SyncOperation for BrokenMirror {
        async fn run_once(&self, _target: &SyncTarget) -> std::result::Result<(), AttemptFailure> {
            Err(AttemptFailure::Exited {
                code: Some(23),
                stderr: "rsync: change_dir failed: No such file or directory".into(),
            })
        }
    }

    fn spec(dir: &Path) -> BackupJobSpec {
        BackupJobSpec {
            user: Some("u".into()),
            host: Some("h".into()),
            port: 22,
            remote_dir: Some("/sites/example/".into()),
            staging_dir: dir.join("staging"),
            archive_dir: dir.join("zips"),
            site: "example".into(),
            timestamp: "2024-01-01-000000".into(),
        }
    }

    fn settings(database: bool, files: bool) -> JobSettings {
        JobSettings {
            phases: PhaseConfig { database, files },
            db_export_command: "wp db export -".into(),
            keep_local_archive: false,
            verbose: false,
        }
    }

    fn job(
        remote: Arc<FixedRemote>,
        mirror: Arc<dyn SyncOperation>,
        store: &Arc<MemoryStore>,
        settings: JobSettings,
    ) -> BackupJob {
        let uploader = Uploader::new(store.clone(), "root", FolderLayout::PerSite);
        BackupJob::new(
            remote,
            SyncEngine::new(mirror, RetryPolicy::default()),
            Arc::new(uploader),
            settings,
        )
    }

    #[tokio::test]
    async fn test_database_dump_is_uploaded_verbatim() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let remote = FixedRemote::ok(b"-- dump --");
        let job = job(remote.clone(), Arc::new(FakeMirror), &store, settings(true, false));

        let report = job.run(&spec(dir.path())).await;

        assert!(report.is_success());
        assert!(matches!(report.files, PhaseOutcome::Skipped));
        let files = store.files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "u-database-dump-2024-01-01-000000.sql");
        assert_eq!(files[0].data, b"-- dump --");
        assert_eq!(files[0].content_type, "application/sql");

        let commands = remote.commands.lock().unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].0.address(), "h:22");
        assert_eq!(commands[0].1, "wp db export -");
    }

    #[tokio::test]
    async fn test_file_phase_archives_uploads_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let job = job(FixedRemote::ok(b""), Arc::new(FakeMirror), &store, settings(false, true));
        let spec = spec(dir.path());

        let report = job.run(&spec).await;

        match &report.files {
            PhaseOutcome::Succeeded(artifact) => {
                assert_eq!(artifact.name, "example-wordpress-files-backup-2024-01-01-000000.zip")
            }
            other => panic!("unexpected outcome {}", other),
        }
        assert!(!spec.archive_path().exists());

        let files = store.files();
        let uploaded = &files[0];
        let mut zip = zip::ZipArchive::new(std::io::Cursor::new(uploaded.data.clone())).unwrap();
        assert!(zip.by_name("example/index.php").is_ok());
        assert!(zip.by_name("example/wp-content/uploads/").is_ok());
    }

    #[tokio::test]
    async fn test_keep_local_archive() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let mut settings = settings(false, true);
        settings.keep_local_archive = true;
        let job = job(FixedRemote::ok(b""), Arc::new(FakeMirror), &store, settings);
        let spec = spec(dir.path());

        assert!(job.run(&spec).await.is_success());
        assert!(spec.archive_path().is_file());
    }

    #[tokio::test]
    async fn test_phase_failures_are_isolated() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let job = job(
            FixedRemote::failing(SshErrorKind::Authentication),
            Arc::new(FakeMirror),
            &store,
            settings(true, true),
        );

        let report = job.run(&spec(dir.path())).await;

        assert!(!report.is_success());
        assert!(matches!(
            report.database,
            PhaseOutcome::Failed(BackupError::Ssh { kind: SshErrorKind::Authentication, .. })
        ));
        assert!(matches!(report.files, PhaseOutcome::Succeeded(_)));
    }

    #[tokio::test]
    async fn test_sync_failure_fails_only_file_phase() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let job = job(FixedRemote::ok(b"dump"), Arc::new(BrokenMirror), &store, settings(true, true));

        let report = job.run(&spec(dir.path())).await;

        assert!(matches!(report.database, PhaseOutcome::Succeeded(_)));
        assert!(matches!(
            report.files,
            PhaseOutcome::Failed(BackupError::SyncRejected { attempt: 1, .. })
        ));
        assert_eq!(store.files().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_remote_dir_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let job = job(FixedRemote::ok(b""), Arc::new(FakeMirror), &store, settings(false, true));
        let mut spec = spec(dir.path());
        spec.remote_dir = None;

        let report = job.run(&spec).await;
        assert!(matches!(report.files, PhaseOutcome::Failed(BackupError::Configuration(_))));
    }

    #[test]
    fn test_artifact_names() {
        let spec = spec(Path::new("/tmp"));
        assert_eq!(spec.database_dump_name().unwrap(), "u-database-dump-2024-01-01-000000.sql");
        assert_eq!(
            spec.archive_path(),
            PathBuf::from("/tmp/zips/example-wordpress-files-backup-2024-01-01-000000.zip")
        );
    }

    #[test]
    fn test_remote_basename() {
        assert_eq!(remote_basename("/sites/example"), "example");
        assert_eq!(remote_basename("/sites/example///"), "example");
        assert_eq!(remote_basename("example"), "example");
    }

    #[test]
    fn test_spec_timestamp_format() {
        use chrono::Utc;
        let config = Config::from_lookup(|key| match key {
            "SITE_NAME" => Some("example".into()),
            _ => None,
        })
        .unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let spec = BackupJobSpec::from_config(&config, now).unwrap();
        assert_eq!(spec.timestamp, "2024-01-01-000000");
        assert_eq!(spec.site, "example");
    }
}
