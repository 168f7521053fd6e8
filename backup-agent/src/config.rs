//! Configuration management for the backup agent.
//!
//! Every setting comes from the process environment. `main` loads
//! `.env.local` and `.env` (when present) before calling [`Config::from_env`].

use crate::daemon::scheduler::Schedule;
use crate::remote::HostKeyPolicy;
use crate::storage::FolderLayout;
use crate::sync::{RetryPolicy, TransientClassifier};
use crate::utils::{BackupError, Result};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_KEY_PATH: &str = "~/.ssh/id_rsa";
const DEFAULT_KNOWN_HOSTS: &str = "~/.ssh/known_hosts";
const DEFAULT_DB_EXPORT_COMMAND: &str = "wp db export -";
const DEFAULT_STAGING_DIR: &str = "temp_files";
const DEFAULT_ARCHIVE_DIR: &str = "temp_zips";
const DEFAULT_TOKEN_FILE: &str = "auth/token.json";
const DEFAULT_INTERVAL: &str = "24h";

/// A string that never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub remote: RemoteConfig,
    pub paths: PathsConfig,
    /// Site identifier used for artifact names and the per-site Drive folder
    pub site_name: Option<String>,
    /// Surface rsync stdout and default the log level to debug
    pub verbose: bool,
    pub phases: PhaseConfig,
    pub retry: RetryPolicy,
    pub schedule: ScheduleConfig,
    pub drive: DriveConfig,
    pub wpe: WpeConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub user: Option<String>,
    pub host: Option<String>,
    pub port: u16,

    /// Private key used for both the SSH session and rsync's remote shell
    pub key_path: PathBuf,

    pub host_keys: HostKeyPolicy,

    /// Remote WordPress root mirrored by the file phase
    pub source_dir: Option<String>,

    /// Command whose stdout is the database dump
    pub db_export_command: String,

    pub connect_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PathsConfig {
    pub staging_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub keep_local_archive: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct PhaseConfig {
    pub database: bool,
    pub files: bool,
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub schedule: Schedule,
    pub run_on_start: bool,
}

#[derive(Debug, Clone)]
pub struct DriveConfig {
    pub root_folder_id: Option<String>,
    pub layout: FolderLayout,
    pub client_secret_file: Option<PathBuf>,
    pub token_file: PathBuf,
    pub service_account_key_file: Option<PathBuf>,
    pub access_token: Option<Secret>,
}

#[derive(Debug, Clone)]
pub struct WpeConfig {
    pub user_id: Option<String>,
    pub password: Option<Secret>,
    /// Install names selected for backup
    pub installs: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// Empty values are treated as unset. Malformed values are errors rather
    /// than silently falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup: &lookup };

        let verbose = env.bool("VERBOSE", false)?;
        let home = env.get("HOME");

        let host_keys = if env.bool("SSH_ACCEPT_ANY_HOST_KEY", false)? {
            HostKeyPolicy::AcceptAny
        } else {
            HostKeyPolicy::Verify {
                known_hosts: expand_home(
                    &env.get("SSH_KNOWN_HOSTS").unwrap_or_else(|| DEFAULT_KNOWN_HOSTS.into()),
                    home.as_deref(),
                ),
            }
        };

        let remote = RemoteConfig {
            user: env.get("SSH_USER"),
            host: env.get("SSH_HOST"),
            port: env.parse("SSH_PORT", 22)?,
            key_path: expand_home(
                &env.get("SSH_KEY_PATH").unwrap_or_else(|| DEFAULT_KEY_PATH.into()),
                home.as_deref(),
            ),
            host_keys,
            source_dir: env.get("REMOTE_SITE_DIR"),
            db_export_command: env
                .get("DB_EXPORT_COMMAND")
                .unwrap_or_else(|| DEFAULT_DB_EXPORT_COMMAND.into()),
            connect_timeout: env.duration("SSH_CONNECT_TIMEOUT", "30s")?,
        };

        let paths = PathsConfig {
            staging_dir: PathBuf::from(
                env.get("DOWNLOAD_DESTINATION_DIR")
                    .unwrap_or_else(|| DEFAULT_STAGING_DIR.into()),
            ),
            archive_dir: PathBuf::from(
                env.get("ZIP_DESTINATION_DIR")
                    .unwrap_or_else(|| DEFAULT_ARCHIVE_DIR.into()),
            ),
            keep_local_archive: env.bool("KEEP_LOCAL_ARCHIVE", false)?,
        };

        let phases = PhaseConfig {
            database: !env.bool("DISABLE_DATABASE_BACKUP", false)?,
            files: !env.bool("DISABLE_FILES_BACKUP", false)?,
        };

        let classifier = if env.bool("SYNC_RETRY_ON_ANY_FAILURE", false)? {
            TransientClassifier::AnyFailure
        } else {
            TransientClassifier::ConnectionDropped
        };
        let retry = RetryPolicy::new(
            env.parse("SYNC_MAX_ATTEMPTS", 5)?,
            Duration::from_secs(env.parse("SYNC_INITIAL_DELAY_SECS", 5)?),
            env.parse("SYNC_BACKOFF_MULTIPLIER", 2.0)?,
            classifier,
        )?;

        let schedule = match env.get("BACKUP_CRON") {
            Some(expression) => Schedule::Cron(expression),
            None => {
                let period = env.duration("BACKUP_INTERVAL", DEFAULT_INTERVAL)?;
                if period.is_zero() {
                    return Err(BackupError::Configuration(
                        "BACKUP_INTERVAL must be greater than zero".into(),
                    ));
                }
                Schedule::Interval(period)
            }
        };

        let layout = match env.get("GOOGLE_DRIVE_FOLDER_LAYOUT") {
            Some(value) => value.parse()?,
            None => FolderLayout::PerSite,
        };

        let drive = DriveConfig {
            root_folder_id: env.get("GOOGLE_DRIVE_FOLDER_ID"),
            layout,
            client_secret_file: env.get("GOOGLE_CLIENT_SECRET_JSON_FILE").map(PathBuf::from),
            token_file: PathBuf::from(
                env.get("GOOGLE_TOKEN_FILE")
                    .unwrap_or_else(|| DEFAULT_TOKEN_FILE.into()),
            ),
            service_account_key_file: env
                .get("GOOGLE_SERVICE_ACCOUNT_KEY_FILE")
                .map(PathBuf::from),
            access_token: env.get("GOOGLE_DRIVE_ACCESS_TOKEN").map(Secret::new),
        };

        let wpe = WpeConfig {
            user_id: env.get("WPE_USER_ID"),
            password: env.get("WPE_PASSWORD").map(Secret::new),
            installs: env.list("WPE_INSTALLS"),
        };

        let default_level = if verbose { "debug" } else { "info" };
        let log = LogConfig {
            level: env.get("LOG_LEVEL").unwrap_or_else(|| default_level.into()),
        };

        Ok(Config {
            remote,
            paths,
            site_name: env.get("SITE_NAME"),
            verbose,
            phases,
            retry,
            schedule: ScheduleConfig {
                schedule,
                run_on_start: env.bool("RUN_ON_START", true)?,
            },
            drive,
            wpe,
            log,
        })
    }
}

struct Env<'a, F> {
    lookup: &'a F,
}

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw.parse().map_err(|e| {
                BackupError::Configuration(format!("invalid value {:?} for {}: {}", raw, key, e))
            }),
            None => Ok(default),
        }
    }

    fn bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            Some(raw) => parse_bool(&raw).ok_or_else(|| {
                BackupError::Configuration(format!(
                    "invalid boolean {:?} for {} (expected true/false)",
                    raw, key
                ))
            }),
            None => Ok(default),
        }
    }

    fn duration(&self, key: &str, default: &str) -> Result<Duration> {
        let raw = self.get(key).unwrap_or_else(|| default.to_string());
        parse_duration(&raw).map_err(|e| {
            BackupError::Configuration(format!("invalid duration {:?} for {}: {}", raw, key, e))
        })
    }

    fn list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Plain integers are seconds; anything else goes through humantime (`30m`, `1h 30m`).
fn parse_duration(raw: &str) -> std::result::Result<Duration, humantime::DurationError> {
    match raw.parse::<u64>() {
        Ok(secs) => Ok(Duration::from_secs(secs)),
        Err(_) => humantime::parse_duration(raw),
    }
}

/// Replace a leading `~/` with the home directory.
pub fn expand_home(path: &str, home: Option<&str>) -> PathBuf {
    match (path.strip_prefix("~/"), home) {
        (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("HOME", "/home/backup")]).unwrap();

        assert_eq!(config.remote.port, 22);
        assert_eq!(config.remote.key_path, PathBuf::from("/home/backup/.ssh/id_rsa"));
        assert_eq!(config.remote.db_export_command, "wp db export -");
        assert_eq!(
            config.remote.host_keys,
            HostKeyPolicy::Verify {
                known_hosts: PathBuf::from("/home/backup/.ssh/known_hosts")
            }
        );
        assert_eq!(config.paths.staging_dir, PathBuf::from("temp_files"));
        assert!(config.phases.database && config.phases.files);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_delay, Duration::from_secs(5));
        assert_eq!(config.retry.backoff_multiplier, 2.0);
        assert_eq!(config.retry.classifier, TransientClassifier::ConnectionDropped);
        assert!(matches!(
            config.schedule.schedule,
            Schedule::Interval(d) if d == Duration::from_secs(24 * 3600)
        ));
        assert!(config.schedule.run_on_start);
        assert_eq!(config.drive.layout, FolderLayout::PerSite);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("SSH_USER", "site"),
            ("SSH_HOST", "site.ssh.example.net"),
            ("SSH_PORT", "2222"),
            ("SSH_ACCEPT_ANY_HOST_KEY", "true"),
            ("VERBOSE", "true"),
            ("DISABLE_DATABASE_BACKUP", "yes"),
            ("BACKUP_INTERVAL", "90"),
            ("SYNC_RETRY_ON_ANY_FAILURE", "1"),
            ("GOOGLE_DRIVE_FOLDER_LAYOUT", "flat"),
            ("WPE_INSTALLS", " prod , staging,,"),
        ])
        .unwrap();

        assert_eq!(config.remote.user.as_deref(), Some("site"));
        assert_eq!(config.remote.port, 2222);
        assert_eq!(config.remote.host_keys, HostKeyPolicy::AcceptAny);
        assert!(!config.phases.database);
        assert!(config.phases.files);
        assert!(matches!(
            config.schedule.schedule,
            Schedule::Interval(d) if d == Duration::from_secs(90)
        ));
        assert_eq!(config.retry.classifier, TransientClassifier::AnyFailure);
        assert_eq!(config.drive.layout, FolderLayout::Flat);
        assert_eq!(config.wpe.installs, vec!["prod", "staging"]);
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_cron_overrides_interval() {
        let config = load(&[("BACKUP_CRON", "0 0 3 * * *"), ("BACKUP_INTERVAL", "1h")]).unwrap();
        assert!(matches!(config.schedule.schedule, Schedule::Cron(ref c) if c == "0 0 3 * * *"));
    }

    #[test]
    fn test_invalid_values_are_errors() {
        assert!(matches!(
            load(&[("SSH_PORT", "ssh")]),
            Err(BackupError::Configuration(_))
        ));
        assert!(matches!(
            load(&[("VERBOSE", "maybe")]),
            Err(BackupError::Configuration(_))
        ));
        assert!(matches!(
            load(&[("BACKUP_INTERVAL", "soon")]),
            Err(BackupError::Configuration(_))
        ));
        assert!(matches!(
            load(&[("BACKUP_INTERVAL", "0")]),
            Err(BackupError::Configuration(_))
        ));
        assert!(matches!(
            load(&[("SYNC_MAX_ATTEMPTS", "0")]),
            Err(BackupError::Configuration(_))
        ));
    }

    #[test]
    fn test_empty_values_are_unset() {
        let config = load(&[("SSH_USER", "  "), ("SSH_PORT", "")]).unwrap();
        assert!(config.remote.user.is_none());
        assert_eq!(config.remote.port, 22);
    }

    #[test]
    fn test_secrets_are_redacted() {
        let config = load(&[("WPE_PASSWORD", "hunter2")]).unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("hunter2"));
        assert_eq!(config.wpe.password.unwrap().expose(), "hunter2");
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("~/.ssh/id_rsa", Some("/root")), PathBuf::from("/root/.ssh/id_rsa"));
        assert_eq!(expand_home("/keys/id", Some("/root")), PathBuf::from("/keys/id"));
        assert_eq!(expand_home("~/.ssh/id_rsa", None), PathBuf::from("~/.ssh/id_rsa"));
    }
}
