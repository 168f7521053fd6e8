//! wp-backup-agent - main entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use wp_backup_agent::config::Config;
use wp_backup_agent::daemon::{BackupTask, Scheduler, ShutdownCoordinator};
use wp_backup_agent::job::{BackupJob, JobSettings};
use wp_backup_agent::remote::SshRunner;
use wp_backup_agent::storage::auth::OAuthClient;
use wp_backup_agent::storage::{DriveAuth, DriveClient, Uploader};
use wp_backup_agent::sync::{RsyncCommand, SyncEngine};
use wp_backup_agent::transfer::progress::log_reporter;
use wp_backup_agent::utils;
use wp_backup_agent::wpe::{is_selected, WpeClient};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Extra environment file, loaded before .env.local and .env
    #[arg(short, long, value_name = "FILE")]
    env_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Run backups on the configured schedule until interrupted (default)
    Run,
    /// Run a single backup and exit
    Once,
    /// Authorize Google Drive access and save the OAuth token
    Auth,
    /// List WP Engine sites and installs
    Sites,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(path) = &args.env_file {
        dotenvy::from_path(path)
            .with_context(|| format!("failed to load {}", path.display()))?;
    }
    dotenvy::from_filename(".env.local").ok();
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("invalid configuration")?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!("Starting wp-backup-agent v{}", env!("CARGO_PKG_VERSION"));

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Once => once(config).await,
        Command::Auth => authorize(&config).await,
        Command::Sites => sites(&config).await,
    }
}

async fn build_job(config: &Config, cancel: CancellationToken) -> Result<BackupJob> {
    config
        .site_name
        .as_deref()
        .context("SITE_NAME is required")?;
    let root_folder = config
        .drive
        .root_folder_id
        .clone()
        .context("GOOGLE_DRIVE_FOLDER_ID is required")?;

    let auth = DriveAuth::from_config(&config.drive)
        .await
        .context("failed to load Google Drive credentials")?;
    let drive = Arc::new(DriveClient::new(auth)?);
    let uploader = Uploader::new(drive, root_folder, config.drive.layout)
        .with_progress(log_reporter("upload"));

    let remote = Arc::new(SshRunner::new(
        config.remote.key_path.clone(),
        config.remote.host_keys.clone(),
        config.remote.connect_timeout,
    ));
    let rsync = Arc::new(RsyncCommand::new(
        Some(config.remote.key_path.clone()),
        config.remote.host_keys.clone(),
    ));
    let sync = SyncEngine::with_cancel(rsync, config.retry.clone(), cancel);

    Ok(BackupJob::new(
        remote,
        sync,
        Arc::new(uploader),
        JobSettings::from_config(config),
    ))
}

async fn run(config: Config) -> Result<()> {
    let coordinator = ShutdownCoordinator::new();
    let cancel = coordinator.token();

    let job = build_job(&config, cancel.clone()).await?;
    let schedule = config.schedule.schedule.clone();
    let run_on_start = config.schedule.run_on_start;
    let task = Arc::new(BackupTask::new(Arc::new(job), Arc::new(config)));

    let signals = tokio::spawn(async move {
        if let Err(e) = coordinator.wait_for_signal().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signals");
            coordinator.trigger();
        }
    });

    let result = Scheduler::new(schedule, run_on_start, task, cancel.clone())
        .run()
        .await;

    cancel.cancel();
    let _ = signals.await;
    result.context("scheduler failed")?;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn once(config: Config) -> Result<()> {
    let job = build_job(&config, CancellationToken::new()).await?;
    let task = BackupTask::new(Arc::new(job), Arc::new(config));

    if let Some(report) = task.run_once().await {
        tracing::info!(
            site = %report.site,
            database = %report.database,
            files = %report.files,
            "Backup run complete"
        );
    }
    Ok(())
}

async fn authorize(config: &Config) -> Result<()> {
    let secret_file = config
        .drive
        .client_secret_file
        .as_ref()
        .context("GOOGLE_CLIENT_SECRET_JSON_FILE is required for `auth`")?;
    let client = OAuthClient::load(secret_file).await?;

    println!(
        "Go to the following link in your browser, then paste the authorization \
         code from the redirect URL:\n{}",
        client.consent_url()?
    );

    let mut code = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut code)
        .await
        .context("unable to read authorization code")?;
    let code = code.trim();
    anyhow::ensure!(!code.is_empty(), "no authorization code entered");

    let token = client.exchange_code(&reqwest::Client::new(), code).await?;
    token.save(&config.drive.token_file)?;
    println!("Saved token to {}", config.drive.token_file.display());
    Ok(())
}

async fn sites(config: &Config) -> Result<()> {
    let client = WpeClient::from_config(&config.wpe)?;
    let sites = client.list_sites().await?;

    for site in &sites {
        println!("{} ({})", site.name, site.id);
        for install in &site.installs {
            let marker = if is_selected(install, &config.wpe.installs) { "*" } else { " " };
            println!(
                "  {} {:<24} {:<12} {}",
                marker,
                install.name,
                install.environment.as_deref().unwrap_or("-"),
                install.cname.as_deref().unwrap_or("-")
            );
        }
    }
    Ok(())
}
