//! catalog-mirror command line
//!
//! `sync` and `resume` drive the run inside this process until it reaches a
//! terminal state. The other commands inspect or control the shared state and
//! work against a run driven by another process too.

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use catalog_mirror::application::{CatalogSyncService, RunSignals, StatusReport};
use catalog_mirror::domain::{EntityKind, SyncRun, SyncStatus};
use catalog_mirror::infrastructure::{
    AppConfig, ConfigCredentials, ConfigManager, CredentialProvider, DatabaseConnection,
    HttpCatalogClient, RequestPacer, SyncStateRepository, init_logging_with_config,
    resolve_database_url,
};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "catalog-mirror")]
#[command(about = "Resumable, chunked mirror of the print-on-demand catalog", long_about = None)]
struct Cli {
    /// Configuration file (default: <config dir>/catalog-mirror/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database URL, overriding the configured one
    #[arg(long, global = true)]
    database: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a new sync and follow it to the end
    Sync,
    /// Continue a cancelled or failed sync from its checkpoint
    Resume,
    /// Print the current sync state as JSON
    Status,
    /// Stop the running sync
    Cancel {
        #[arg(long)]
        reason: Option<String>,
    },
    /// Stop everything and block new API calls for a while
    EmergencyStop,
    /// Return a finished sync to idle
    Reset,
    /// Print counts and the latest entry of each cached kind
    Summary,
    /// Write a default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long, default_value_t = false)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new()?,
    };

    if let Commands::InitConfig { force } = cli.command {
        return init_config(&manager, force).await;
    }

    let mut config = manager.load_config().await?;
    if let Some(url) = &cli.database {
        config.database.url.clone_from(url);
    }

    init_logging_with_config(&config.logging)?;
    info!("🚀 catalog-mirror {}", env!("CARGO_PKG_VERSION"));

    let service = build_service(&config).await?;

    match cli.command {
        Commands::Sync => {
            let run = service.start_sync().await?;
            println!("▶️  Sync started: {} blueprints", run.total_count);
            follow(&service).await
        }
        Commands::Resume => {
            let run = service.resume_sync().await?;
            println!("▶️  Sync resumed at {}/{}", run.current_index, run.total_count);
            follow(&service).await
        }
        Commands::Status => print_json(&service.get_status().await?),
        Commands::Cancel { reason } => {
            let run = service.cancel_sync(reason.as_deref()).await?;
            println!("{}", progress_line(&run));
            Ok(())
        }
        Commands::EmergencyStop => {
            let run = service.emergency_stop().await?;
            println!("🚨 Emergency stop set. {}", progress_line(&run));
            Ok(())
        }
        Commands::Reset => {
            service.reset_sync().await?;
            println!("🔄 Sync state reset to idle");
            Ok(())
        }
        Commands::Summary => {
            let summary = service.get_summary().await?;
            for kind in EntityKind::ALL {
                let entry = summary.get(kind);
                let updated = entry
                    .last_updated
                    .map_or_else(|| "-".to_string(), |at| at.to_rfc3339());
                println!("{:<10} {:>8}  last updated {updated}", kind.to_string(), entry.count);
            }
            Ok(())
        }
        Commands::InitConfig { .. } => Ok(()),
    }
}

async fn init_config(manager: &ConfigManager, force: bool) -> Result<()> {
    if manager.config_path().exists() && !force {
        return Err(anyhow!(
            "Configuration already exists at {:?} (use --force to overwrite)",
            manager.config_path()
        ));
    }
    manager.save_config(&AppConfig::default()).await?;
    println!("📝 Wrote default configuration to {}", manager.config_path().display());
    Ok(())
}

async fn build_service(config: &AppConfig) -> Result<CatalogSyncService> {
    let database_url = resolve_database_url(&config.database)?;
    let db = DatabaseConnection::new(&database_url).await?;
    db.migrate().await?;
    let pool = db.pool().clone();

    let credentials: Arc<dyn CredentialProvider> = Arc::new(ConfigCredentials::new(&config.api));
    let pacer = Arc::new(RequestPacer::from_config(&config.api));

    let signals = RunSignals::new(SyncStateRepository::new(pool.clone()));
    let client = HttpCatalogClient::new(&config.api, credentials.clone(), pacer)
        .context("Failed to build API client")?
        .with_observer(Arc::new(signals));

    Ok(CatalogSyncService::new(
        pool,
        Arc::new(client),
        credentials,
        config.sync.clone(),
    ))
}

/// Print progress until the run is terminal. Ctrl-C cancels the run.
async fn follow(service: &CatalogSyncService) -> Result<()> {
    let mut last_line = String::new();
    loop {
        let report = service.get_status().await?;
        let line = progress_line(&report.run);
        if line != last_line {
            println!("{line}");
            last_line = line;
        }

        if report.run.status.is_terminal() || (!report.alive && !service.is_worker_active().await) {
            return finish(&report);
        }

        tokio::select! {
            () = tokio::time::sleep(POLL_INTERVAL) => {}
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                warn!("Interrupted, cancelling sync");
                let run = service.cancel_sync(Some("interrupted")).await?;
                println!("{}", progress_line(&run));
                return Ok(());
            }
        }
    }
}

fn finish(report: &StatusReport) -> Result<()> {
    match report.run.status {
        SyncStatus::Error => Err(anyhow!(
            "Sync failed: {}",
            report.run.error.as_deref().unwrap_or("unknown error")
        )),
        _ => Ok(()),
    }
}

fn progress_line(run: &SyncRun) -> String {
    format!(
        "[{}] {:>6.2}% {}/{} {} {}",
        run.status,
        run.percentage,
        run.current_index,
        run.total_count,
        run.phase,
        run.current_item
    )
}

fn print_json(report: &StatusReport) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}
