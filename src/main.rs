//! Fleet Backup Tool
//!
//! Provides CLI interface for scheduled and on-demand PostgreSQL backups and restores

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use fleetbackup::BackupApp;
use fleetbackup::config::AppConfig;
use fleetbackup::models::{BatchBackupRun, Caller, DatabaseResult};
use fleetbackup::utils::format_size;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "fleetbackup", version, about = "Batch backup and restore for a PostgreSQL fleet")]
struct Cli {
    /// Path to config.json
    #[arg(short, long, global = true, default_value = "config.json", env = "FLEETBACKUP_CONFIG")]
    config: PathBuf,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconcile the backup root, run the configured schedules and prune until Ctrl-C
    Daemon {
        /// Seconds between retention sweeps
        #[arg(long, default_value_t = 3600)]
        retention_interval_secs: u64,
    },
    /// Back up the given databases now, or every database when none is given
    Backup {
        #[arg(long = "db")]
        databases: Vec<String>,
    },
    /// Restore a batch run, or one database from it
    Restore {
        #[arg(long)]
        run: String,
        #[arg(long)]
        db: Option<String>,
    },
    /// List known batch runs, newest first
    Runs,
    /// Delete runs and standalone backups older than the given age
    Prune {
        /// Defaults to default_retention_days from the configuration
        #[arg(long)]
        days: Option<u32>,
    },
}

fn setup_logging(verbose: bool) {
    use tracing_subscriber::{EnvFilter, fmt};

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    fmt()
        .with_env_filter(env_filter)
        .with_target(verbose)
        .compact()
        .init();
}

/// Main entry point for the backup tool
#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match run_app(cli).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("❌ {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: &Path) -> Result<AppConfig> {
    dotenv::dotenv().ok();
    if path.exists() {
        AppConfig::load_from_json(path)
            .with_context(|| format!("Failed to load application configuration from {}", path.display()))
    } else {
        info!(path = %path.display(), "No config file found, reading configuration from the environment");
        AppConfig::from_env().context("Failed to load application configuration from the environment")
    }
}

fn cli_caller() -> Caller {
    let label = std::env::var("USER").unwrap_or_else(|_| "cli".to_string());
    Caller::Admin { label }
}

async fn run_app(cli: Cli) -> Result<()> {
    let config = load_config(&cli.config)?;
    let app = BackupApp::from_config(config).context("Failed to initialise backup service")?;
    let caller = cli_caller();

    match cli.command {
        Command::Daemon {
            retention_interval_secs,
        } => {
            let app = Arc::new(app);
            app.start().await.context("Failed to start backup service")?;
            let sweeper = app.spawn_retention_sweeper(Duration::from_secs(retention_interval_secs.max(1)));
            info!("🚀 Backup daemon running, press Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            info!("Shutting down");
            sweeper.abort();
            app.shutdown();
        }
        Command::Backup { databases } => {
            app.reconcile().await.context("Failed to reconcile backup root")?;
            let run = app.backup_databases(&caller, databases).await.context("Backup could not start")?;
            print_run(&run);
            report_failures("backup", &run.results)?;
        }
        Command::Restore { run, db } => {
            app.reconcile().await.context("Failed to reconcile backup root")?;
            let operation_id = app
                .start_restore(&caller, &run, db.as_deref())
                .await
                .context("Restore could not start")?;
            println!("🔄 Restore operation {} started", operation_id);
            let operation = app.wait_for_restore(&caller, &operation_id, Duration::from_secs(1)).await?;
            for result in &operation.results {
                print_result(result);
            }
            if let Some(failure) = &operation.failure {
                bail!("restore operation {} failed: {}", operation_id, failure);
            }
            report_failures("restore", &operation.results)?;
        }
        Command::Runs => {
            app.reconcile().await.context("Failed to reconcile backup root")?;
            let runs = app.list_runs(&caller).await;
            if runs.is_empty() {
                println!("No backup runs under {}", app.config().backup_root.display());
            }
            for run in &runs {
                print_run(run);
            }
        }
        Command::Prune { days } => {
            app.reconcile().await.context("Failed to reconcile backup root")?;
            let days = days.unwrap_or(app.config().default_retention_days);
            let report = app.prune(&caller, days).await?;
            println!(
                "🧹 Removed {} run(s) and {} standalone backup(s) older than {} day(s)",
                report.removed_runs.len(),
                report.removed_artifacts.len(),
                days
            );
            if !report.failures.is_empty() {
                bail!("{} entries could not be removed: {}", report.failures.len(), report.failures.join("; "));
            }
        }
    }
    Ok(())
}

fn print_result(result: &DatabaseResult) {
    match &result.error {
        None => println!("  ✅ {}", result.database),
        Some(error) => println!("  ❌ {}: {}", result.database, error),
    }
}

fn print_run(run: &BatchBackupRun) {
    println!(
        "{}  {}  {}  {}  {}",
        run.id,
        run.status,
        run.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
        run.initiator,
        format_size(run.total_size_bytes)
    );
    for result in &run.results {
        print_result(result);
    }
}

fn report_failures(action: &str, results: &[DatabaseResult]) -> Result<()> {
    let failed = results.iter().filter(|r| !r.success).count();
    if failed > 0 {
        bail!("{} of {} database {}s failed", failed, results.len(), action);
    }
    println!("✅ Operation completed successfully.");
    Ok(())
}
