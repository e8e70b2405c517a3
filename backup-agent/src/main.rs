//! Chain Backup Agent - Main entry point

use anyhow::{Context, Result};
use chain_backup_agent::config::Config;
use chain_backup_agent::daemon::ShutdownCoordinator;
use chain_backup_agent::engine::{self, ClientManager};
use chain_backup_agent::executor::{BackupExecutor, BackupRequest, RestoreRequest};
use chain_backup_agent::utils::errors::EXIT_FAILED;
use chain_backup_agent::utils::{self, days_before, now_timestamp, parse_timestamp, AgentError};
use chain_backup_agent::storage;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Take the next backup of a resource (directory, volume, image or server)
    Backup { resource: String },

    /// Replay a chain into a destination
    Restore {
        destination: String,

        /// Restore the state at this date (unix seconds or RFC 3339)
        #[arg(long)]
        date: Option<String>,

        /// Restore into a non-empty destination
        #[arg(long)]
        overwrite: bool,
    },

    /// Show storages and chains of the configured backup name
    Info {
        /// Report the latest backup at or before this date
        #[arg(long)]
        date: Option<String>,
    },

    /// Delete chains whose latest backup is older than this many days
    RemoveOlderThan { days: u64 },
}

async fn run(args: Args) -> Result<()> {
    let config = Config::load(args.config.as_deref()).context("loading configuration")?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    let name = config.hostname_backup_name();
    tracing::info!(
        "Starting chain-backup-agent v{} (backup name: {})",
        env!("CARGO_PKG_VERSION"),
        name
    );

    let storage = storage::from_config(
        &config.storage,
        config.backup.max_segment_size,
        config.backup.queue_size,
    )?;
    config.check_standalone()?;
    let engine = engine::from_config(&config.engine, &ClientManager::new(), config.wait_settings())?;

    let shutdown = ShutdownCoordinator::new();
    let signals = shutdown.clone();
    let signal_handle = tokio::spawn(async move { signals.wait_for_signal().await });

    let executor = BackupExecutor::with_cancel(storage, engine, config.executor_options(), shutdown.token());
    executor.storage().prepare().await?;

    let result = match args.command {
        Command::Backup { resource } => {
            let outcome = executor
                .backup(&BackupRequest {
                    resource,
                    hostname_backup_name: name,
                    policy: config.backup.policy(),
                    timestamp: None,
                })
                .await?;
            serde_json::to_string_pretty(&outcome)?
        }
        Command::Restore {
            destination,
            date,
            overwrite,
        } => {
            let restore_from_date = date.as_deref().map(parse_timestamp).transpose()?;
            let result = executor
                .restore(&RestoreRequest {
                    hostname_backup_name: name,
                    destination,
                    restore_from_date,
                    overwrite,
                })
                .await?;
            serde_json::to_string_pretty(&result)?
        }
        Command::Info { date } => {
            let date = date.as_deref().map(parse_timestamp).transpose()?;
            serde_json::to_string_pretty(&executor.info(&name, date).await?)?
        }
        Command::RemoveOlderThan { days } => {
            let cutoff = days_before(now_timestamp(), days);
            serde_json::to_string_pretty(&executor.remove_older_than(&name, cutoff).await?)?
        }
    };
    println!("{}", result);

    signal_handle.abort();
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = run(args).await {
        let code = e
            .chain()
            .find_map(|cause| cause.downcast_ref::<AgentError>())
            .map_or(EXIT_FAILED, AgentError::exit_code);
        eprintln!("Error: {:#}", e);
        std::process::exit(code);
    }
}
