//! CLI binary that exports a RocksDB-backed key-value store to a RESP server.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_pub_crate)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kvport_migrator::{
    Consistency, Dispatcher, MigrateError, MigrationConfig, MigrationCounter, Outcome,
    RoutingPolicy, migrate_all, parse_types,
};
use kvport_sender::{SenderError, TcpSender};
use kvport_source::SourceError;
use kvport_source_rocksdb::{RocksDbSource, RocksDbSourceConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// CLI-specific error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration file could not be read or parsed
    #[error("config file {path}: {reason}")]
    ConfigFile {
        /// Path of the file
        path: PathBuf,
        /// What went wrong
        reason: String,
    },

    /// One or more data types did not finish
    #[error("{0} data type migrations failed")]
    Failed(usize),

    /// Migration setup error
    #[error(transparent)]
    Migrate(#[from] MigrateError),

    /// Destination connection error
    #[error(transparent)]
    Sender(#[from] SenderError),

    /// Source database error
    #[error(transparent)]
    Source(#[from] SourceError),
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path of the RocksDB database to export
    #[arg(long, env = "KVPORT_SOURCE_PATH")]
    source_path: PathBuf,

    /// Destination server address
    #[arg(long, default_value = "127.0.0.1:6379", env = "KVPORT_DESTINATION")]
    destination: String,

    /// Number of parallel connections to the destination
    #[arg(long, default_value_t = 4, env = "KVPORT_SENDERS")]
    senders: usize,

    /// Commands buffered per connection before enqueueing waits
    #[arg(long, default_value_t = 1024, env = "KVPORT_QUEUE_DEPTH")]
    queue_depth: usize,

    /// Data types to migrate
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "strings,lists,hashes,sets,zsets",
        env = "KVPORT_TYPES"
    )]
    types: Vec<String>,

    /// TOML file with migration settings; flags take precedence
    #[arg(long, env = "KVPORT_CONFIG")]
    config: Option<PathBuf>,

    /// Elements per fetch window and per command
    #[arg(long, env = "KVPORT_SYNC_BATCH_NUM")]
    sync_batch_num: Option<usize>,

    /// Routing policy: by-key, lists-only or round-robin
    #[arg(long, env = "KVPORT_ROUTING")]
    routing: Option<RoutingPolicy>,

    /// View strings are read from: snapshot or live
    #[arg(long, env = "KVPORT_STRING_CONSISTENCY")]
    string_consistency: Option<Consistency>,

    /// Consecutive scan failures tolerated at one position
    #[arg(long, env = "KVPORT_MAX_SCAN_RETRIES")]
    max_scan_retries: Option<u32>,

    /// Seconds between progress log lines
    #[arg(long, default_value_t = 5, env = "KVPORT_PROGRESS_INTERVAL")]
    progress_interval: u64,
}

fn load_config(path: &Path) -> Result<MigrationConfig, Error> {
    let raw = std::fs::read_to_string(path).map_err(|e| Error::ConfigFile {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    toml::from_str(&raw).map_err(|e| Error::ConfigFile {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn migration_config(args: &Args) -> Result<MigrationConfig, Error> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => MigrationConfig::default(),
    };

    if let Some(unit) = args.sync_batch_num {
        config.sync_batch_num = unit;
    }
    if let Some(routing) = args.routing {
        config.routing = routing;
    }
    if let Some(consistency) = args.string_consistency {
        config.string_consistency = consistency;
    }
    if let Some(retries) = args.max_scan_retries {
        config.max_scan_retries = retries;
    }

    config.validate()?;
    Ok(config)
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT"),
            }
        }
        _ => {
            warn!("Failed to install signal handlers, falling back to ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
            info!("Received interrupt signal");
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received interrupt signal");
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = migration_config(&args)?;
    let types = match parse_types(&args.types) {
        Ok(types) => types,
        Err(e) => {
            error!("Refusing to start: {}", e);
            return Err(e.into());
        }
    };

    let source =
        RocksDbSource::open_with_config(&RocksDbSourceConfig::new(&args.source_path).read_only())?;
    info!("Opened source database at {}", args.source_path.display());

    let mut senders = Vec::with_capacity(args.senders);
    for id in 0..args.senders {
        senders.push(TcpSender::connect(id, args.destination.as_str(), args.queue_depth).await?);
    }
    let dispatcher = Arc::new(Dispatcher::new(senders)?);

    let shutdown_token = CancellationToken::new();
    let signal_shutdown_token = shutdown_token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Cancelling migration");
        signal_shutdown_token.cancel();
    });

    let counter = MigrationCounter::new();
    let progress_done = CancellationToken::new();
    let progress = tokio::spawn({
        let counter = counter.clone();
        let done = progress_done.clone();
        let period = Duration::from_secs(args.progress_interval.max(1));
        async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    () = done.cancelled() => break,
                    _ = interval.tick() => info!("{} commands dispatched", counter.get()),
                }
            }
        }
    });

    let results = migrate_all(
        source,
        Arc::clone(&dispatcher),
        config,
        &types,
        counter.clone(),
        shutdown_token,
    )
    .await;

    progress_done.cancel();
    let _ = progress.await;
    dispatcher.close_all().await;
    for sender in dispatcher.senders() {
        info!(
            "Sender {}: {} commands, {} bytes written, {} reply bytes read",
            sender.id(),
            sender.commands_written(),
            sender.bytes_written(),
            sender.reply_bytes()
        );
    }

    let mut failed = 0;
    for (data_type, result) in results? {
        match result {
            Ok(report) if report.outcome == Outcome::Completed => info!(
                "{}: {} keys migrated, {} expired, {} failed, {} commands",
                data_type,
                report.keys_migrated,
                report.keys_expired,
                report.keys_failed,
                report.commands_dispatched
            ),
            Ok(report) => warn!(
                "{}: cancelled after {} keys, {} commands",
                data_type,
                report.keys_seen(),
                report.commands_dispatched
            ),
            Err(e) => {
                error!("{}: {}", data_type, e);
                failed += 1;
            }
        }
    }
    info!("{} commands dispatched in total", counter.get());

    if failed > 0 {
        return Err(Error::Failed(failed));
    }
    Ok(())
}
