//! pharmacache - keeps nearby pharmacy results and map tiles available
//! when the network is not.
//!
//! Runs the engine around a location until Ctrl-C: pharmacy results are
//! fetched and cached, tiles are prefetched, and a loopback tile origin
//! serves the cached tiles while offline.

use std::io;
use std::path::Path;

use anyhow::{bail, Context, Result};
use pharmacache_core::cache::{CacheManager, CachePolicy};
use pharmacache_core::loader::{LoadStatus, LoadUpdate};
use pharmacache_core::models::UserLocation;
use pharmacache_core::tiles::TileStore;
use pharmacache_core::{Config, Engine};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// How many of the nearest results to print after each load
const PRINT_LIMIT: usize = 5;

const LOG_FILE_PREFIX: &str = "pharmacache";

const USAGE: &str = "\
Usage: pharmacache [LAT LON]
       pharmacache --stats
       pharmacache --clear-cache

Without coordinates the last known location (or the configured default) is used.";

enum Command {
    Run(Option<(f64, f64)>),
    Stats,
    ClearCache,
    Help,
}

fn parse_args(args: &[String]) -> Result<Command> {
    match args {
        [] => Ok(Command::Run(None)),
        [flag] if flag == "--stats" => Ok(Command::Stats),
        [flag] if flag == "--clear-cache" => Ok(Command::ClearCache),
        [flag] if flag == "--help" || flag == "-h" => Ok(Command::Help),
        [lat, lon] => {
            let lat: f64 = lat.parse().with_context(|| format!("Invalid latitude: {}", lat))?;
            let lon: f64 = lon.parse().with_context(|| format!("Invalid longitude: {}", lon))?;
            Ok(Command::Run(Some((lat, lon))))
        }
        _ => bail!("Unrecognised arguments\n\n{}", USAGE),
    }
}

/// Initialize the tracing subscriber: stderr plus a daily log file.
///
/// The returned guard must stay alive for file output to be flushed.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let appender = log_dir.and_then(|dir| {
        RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(LOG_FILE_PREFIX)
            .filename_suffix("log")
            .build(dir)
            .map_err(|e| eprintln!("Log file disabled: {}", e))
            .ok()
    });
    let (file_layer, guard) = match appender {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_args(&args)?;
    if let Command::Help = command {
        println!("{}", USAGE);
        return Ok(());
    }

    let config = Config::load()?;
    let _log_guard = init_tracing(config.log_dir().ok().as_deref());

    match command {
        Command::Stats => print_stats(&config),
        Command::ClearCache => clear_cache(&config),
        Command::Run(location) => run(config, location).await,
        Command::Help => Ok(()),
    }
}

async fn run(config: Config, location: Option<(f64, f64)>) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "pharmacache starting");

    let (engine, updates) = Engine::start(config).await?;
    let reporter = tokio::spawn(report_updates(updates));

    let location = match location {
        Some((lat, lon)) => UserLocation::new(lat, lon)?,
        None => engine.initial_location(),
    };
    engine.on_user_location(&location);
    info!(tiles = %engine.tile_url_template(), "Map tile source");

    let (_, mut events) = engine.connectivity().subscribe();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => info!(?event, tiles = %engine.tile_url_template(), "Connectivity changed"),
                None => break,
            },
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "Failed to listen for Ctrl-C");
                }
                info!("Shutdown signal received");
                break;
            }
        }
    }

    engine.shutdown().await;
    reporter.abort();
    info!("pharmacache stopped");
    Ok(())
}

async fn report_updates(mut updates: mpsc::UnboundedReceiver<LoadUpdate>) {
    while let Some(update) = updates.recv().await {
        match update.status {
            LoadStatus::Loading => info!(key = %update.key, "Loading pharmacies"),
            LoadStatus::Retrying { attempt, max_attempts } => {
                info!(key = %update.key, attempt, max_attempts, "Still loading, retrying")
            }
            LoadStatus::Success { records, source } => {
                info!(key = %update.key, count = records.len(), ?source, "Pharmacies loaded");
                for record in records.iter().take(PRINT_LIMIT) {
                    println!(
                        "{:>9}  {}{}",
                        record.formatted_distance(),
                        record.name,
                        record.address.as_deref().map(|a| format!(" - {}", a)).unwrap_or_default()
                    );
                }
            }
            LoadStatus::OfflineMiss => warn!(key = %update.key, "Offline and no cached pharmacies for this area"),
            LoadStatus::Exhausted { message, .. } => warn!(key = %update.key, "{}", message),
        }
    }
}

fn print_stats(config: &Config) -> Result<()> {
    let cache = CacheManager::new(config.cache_dir()?, CachePolicy::from(config));
    let tiles = TileStore::from_config(config)?;
    println!("Cache:  {}", cache.stats());
    println!(
        "Tiles:  {} files, {:.1} MB",
        tiles.cached_tile_count(),
        tiles.cache_size_bytes() as f64 / (1024.0 * 1024.0)
    );
    Ok(())
}

fn clear_cache(config: &Config) -> Result<()> {
    let cache = CacheManager::new(config.cache_dir()?, CachePolicy::from(config));
    let tiles = TileStore::from_config(config)?;
    cache.clear_all();
    tiles.clear_cache();
    println!("Cache cleared");
    Ok(())
}
