use anyhow::Result;
use clap::Parser;
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

use chatwatch::store::DatabaseConfig;
use chatwatch::{MemoryStore, MessageStore, Monitor, MonitorConfig, PgStore, RuleEngine, Source, ingest};

#[derive(Parser)]
#[command(name = "chatwatch")]
#[command(about = "Watch chat surfaces for keywords and notify on matches")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "chatwatch.toml")]
    config: PathBuf,

    /// Read database settings from DB_* environment variables
    #[arg(long)]
    db_from_env: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

async fn open_store(config: &MonitorConfig, from_env: bool) -> Arc<dyn MessageStore> {
    let db_config = if from_env {
        Some(DatabaseConfig::from_env())
    } else {
        config.database.clone()
    };
    let Some(db_config) = db_config else {
        info!("No database configured, keeping messages in memory");
        return Arc::new(MemoryStore::new());
    };

    let store = match PgStore::connect(&db_config).await {
        Ok(store) => store,
        Err(e) => {
            warn!("Database unavailable ({}), falling back to in-memory store", e);
            return Arc::new(MemoryStore::new());
        }
    };
    match store.test_connection().await {
        Ok(true) => {}
        Ok(false) => {
            warn!("Database connection check returned an unexpected value, falling back to in-memory store");
            return Arc::new(MemoryStore::new());
        }
        Err(e) => {
            warn!("Database connection check failed ({}), falling back to in-memory store", e);
            return Arc::new(MemoryStore::new());
        }
    }
    if let Err(e) = store.initialize_schema().await {
        warn!("Schema initialisation failed ({}), falling back to in-memory store", e);
        return Arc::new(MemoryStore::new());
    }
    Arc::new(store)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    info!("🚀 Starting chatwatch");
    info!("Configuration: {:?}", args.config);

    let config = match MonitorConfig::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("❌ Invalid configuration: {}", e);
            return Err(e.into());
        }
    };

    let store = open_store(&config, args.db_from_env).await;
    let engine = Arc::new(RuleEngine::from_settings(&config.notification));
    let mut monitor = Monitor::new(config.clone(), store, engine);

    for source_config in &config.sources {
        let source = Source::from_config(source_config, config.monitor.poll_timeout())?;
        monitor.add_source(source)?;
        if !source_config.enabled() {
            monitor.set_source_enabled(source_config.name(), false);
        }
    }

    monitor.start().await?;
    let handle = monitor.handle();

    let (server_stop, mut server_stopped) = watch::channel(false);
    let server = if config.server.enabled {
        let bind = config.server.bind.clone();
        let server_handle = handle.clone();
        Some(tokio::spawn(async move {
            let shutdown = async move {
                let _ = server_stopped.changed().await;
            };
            if let Err(e) = ingest::serve(&bind, server_handle, shutdown).await {
                error!("Ingest server error: {}", e);
            }
        }))
    } else {
        None
    };

    wait_for_shutdown(&monitor, &args.config).await;

    info!("Shutting down...");
    server_stop.send_replace(true);
    monitor.stop().await;
    if let Some(server) = server {
        if let Err(e) = server.await {
            error!("Ingest server task failed: {}", e);
        }
    }

    let stats = handle.stats();
    info!(
        "✅ Stopped. {} candidates, {} emitted, {} matched, {} persisted",
        stats.candidates, stats.emitted, stats.matched, stats.persisted
    );
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown(monitor: &Monitor, config_path: &Path) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!("Cannot listen for SIGHUP ({}), config reload disabled", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return,
            _ = hangup.recv() => {
                info!("SIGHUP received, reloading {:?}", config_path);
                if let Err(e) = monitor.reload_config(config_path).await {
                    error!("❌ Config reload failed: {}", e);
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_monitor: &Monitor, _config_path: &Path) {
    let _ = tokio::signal::ctrl_c().await;
}
