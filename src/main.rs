//! Origin connection pool daemon.
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌──────────────────────────────────────────────────────┐
//!                 │                  ORIGIN POOL                         │
//!                 │                                                      │
//!  request layer  │  ┌─────────┐   ┌──────────────┐   ┌──────────────┐   │
//!  ───────────────┼─▶│ manager │──▶│load_balancer │──▶│ server pool  │───┼──▶ origin
//!  acquire/release│  └────┬────┘   └──────────────┘   │ (per worker) │   │    servers
//!                 │       │                           └──────────────┘   │
//!                 │       ▼                                              │
//!                 │  ┌─────────┐   ┌──────────────┐                      │
//!                 │  │  close  │◀──│   expiry     │                      │
//!                 │  │ h1 / h2 │   │   policy     │                      │
//!                 │  └─────────┘   └──────────────┘                      │
//!                 │                                                      │
//!                 │  config (hot reload) · observability · admin API     │
//!                 │  lifecycle (signals, drain) · worker reactors        │
//!                 └──────────────────────────────────────────────────────┘
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use origin_pool::admin::{serve_admin, AdminState};
use origin_pool::config::{load_config, watcher::ConfigWatcher, ProxyConfig};
use origin_pool::lifecycle::{drain_origins, spawn_signal_handler, Shutdown};
use origin_pool::net::{TcpConnector, WorkerGroup};
use origin_pool::observability::{logging, metrics::init_metrics};
use origin_pool::pool::OriginRegistry;

const GAUGE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "origin-pool", version, about = "Origin connection pool daemon")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seconds to wait for checked-out connections on shutdown.
    #[arg(long, default_value_t = 30)]
    drain_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match args.config.as_deref() {
        Some(path) => match load_config(path) {
            Ok(config) => config,
            Err(e) => {
                logging::init("info");
                tracing::error!(path = ?path, error = %e, "Failed to load configuration");
                return Err(e.into());
            }
        },
        None => ProxyConfig::default(),
    };

    logging::init(&config.observability.log_level);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        origins = config.origins.len(),
        "origin-pool starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let workers = WorkerGroup::start(config.workers.count)?;
    let registry = Arc::new(OriginRegistry::new(
        &config,
        Arc::new(TcpConnector::new()),
        workers.len(),
    ));

    let prewarm = registry.prewarm(&workers);
    if !prewarm.is_empty() {
        tokio::spawn(async move {
            let mut parked = 0;
            for task in prewarm {
                parked += task.await.unwrap_or(0);
            }
            tracing::info!(parked, "Prewarm complete");
        });
    }

    let shutdown = Arc::new(Shutdown::new());

    // Hot reload: file changes and SIGHUP both feed the same channel.
    let mut _file_watcher = None;
    let reload = match args.config.as_deref() {
        Some(path) => {
            let (watcher, mut updates) = ConfigWatcher::new(path);
            let trigger = watcher.reload_trigger();
            match watcher.run() {
                Ok(w) => _file_watcher = Some(w),
                Err(e) => tracing::warn!(error = %e, "Config file watching disabled"),
            }
            let registry = Arc::clone(&registry);
            let worker_count = workers.len();
            tokio::spawn(async move {
                while let Some(next) = updates.recv().await {
                    if next.workers.count != worker_count {
                        tracing::warn!(
                            current = worker_count,
                            requested = next.workers.count,
                            "Worker count changes need a restart"
                        );
                    }
                    registry.apply_reload(&next);
                }
            });
            Some(trigger)
        }
        None => None,
    };
    spawn_signal_handler(Arc::clone(&shutdown), reload)?;

    {
        let registry = Arc::clone(&registry);
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(GAUGE_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => registry.publish_gauges(),
                    _ = shutdown.wait() => break,
                }
            }
        });
    }

    if config.admin.enabled {
        let listener = TcpListener::bind(&config.admin.bind_address).await?;
        let state = AdminState::new(Arc::clone(&registry), &config.admin.api_key);
        let stop = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if let Err(e) = serve_admin(listener, state, async move { stop.wait().await }).await {
                tracing::error!(error = %e, "Admin API stopped");
            }
        });
    }

    shutdown.wait().await;
    drain_origins(&registry, Duration::from_secs(args.drain_timeout_secs)).await;

    tokio::task::spawn_blocking(move || workers.shutdown()).await?;
    tracing::info!("Shutdown complete");
    Ok(())
}
