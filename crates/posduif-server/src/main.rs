mod api;
mod auth;
mod compression;
mod config;
mod error;
mod events;
mod handlers;
mod sse;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use posduif_store::{SlotManager, Store};
use posduif_sync::{ChangeTracker, SyncManager, SyncStore, WalService, WalServiceConfig};

use crate::api::AppState;
use crate::auth::AuthKeys;
use crate::config::Config;
use crate::events::Publisher;

/// How long in-flight requests get after the shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = parse_config_path();
    let config = Config::load(&config_path)?;
    init_tracing(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path,
        "starting posduif sync engine"
    );

    let store = Arc::new(Store::connect(config.postgres.store_config()).await?);
    let publisher = Publisher::connect(&config.redis).await?;

    let sync_store: Arc<dyn SyncStore> = store.clone();
    let tracker = Arc::new(ChangeTracker::new(sync_store.clone()));

    let wal_enabled = config.sync.wal.enabled;
    let wal_service = if wal_enabled {
        let slot_manager = SlotManager::new(store.pool().clone(), store.database_name());
        let service = WalService::start(
            slot_manager,
            tracker.clone(),
            WalServiceConfig {
                conninfo: store.config().replication_conninfo(),
                slot_name: (!config.sync.wal.slot_name.is_empty())
                    .then(|| config.sync.wal.slot_name.clone()),
                read_interval: config.sync.wal.read_interval(),
                channel_capacity: config.sync.wal.batch_size,
            },
        )
        .await?;
        info!(slot = %service.slot_name(), "WAL sync enabled");
        Some(service)
    } else {
        info!("WAL sync disabled; devices fall back to the polling path");
        None
    };

    let manager = Arc::new(SyncManager::new(sync_store, tracker, wal_enabled));
    let auth = AuthKeys::new(&config.auth.jwt_secret, config.auth.jwt_expiration);
    let config = Arc::new(config);

    let state = AppState {
        store: store.clone(),
        manager,
        publisher,
        auth,
        config: config.clone(),
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.sse.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "listening");

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let mut graceful = shutdown_rx.clone();
    let app = api::build_router(state);
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = graceful.changed().await;
            })
            .await
    });

    tokio::select! {
        _ = shutdown_rx.changed() => {
            info!("shutdown signal received; draining in-flight requests");
            match tokio::time::timeout(DRAIN_TIMEOUT, &mut server).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => tracing::error!(error = %e, "HTTP server error during drain"),
                Ok(Err(e)) => tracing::error!(error = %e, "HTTP server task failed"),
                Err(_) => {
                    tracing::warn!("drain timed out; abandoning open connections");
                    server.abort();
                }
            }
        }
        result = &mut server => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "HTTP server exited with error"),
                Err(e) => tracing::error!(error = %e, "HTTP server task failed"),
            }
        }
    }

    // The WAL service goes down last: closing the replication socket
    // releases the slot.
    if let Some(service) = wal_service {
        service.stop().await;
    }
    store.close().await;

    info!("shutdown complete");
    Ok(())
}

fn parse_config_path() -> String {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return path;
            }
        } else if let Some(path) = arg.strip_prefix("--config=") {
            return path.to_string();
        }
    }
    "config/config.yaml".to_string()
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.format == "pretty" {
        builder.pretty().init();
    } else {
        builder.compact().init();
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
