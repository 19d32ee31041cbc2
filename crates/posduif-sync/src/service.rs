//! Background WAL service.
//!
//! Owns the reader's lifecycle: creates the slot and publication, seeds the
//! start LSN from the slot's confirmed position, runs the reader, and
//! dispatches decoded changes into the tracker one at a time. The dispatch
//! loop is the tracker's single writer. Transient failures reconnect with
//! exponential backoff; a shutdown signal stops everything.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use posduif_store::{SlotManager, PUBLICATION_NAME};

use crate::error::Result;
use crate::tracker::ChangeTracker;
use crate::wal::{WalReader, WalReaderConfig};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// A reader that survives this long before failing is considered to have
/// been healthy; the backoff resets.
const HEALTHY_RUN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct WalServiceConfig {
    /// Conninfo for the replication connection (`replication=database`).
    pub conninfo: String,
    /// Explicit slot name; empty or absent derives one from the tenant
    /// database name.
    pub slot_name: Option<String>,
    /// Delay floor between reconnect attempts.
    pub read_interval: Duration,
    /// Capacity of the reader-to-tracker channel.
    pub channel_capacity: usize,
}

pub struct WalService {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
    slot_name: String,
}

impl WalService {
    /// Create slot and publication, then start the ingest task.
    pub async fn start(
        slot_manager: SlotManager,
        tracker: Arc<ChangeTracker>,
        config: WalServiceConfig,
    ) -> Result<Self> {
        let slot_name = match config.slot_name.as_deref() {
            Some(name) if !name.is_empty() => {
                slot_manager.create_slot_named(name).await?
            }
            _ => slot_manager.create_slot().await?,
        };
        slot_manager.ensure_publication().await?;

        tracing::info!(slot = %slot_name, "WAL service starting");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_loop(
            slot_manager,
            tracker,
            config,
            slot_name.clone(),
            shutdown_rx,
        ));

        Ok(Self {
            shutdown: shutdown_tx,
            handle,
            slot_name,
        })
    }

    pub fn slot_name(&self) -> &str {
        &self.slot_name
    }

    /// Signal shutdown and wait for the ingest task to finish. The reader
    /// closes the replication socket, which releases the slot.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if self.handle.await.is_err() {
            tracing::error!("WAL service task panicked during shutdown");
        }
    }
}

async fn run_loop(
    slot_manager: SlotManager,
    tracker: Arc<ChangeTracker>,
    config: WalServiceConfig,
    slot_name: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let base_delay = config.read_interval.max(Duration::from_millis(100));
    let mut backoff = base_delay;

    loop {
        if *shutdown.borrow_and_update() {
            break;
        }

        let start_lsn = match slot_manager.start_lsn(&slot_name).await {
            Ok(lsn) => lsn,
            Err(e) => {
                tracing::warn!(error = %e, "could not determine start LSN; retrying");
                if sleep_or_shutdown(backoff, &mut shutdown).await {
                    break;
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };

        let (tx, mut rx) = mpsc::channel(config.channel_capacity.max(1));
        let mut reader = WalReader::new(WalReaderConfig {
            conninfo: config.conninfo.clone(),
            slot_name: slot_name.clone(),
            publication: PUBLICATION_NAME.to_string(),
        });
        let mut reader_shutdown = shutdown.clone();
        let started = Instant::now();

        let reader_task =
            tokio::spawn(
                async move { reader.run(start_lsn, &tx, &mut reader_shutdown).await },
            );

        // Serial dispatch: this loop is the only writer into the tracker.
        while let Some(change) = rx.recv().await {
            if let Err(e) = tracker.add_change(change).await {
                tracing::warn!(error = %e, "failed to track change");
            }
        }

        match reader_task.await {
            Ok(Ok(())) => break,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "WAL reader stopped; will reconnect");
            }
            Err(e) => {
                tracing::error!(error = %e, "WAL reader task panicked; will reconnect");
            }
        }

        if *shutdown.borrow() {
            break;
        }
        if started.elapsed() >= HEALTHY_RUN {
            backoff = base_delay;
        }
        if sleep_or_shutdown(backoff, &mut shutdown).await {
            break;
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }

    tracing::info!(slot = %slot_name, "WAL service stopped");
}

/// Sleep, but wake early on shutdown. Returns true when shutting down.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => *shutdown.borrow(),
        _ = shutdown.changed() => true,
    }
}
