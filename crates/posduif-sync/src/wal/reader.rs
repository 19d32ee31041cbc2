//! Replication-protocol reader.
//!
//! Owns the one long-lived replication connection, speaks the CopyBoth
//! framing on top of it, and turns WAL-data frames into [`WalChange`]s in
//! commit order. The reader is restartable: it is handed a start LSN at or
//! below the slot's `restart_lsn` and resumes from there.

use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_postgres::NoTls;

use posduif_shared::Lsn;

use super::pgoutput::PgOutputDecoder;
use super::WalChange;
use crate::error::{Result, SyncError};

/// How often a standby status update goes out even without a keepalive
/// asking for one. Keeps the slot's confirmed position fresh.
const STATUS_UPDATE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct WalReaderConfig {
    /// libpq-style conninfo carrying `replication=database`.
    pub conninfo: String,
    pub slot_name: String,
    pub publication: String,
}

pub struct WalReader {
    config: WalReaderConfig,
    decoder: PgOutputDecoder,
    confirmed: Lsn,
}

impl WalReader {
    pub fn new(config: WalReaderConfig) -> Self {
        Self {
            config,
            decoder: PgOutputDecoder::new(),
            confirmed: Lsn(0),
        }
    }

    /// The highest LSN acknowledged back to the server.
    pub fn confirmed_lsn(&self) -> Lsn {
        self.confirmed
    }

    /// Stream changes into `tx` until shutdown or a transport error.
    ///
    /// Every suspension point honors `shutdown`: waiting for frames,
    /// waiting to deliver downstream, and waiting to write a status
    /// update. On transport errors the caller reconnects and calls `run`
    /// again with the last confirmed LSN.
    pub async fn run(
        &mut self,
        start_lsn: Lsn,
        tx: &mpsc::Sender<WalChange>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (client, connection) =
            tokio_postgres::connect(&self.config.conninfo, NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(error = %e, "replication connection closed");
            }
        });

        let query = format!(
            "START_REPLICATION SLOT {} LOGICAL {} (proto_version '1', publication_names '{}')",
            self.config.slot_name, start_lsn, self.config.publication,
        );
        tracing::info!(
            slot = %self.config.slot_name,
            start_lsn = %start_lsn,
            "starting logical replication"
        );

        let duplex = client.copy_both_simple::<Bytes>(&query).await?;
        futures_util::pin_mut!(duplex);

        self.confirmed = start_lsn;
        let mut status_tick = tokio::time::interval(STATUS_UPDATE_INTERVAL);
        status_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow_and_update() {
                let _ = duplex.send(standby_status_update(self.confirmed)).await;
                return Ok(());
            }

            enum Step {
                Shutdown,
                Tick,
                Frame(Option<std::result::Result<Bytes, tokio_postgres::Error>>),
            }

            let step = tokio::select! {
                biased;
                _ = shutdown.changed() => Step::Shutdown,
                frame = duplex.next() => Step::Frame(frame),
                _ = status_tick.tick() => Step::Tick,
            };

            match step {
                Step::Shutdown => {
                    let _ = duplex.send(standby_status_update(self.confirmed)).await;
                    return Ok(());
                }
                Step::Tick => {
                    duplex.send(standby_status_update(self.confirmed)).await?;
                }
                Step::Frame(None) => return Err(SyncError::StreamEnded),
                Step::Frame(Some(Err(e))) => return Err(e.into()),
                Step::Frame(Some(Ok(frame))) => {
                    if frame.is_empty() {
                        continue;
                    }
                    match frame[0] {
                        b'w' => {
                            if let Some(change) = self.handle_wal_data(&frame[1..]) {
                                tokio::select! {
                                    res = tx.send(change) => {
                                        res.map_err(|_| SyncError::PipelineClosed)?;
                                    }
                                    _ = shutdown.changed() => return Ok(()),
                                }
                            }
                        }
                        b'k' => {
                            if let Some(keepalive) = parse_keepalive(&frame[1..]) {
                                self.confirmed = self.confirmed.max(keepalive.server_lsn);
                                if keepalive.reply_requested {
                                    duplex
                                        .send(standby_status_update(self.confirmed))
                                        .await?;
                                }
                            }
                        }
                        other => {
                            tracing::trace!(tag = %(other as char), "ignoring replication frame");
                        }
                    }
                }
            }
        }
    }

    /// Decode one WAL-data payload. Parse failures are logged and skipped;
    /// they must not take the stream down.
    fn handle_wal_data(&mut self, payload: &[u8]) -> Option<WalChange> {
        let header = parse_wal_header(payload)?;
        let message = &payload[WAL_HEADER_LEN..];

        let change = match self
            .decoder
            .decode(header.lsn, header.commit_time, message)
        {
            Ok(change) => change,
            Err(e) => {
                tracing::warn!(lsn = %header.lsn, error = %e, "skipping undecodable WAL frame");
                None
            }
        };

        self.confirmed = self.confirmed.max(header.lsn);
        change
    }
}

/// WAL-data payload header: frame LSN, commit timestamp, transaction id.
const WAL_HEADER_LEN: usize = 8 + 8 + 4;

#[derive(Debug, PartialEq, Eq)]
struct WalHeader {
    lsn: Lsn,
    commit_time: DateTime<Utc>,
    #[allow(dead_code)]
    xid: u32,
}

fn parse_wal_header(payload: &[u8]) -> Option<WalHeader> {
    if payload.len() < WAL_HEADER_LEN {
        return None;
    }
    let lsn = Lsn(u64::from_be_bytes(payload[0..8].try_into().ok()?));
    let micros = i64::from_be_bytes(payload[8..16].try_into().ok()?);
    let xid = u32::from_be_bytes(payload[16..20].try_into().ok()?);
    Some(WalHeader {
        lsn,
        commit_time: pg_epoch() + ChronoDuration::microseconds(micros),
        xid,
    })
}

#[derive(Debug, PartialEq, Eq)]
struct Keepalive {
    server_lsn: Lsn,
    reply_requested: bool,
}

fn parse_keepalive(payload: &[u8]) -> Option<Keepalive> {
    if payload.len() < 17 {
        return None;
    }
    let server_lsn = Lsn(u64::from_be_bytes(payload[0..8].try_into().ok()?));
    let reply_requested = payload[16] == 1;
    Some(Keepalive {
        server_lsn,
        reply_requested,
    })
}

/// Build a standby status update (`'r'`): write/flush/apply LSN plus a
/// microsecond timestamp relative to the PostgreSQL epoch.
fn standby_status_update(confirmed: Lsn) -> Bytes {
    let mut buf = Vec::with_capacity(34);
    buf.push(b'r');
    buf.extend_from_slice(&confirmed.0.to_be_bytes()); // write
    buf.extend_from_slice(&confirmed.0.to_be_bytes()); // flush
    buf.extend_from_slice(&confirmed.0.to_be_bytes()); // apply
    buf.extend_from_slice(&micros_since_pg_epoch(Utc::now()).to_be_bytes());
    buf.push(0); // no reply requested
    Bytes::from(buf)
}

/// 2000-01-01 00:00:00 UTC, the replication protocol's timestamp origin.
fn pg_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap()
}

fn micros_since_pg_epoch(at: DateTime<Utc>) -> i64 {
    (at - pg_epoch()).num_microseconds().unwrap_or(i64::MAX)
}
