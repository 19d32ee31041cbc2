use thiserror::Error;

use crate::wal::pgoutput::DecodeError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("store error: {0}")]
    Store(#[from] posduif_store::StoreError),

    #[error("replication connection error: {0}")]
    Replication(#[from] tokio_postgres::Error),

    #[error("replication stream ended unexpectedly")]
    StreamEnded,

    #[error("change pipeline closed")]
    PipelineClosed,

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
}

pub type Result<T> = std::result::Result<T, SyncError>;
