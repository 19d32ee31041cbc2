//! Logical replication ingest: protocol framing and pgoutput decoding.

pub mod pgoutput;
pub mod reader;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use posduif_shared::Lsn;

pub use reader::{WalReader, WalReaderConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalOp {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for WalOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            WalOp::Insert => "INSERT",
            WalOp::Update => "UPDATE",
            WalOp::Delete => "DELETE",
        })
    }
}

/// One decoded row-level event from the change stream.
///
/// `columns` is the new row image; `old_columns` is the pre-image and is
/// only populated for updates (and deletes, which the tracker drops).
/// Values are the text form pgoutput ships, wrapped as JSON strings; typing
/// happens at the point of use.
#[derive(Debug, Clone)]
pub struct WalChange {
    pub lsn: Lsn,
    pub schema: String,
    pub table: String,
    pub op: WalOp,
    pub columns: HashMap<String, Value>,
    pub old_columns: HashMap<String, Value>,
    pub commit_time: DateTime<Utc>,
}

impl WalChange {
    /// A column's text value, if present and textual.
    pub fn column_str(&self, name: &str) -> Option<&str> {
        self.columns.get(name).and_then(Value::as_str)
    }

    /// Same, for the pre-image.
    pub fn old_column_str(&self, name: &str) -> Option<&str> {
        self.old_columns.get(name).and_then(Value::as_str)
    }
}
