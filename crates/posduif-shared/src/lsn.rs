//! PostgreSQL log sequence numbers.
//!
//! An [`Lsn`] is a 64-bit position in the write-ahead log. Its canonical
//! textual form is `H/LLLLLLLL`: the high 32 bits in upper-case hex without
//! padding, a slash, and the low 32 bits zero-padded to eight hex digits.
//! That is the form PostgreSQL itself prints and the form persisted in
//! `sync_metadata.last_synced_lsn`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LsnParseError {
    #[error("invalid LSN format: {0:?}")]
    Format(String),

    #[error("invalid LSN high half: {0:?}")]
    HighHalf(String),

    #[error("invalid LSN low half: {0:?}")]
    LowHalf(String),
}

impl Lsn {
    pub fn new(high: u32, low: u32) -> Self {
        Self(((high as u64) << 32) | low as u64)
    }

    pub fn high(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn low(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:08X}", self.high(), self.low())
    }
}

impl FromStr for Lsn {
    type Err = LsnParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (high, low) = s
            .split_once('/')
            .ok_or_else(|| LsnParseError::Format(s.to_string()))?;
        if low.contains('/') {
            return Err(LsnParseError::Format(s.to_string()));
        }

        let high = u32::from_str_radix(high, 16)
            .map_err(|_| LsnParseError::HighHalf(high.to_string()))?;
        let low =
            u32::from_str_radix(low, 16).map_err(|_| LsnParseError::LowHalf(low.to_string()))?;

        Ok(Self::new(high, low))
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Lsn> for u64 {
    fn from(lsn: Lsn) -> Self {
        lsn.0
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
