//! Gzip helpers for sync payloads.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::ServerError;

pub fn compress(data: &[u8]) -> Result<Vec<u8>, ServerError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| ServerError::Internal(format!("gzip compression failed: {e}")))
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, ServerError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| ServerError::Validation(format!("invalid gzip body: {e}")))?;
    Ok(out)
}

/// Only payloads past the configured threshold are worth the CPU.
pub fn should_compress(len: usize, threshold: usize) -> bool {
    len > threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let data = b"the same ten bytes, over and over and over".repeat(50);
        let compressed = compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn rejects_garbage() {
        assert!(decompress(b"definitely not gzip").is_err());
    }

    #[test]
    fn threshold_check() {
        assert!(!should_compress(10, 1024));
        assert!(should_compress(2048, 1024));
    }
}
