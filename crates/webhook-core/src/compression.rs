//! Optional payload compression above a size threshold (spec.md §4.4, C4).
//!
//! GZIP is the only algorithm implemented; LZ4 and ZSTD are declared in the
//! wire model (`CompressionAlgorithm`) but spec.md §9 explicitly permits a
//! GZIP-only implementation as a conforming minimum, so `decompress` is
//! exhaustive over the enum but the other two variants are unreachable in
//! practice until a real implementation lands.

use crate::model::CompressionAlgorithm;
use anyhow::{Context, Result, bail};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};

pub struct Compressor {
    pub min_size: usize,
}

impl Compressor {
    pub fn new(min_size: usize) -> Self {
        Self { min_size }
    }

    /// Compresses `payload_bytes` if it meets the size threshold. Returns
    /// `None` when the payload is too small to bother — in that case the
    /// envelope's `compressed` flag stays `false` (spec.md §8 invariant).
    pub fn compress_if_needed(
        &self,
        payload_bytes: &[u8],
    ) -> Result<Option<(Vec<u8>, CompressionAlgorithm, f64)>> {
        if payload_bytes.len() < self.min_size {
            return Ok(None);
        }

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(payload_bytes)
            .context("write payload into gzip encoder")?;
        let compressed = encoder.finish().context("finish gzip stream")?;

        let ratio = if compressed.is_empty() {
            1.0
        } else {
            payload_bytes.len() as f64 / compressed.len() as f64
        };

        Ok(Some((compressed, CompressionAlgorithm::Gzip, ratio)))
    }
}

pub fn decompress(bytes: &[u8], algorithm: CompressionAlgorithm) -> Result<Vec<u8>> {
    match algorithm {
        CompressionAlgorithm::Gzip => {
            let mut decoder = GzDecoder::new(bytes);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .context("decompress gzip payload")?;
            Ok(out)
        }
        CompressionAlgorithm::Lz4 => bail!("lz4 decompression is not implemented"),
        CompressionAlgorithm::Zstd => bail!("zstd decompression is not implemented"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_below_min_size_is_not_compressed() {
        let compressor = Compressor::new(1024);
        let result = compressor.compress_if_needed(b"short").expect("compress");
        assert!(result.is_none());
    }

    #[test]
    fn round_trip_restores_original_bytes_above_min_size() {
        let compressor = Compressor::new(16);
        let payload = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        let (compressed, algorithm, ratio) = compressor
            .compress_if_needed(payload)
            .expect("compress")
            .expect("payload meets threshold");
        assert!(ratio >= 1.0);

        let restored = decompress(&compressed, algorithm).expect("decompress");
        assert_eq!(restored, payload);
    }

    #[test]
    fn payload_exactly_at_min_size_is_compressed() {
        let payload = vec![b'x'; 1024];
        let compressor = Compressor::new(1024);
        assert!(compressor.compress_if_needed(&payload).unwrap().is_some());
    }
}
