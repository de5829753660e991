//! Optional compression of the inner payload before encryption.
//!
//! The envelope flag byte records which algorithm, if any, was applied:
//!
//! | Flag | Algorithm |
//! |------|-----------|
//! | `0x00` | none |
//! | `0x01` | zstd |
//! | `0x02` | reserved, always rejected |
//!
//! Compression is applied only above a size threshold and only when it saves
//! at least 10% of the input. Decompression output is capped at
//! [`MAX_DECOMPRESSED_SIZE`].

use crate::config::CompressionConfig;
use crate::error::Error;
use serde::Deserialize;
use std::sync::{Mutex, OnceLock, PoisonError};
use zstd::stream::raw::{InBuffer, Operation, OutBuffer};

/// Hard ceiling on decompressed output (64 MiB).
pub const MAX_DECOMPRESSED_SIZE: usize = 64 * 1024 * 1024;

/// Minimum saving, in percent of the input size, for compressed output to be kept.
pub const MIN_SAVINGS_PERCENT: usize = 10;

/// Compression algorithm recorded in the envelope flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CompressionAlgorithm {
    /// Payload stored as-is.
    None = 0x00,
    /// Zstandard.
    Zstd = 0x01,
    /// Slot held for a future algorithm. Never produced, rejected on decode.
    Reserved = 0x02,
}

impl CompressionAlgorithm {
    /// Returns the wire flag value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parses a wire flag value.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnsupportedCompressionAlgorithm` for values outside the table.
    pub fn from_u8(flag: u8) -> Result<Self, Error> {
        match flag {
            0x00 => Ok(Self::None),
            0x01 => Ok(Self::Zstd),
            0x02 => Ok(Self::Reserved),
            other => Err(Error::UnsupportedCompressionAlgorithm(other)),
        }
    }

    /// Whether this build can produce and consume the algorithm.
    #[must_use]
    pub const fn is_supported(self) -> bool {
        matches!(self, Self::Zstd)
    }
}

/// Output is produced in chunks of this size so the ceiling is checked
/// before memory is committed.
const DECODE_CHUNK: usize = 64 * 1024;

/// Process-wide zstd codec.
///
/// Encoder and decoder contexts are built once and reused across calls
/// behind mutexes. Decoding writes into a fixed chunk buffer so a hostile
/// frame cannot force an allocation past the ceiling.
struct ZstdCodec {
    compressor: Mutex<zstd::bulk::Compressor<'static>>,
    decompressor: Mutex<zstd::stream::raw::Decoder<'static>>,
}

impl ZstdCodec {
    fn new() -> std::io::Result<Self> {
        let compressor = zstd::bulk::Compressor::new(zstd::DEFAULT_COMPRESSION_LEVEL)?;
        let decompressor = zstd::stream::raw::Decoder::new()?;
        Ok(Self { compressor: Mutex::new(compressor), decompressor: Mutex::new(decompressor) })
    }

    fn encode(&self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        self.compressor.lock().unwrap_or_else(PoisonError::into_inner).compress(data)
    }

    fn decode(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, Error> {
        let mut decoder = self.decompressor.lock().unwrap_or_else(PoisonError::into_inner);
        // A previous call may have stopped mid-frame.
        decoder.reinit().map_err(|e| Error::DecompressionFailed(format!("zstd reset: {e}")))?;

        let mut input = InBuffer::around(data);
        let mut chunk = vec![0u8; DECODE_CHUNK];
        let mut out = Vec::new();

        loop {
            let consumed = input.pos();
            let mut output = OutBuffer::around(&mut chunk[..]);
            let remaining = decoder
                .run(&mut input, &mut output)
                .map_err(|e| Error::DecompressionFailed(format!("zstd: {e}")))?;
            let written = output.pos();

            if out.len() + written > limit {
                return Err(Error::DecompressionFailed(format!(
                    "decompressed size exceeds {limit} bytes"
                )));
            }
            out.extend_from_slice(&chunk[..written]);

            if remaining == 0 {
                break;
            }
            if written == 0 && input.pos() == consumed {
                return Err(Error::DecompressionFailed("zstd: truncated frame".to_string()));
            }
        }

        if input.pos() != data.len() {
            return Err(Error::DecompressionFailed(
                "zstd: trailing bytes after frame".to_string(),
            ));
        }
        Ok(out)
    }
}

static CODEC: OnceLock<Option<ZstdCodec>> = OnceLock::new();

fn codec() -> Option<&'static ZstdCodec> {
    CODEC
        .get_or_init(|| match ZstdCodec::new() {
            Ok(codec) => Some(codec),
            Err(e) => {
                tracing::warn!(error = %e, "zstd codec unavailable, compression disabled");
                None
            }
        })
        .as_ref()
}

/// Compresses `data` when the policy allows it and the result is worth keeping.
///
/// Returns the bytes to encrypt and the flag to record. Skips compression
/// (returning `data` untouched with [`CompressionAlgorithm::None`]) when it is
/// disabled, the input is below the threshold or above
/// [`MAX_DECOMPRESSED_SIZE`], the algorithm is not supported, or the saving is
/// under [`MIN_SAVINGS_PERCENT`].
#[must_use]
pub fn maybe_compress(data: Vec<u8>, config: &CompressionConfig) -> (Vec<u8>, CompressionAlgorithm) {
    if !config.enabled || data.len() < config.threshold || !config.algorithm.is_supported() {
        return (data, CompressionAlgorithm::None);
    }

    // Stored raw, otherwise the decoder's ceiling would make it unreadable.
    if data.len() > MAX_DECOMPRESSED_SIZE {
        tracing::trace!(original = data.len(), "payload above decompression ceiling, storing raw");
        return (data, CompressionAlgorithm::None);
    }

    let Some(codec) = codec() else {
        return (data, CompressionAlgorithm::None);
    };

    match codec.encode(&data) {
        Ok(compressed) if saves_enough(data.len(), compressed.len()) => {
            tracing::trace!(original = data.len(), compressed = compressed.len(), "compressed payload");
            (compressed, CompressionAlgorithm::Zstd)
        }
        Ok(_) => {
            tracing::trace!(original = data.len(), "compression saving too small, storing raw");
            (data, CompressionAlgorithm::None)
        }
        Err(e) => {
            tracing::warn!(error = %e, "zstd compression failed, storing raw");
            (data, CompressionAlgorithm::None)
        }
    }
}

const fn saves_enough(original: usize, compressed: usize) -> bool {
    compressed < original && (original - compressed) * 100 >= original * MIN_SAVINGS_PERCENT
}

/// Reverses [`maybe_compress`] according to the envelope flag.
///
/// # Errors
///
/// - `Error::UnsupportedCompressionAlgorithm` for the reserved flag
/// - `Error::DecompressionFailed` for corrupt input or output above [`MAX_DECOMPRESSED_SIZE`]
pub fn decompress(data: Vec<u8>, algorithm: CompressionAlgorithm) -> Result<Vec<u8>, Error> {
    decompress_bounded(data, algorithm, MAX_DECOMPRESSED_SIZE)
}

fn decompress_bounded(
    data: Vec<u8>,
    algorithm: CompressionAlgorithm,
    limit: usize,
) -> Result<Vec<u8>, Error> {
    match algorithm {
        CompressionAlgorithm::None => Ok(data),
        CompressionAlgorithm::Zstd => match codec() {
            Some(codec) => codec.decode(&data, limit),
            None => Err(Error::DecompressionFailed("zstd codec unavailable".to_string())),
        },
        CompressionAlgorithm::Reserved => {
            Err(Error::UnsupportedCompressionAlgorithm(algorithm.as_u8()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: usize) -> CompressionConfig {
        CompressionConfig { threshold, ..CompressionConfig::default() }
    }

    /// Deterministic bytes that zstd cannot shrink.
    fn noise(len: usize) -> Vec<u8> {
        let mut state = 0x2545_f491_u32;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state.to_le_bytes()[0]
            })
            .collect()
    }

    #[test]
    fn test_flag_values() {
        assert_eq!(CompressionAlgorithm::None.as_u8(), 0x00);
        assert_eq!(CompressionAlgorithm::Zstd.as_u8(), 0x01);
        assert_eq!(CompressionAlgorithm::Reserved.as_u8(), 0x02);
        assert!(matches!(
            CompressionAlgorithm::from_u8(0x07),
            Err(Error::UnsupportedCompressionAlgorithm(0x07))
        ));
    }

    #[test]
    fn test_repetitive_data_is_compressed() {
        let data = b"abcdefgh".repeat(1024);
        let (out, flag) = maybe_compress(data.clone(), &config(64));

        assert_eq!(flag, CompressionAlgorithm::Zstd);
        assert!(out.len() < data.len());
        assert_eq!(decompress(out, flag).unwrap(), data);
    }

    #[test]
    fn test_below_threshold_is_skipped() {
        let data = b"a".repeat(100);
        let (out, flag) = maybe_compress(data.clone(), &config(101));

        assert_eq!(flag, CompressionAlgorithm::None);
        assert_eq!(out, data);
    }

    #[test]
    fn test_disabled_is_skipped() {
        let data = b"a".repeat(4096);
        let disabled = CompressionConfig { enabled: false, ..config(0) };
        let (out, flag) = maybe_compress(data.clone(), &disabled);

        assert_eq!(flag, CompressionAlgorithm::None);
        assert_eq!(out, data);
    }

    #[test]
    fn test_unsupported_algorithm_is_skipped() {
        let data = b"a".repeat(4096);
        for algorithm in [CompressionAlgorithm::None, CompressionAlgorithm::Reserved] {
            let policy = CompressionConfig { algorithm, ..config(0) };
            let (out, flag) = maybe_compress(data.clone(), &policy);
            assert_eq!(flag, CompressionAlgorithm::None);
            assert_eq!(out, data);
        }
    }

    #[test]
    fn test_incompressible_data_is_stored_raw() {
        let data = noise(8192);
        let (out, flag) = maybe_compress(data.clone(), &config(0));

        assert_eq!(flag, CompressionAlgorithm::None);
        assert_eq!(out, data);
    }

    #[test]
    fn test_savings_gate() {
        assert!(saves_enough(100, 90));
        assert!(!saves_enough(100, 91));
        assert!(!saves_enough(10, 10));
        assert!(!saves_enough(10, 12));
    }

    #[test]
    fn test_none_flag_returns_input() {
        let data = vec![1, 2, 3];
        assert_eq!(decompress(data.clone(), CompressionAlgorithm::None).unwrap(), data);
    }

    #[test]
    fn test_reserved_flag_rejected() {
        let result = decompress(vec![1, 2, 3], CompressionAlgorithm::Reserved);
        assert!(matches!(result, Err(Error::UnsupportedCompressionAlgorithm(0x02))));
    }

    #[test]
    fn test_corrupt_frame_fails() {
        let result = decompress(vec![0xde, 0xad, 0xbe, 0xef], CompressionAlgorithm::Zstd);
        assert!(matches!(result, Err(Error::DecompressionFailed(_))));
    }

    #[test]
    fn test_output_limit_enforced() {
        let data = vec![0u8; 4096];
        let compressed = zstd::encode_all(&data[..], 3).unwrap();

        let result = decompress_bounded(compressed.clone(), CompressionAlgorithm::Zstd, 4095);
        assert!(matches!(result, Err(Error::DecompressionFailed(_))));

        let exact = decompress_bounded(compressed, CompressionAlgorithm::Zstd, 4096).unwrap();
        assert_eq!(exact.len(), 4096);
    }

    #[test]
    fn test_bomb_past_ceiling_rejected() {
        let bomb = zstd::encode_all(&vec![0u8; MAX_DECOMPRESSED_SIZE + 1][..], 3).unwrap();
        assert!(bomb.len() < 64 * 1024);

        let result = decompress(bomb, CompressionAlgorithm::Zstd);
        assert!(matches!(result, Err(Error::DecompressionFailed(_))));
    }

    #[test]
    fn test_payload_above_ceiling_is_stored_raw() {
        let data = vec![b'a'; MAX_DECOMPRESSED_SIZE + 1];
        let (out, flag) = maybe_compress(data, &config(0));

        assert_eq!(flag, CompressionAlgorithm::None);
        assert_eq!(out.len(), MAX_DECOMPRESSED_SIZE + 1);
    }

    #[test]
    fn test_payload_at_ceiling_is_compressed() {
        let data = vec![b'a'; MAX_DECOMPRESSED_SIZE];
        let (out, flag) = maybe_compress(data, &config(0));

        assert_eq!(flag, CompressionAlgorithm::Zstd);
        assert_eq!(decompress(out, flag).unwrap().len(), MAX_DECOMPRESSED_SIZE);
    }

    #[test]
    fn test_truncated_frame_fails() {
        let mut compressed = zstd::encode_all(&b"abcdefgh".repeat(1024)[..], 3).unwrap();
        compressed.truncate(compressed.len() / 2);

        let result = decompress(compressed, CompressionAlgorithm::Zstd);
        assert!(matches!(result, Err(Error::DecompressionFailed(_))));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut compressed = zstd::encode_all(&b"abcdefgh".repeat(1024)[..], 3).unwrap();
        compressed.extend_from_slice(&[0xde, 0xad]);

        let result = decompress(compressed, CompressionAlgorithm::Zstd);
        assert!(matches!(result, Err(Error::DecompressionFailed(_))));
    }

    #[test]
    fn test_shared_decoder_recovers_after_failure() {
        let data = b"abcdefgh".repeat(1024);
        let compressed = zstd::encode_all(&data[..], 3).unwrap();

        let mut truncated = compressed.clone();
        truncated.truncate(compressed.len() / 2);
        assert!(decompress(truncated, CompressionAlgorithm::Zstd).is_err());

        assert_eq!(decompress(compressed, CompressionAlgorithm::Zstd).unwrap(), data);
    }
}
