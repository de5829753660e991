//! Vault configuration.

use crate::compression::CompressionAlgorithm;
use serde::Deserialize;

/// Default minimum payload size, in bytes, before compression is attempted.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

/// Options applied to every [`Vault`](crate::vault::Vault) operation.
///
/// Deserializes from a table with every field optional:
///
/// ```toml
/// [compression]
/// enabled = true
/// threshold = 1024
/// algorithm = "zstd"
/// ```
///
/// # Example
///
/// ```
/// use sealdb::config::VaultConfig;
///
/// let config = VaultConfig::default().with_compression_threshold(4096);
/// assert_eq!(config.compression.threshold, 4096);
///
/// let raw = VaultConfig::default().without_compression();
/// assert!(!raw.compression.enabled);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Compression policy for the inner payload.
    pub compression: CompressionConfig,
}

impl VaultConfig {
    /// Sets the minimum payload size for compression.
    #[must_use]
    pub const fn with_compression_threshold(mut self, threshold: usize) -> Self {
        self.compression.threshold = threshold;
        self
    }

    /// Sets the compression algorithm.
    #[must_use]
    pub const fn with_compression_algorithm(mut self, algorithm: CompressionAlgorithm) -> Self {
        self.compression.algorithm = algorithm;
        self
    }

    /// Disables compression entirely.
    #[must_use]
    pub const fn without_compression(mut self) -> Self {
        self.compression.enabled = false;
        self
    }
}

/// Compression policy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Whether compression is attempted at all.
    pub enabled: bool,
    /// Payloads shorter than this are never compressed.
    pub threshold: usize,
    /// Algorithm used when compressing.
    pub algorithm: CompressionAlgorithm,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: DEFAULT_COMPRESSION_THRESHOLD,
            algorithm: CompressionAlgorithm::Zstd,
        }
    }
}
