//! Error types for `SealDB` operations.

use std::fmt;

/// Main error type for `SealDB` operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Master key material is not exactly 32 bytes
    #[error("invalid key size: expected {expected} bytes, got {actual}")]
    InvalidKeySize {
        /// Required key length
        expected: usize,
        /// Length actually supplied
        actual: usize,
    },

    /// Key derivation failed
    #[error("key derivation failed")]
    KeyDerivation,

    /// Key identifier is empty or longer than 255 bytes
    #[error("invalid key id: {0}")]
    InvalidKeyId(String),

    /// The registry reported no active keys
    #[error("no keys configured")]
    NoKeysConfigured,

    /// The default key id is not among the active keys
    #[error("default key not found: {0}")]
    DefaultKeyNotFound(String),

    /// No derived key set exists for the requested key id
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// Envelope key id disagrees with the requested key or the authenticated inner key id.
    ///
    /// Kept distinct from [`Error::DecryptionFailed`] so callers can tell
    /// header tampering apart from ordinary authentication failure.
    #[error("key id mismatch: envelope names {envelope}, expected {expected}")]
    KeyIdMismatch {
        /// Key id carried by the outer envelope
        envelope: String,
        /// Key id the caller or inner payload bound the value to
        expected: String,
    },

    /// Authentication tag verification failed (wrong key, corruption or tampering)
    #[error("decryption failed: ciphertext may be corrupted or tampered")]
    DecryptionFailed,

    /// Encryption operation failed
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Envelope or inner payload is malformed
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// Compression flag names an algorithm this build cannot decode
    #[error("unsupported compression algorithm: {0:#04x}")]
    UnsupportedCompressionAlgorithm(u8),

    /// Decompression failed or exceeded the output ceiling
    #[error("decompression failed: {0}")]
    DecompressionFailed(String),

    /// The vault was closed and its key material scrubbed
    #[error("vault is closed")]
    ClosedEngine,

    /// Column name is not a safe SQL identifier
    #[error("invalid column identifier: {0:?}")]
    InvalidColumnIdentifier(String),

    /// Positional parameter offset is out of range or overflows the protocol ceiling
    #[error("invalid parameter offset {offset} for {key_count} keys (max parameter: {max})")]
    InvalidParameterOffset {
        /// Offset supplied by the caller
        offset: usize,
        /// Number of active keys the condition would bind
        key_count: usize,
        /// Highest parameter number the target store accepts
        max: usize,
    },

    /// Key registry operation failed
    #[error("key registry error: {0}")]
    KeyRegistry(#[from] KeyRegistryError),
}

/// Errors specific to key registry operations.
#[derive(Debug)]
pub enum KeyRegistryError {
    /// Master key not found
    KeyNotFound(String),

    /// No default key configured
    NoDefaultKey,

    /// Key material or key id is malformed
    InvalidKey(String),

    /// Key generation failed
    CreationFailed(String),

    /// I/O operation failed
    Io(std::io::Error),
}

impl fmt::Display for KeyRegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyNotFound(id) => write!(f, "master key not found: {id}"),
            Self::NoDefaultKey => write!(f, "no default key configured"),
            Self::InvalidKey(msg) => write!(f, "invalid key: {msg}"),
            Self::CreationFailed(msg) => write!(f, "key creation failed: {msg}"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for KeyRegistryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for KeyRegistryError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}
