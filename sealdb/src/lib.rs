//! # `SealDB`
//!
//! Client-side encryption for database columns: self-describing
//! authenticated envelopes, blind indexes for equality search, and key
//! rotation without downtime.
//!
//! ## Features
//!
//! - XSalsa20-Poly1305 envelopes with per-key HKDF-SHA256 subkeys
//! - Inner/outer key-id binding against key confusion
//! - Optional zstd compression with a bounded decompressor
//! - HMAC-SHA256 blind indexes with value normalizers
//! - Multi-key search conditions for rotation windows
//!
//! ## Example
//!
//! ```
//! use sealdb::prelude::*;
//!
//! # fn main() -> Result<(), Error> {
//! let registry = MemoryKeyRegistry::new().with_key("v1", [7u8; 32]);
//! let vault = Vault::new(&registry, VaultConfig::default())?;
//!
//! let sealed = vault.seal_str(Some("Alice@Example.com"), Normalizer::Email)?;
//! let plaintext = vault.decrypt(sealed.ciphertext.as_deref())?;
//! assert_eq!(plaintext.as_deref(), Some(&b"Alice@Example.com"[..]));
//!
//! let condition = vault.build_condition_str("email", Some("alice@example.com"), Normalizer::Email, 1);
//! assert_eq!(condition.parameters()[1], SearchParam::BlindIndex(sealed.blind_index.unwrap()));
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod blind_index;
pub mod compression;
pub mod config;
pub mod envelope;
pub mod error;
pub mod kdf;
pub mod key_registry;
pub mod rotation;
pub mod search;
pub mod vault;

pub mod prelude {
    //! Convenience re-exports for common use.
    pub use crate::blind_index::{BlindIndex, Normalizer};
    pub use crate::compression::CompressionAlgorithm;
    pub use crate::config::{CompressionConfig, VaultConfig};
    pub use crate::error::{Error, KeyRegistryError};
    pub use crate::key_registry::{KeyRegistry, MemoryKeyRegistry};
    pub use crate::search::{SearchCondition, SearchParam};
    pub use crate::vault::{SealedValue, Vault};
}
