//! Blind index generation for searchable encryption.
//!
//! A blind index is `HMAC-SHA256(hmac_subkey, value)`. It is deterministic,
//! so equal plaintexts give equal digests under one key and equality search
//! works across every row. Each key version has its own subkey, so the same
//! plaintext indexes differently per version.
//!
//! # Security Warning
//!
//! The digest carries no per-row context. Anyone who can read the index
//! column sees which rows share a value, and low-entropy fields (status
//! codes, booleans) can be recovered by frequency analysis. Index only
//! high-entropy fields.

use crate::error::Error;
use crate::kdf::DerivedKeySet;
use crate::vault::{Vault, EXPLICIT_KEY};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;

type HmacSha256 = Hmac<Sha256>;

/// Blind index output size (full HMAC-SHA256 digest).
pub const BLIND_INDEX_SIZE: usize = 32;

/// A blind index digest.
pub type BlindIndex = [u8; BLIND_INDEX_SIZE];

/// Canonicalization applied to a value before it is indexed.
///
/// The stored ciphertext always holds the original value; only the digest
/// sees the normalized form. The same normalizer must be used when writing
/// and when querying, otherwise searches silently match nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Normalizer {
    /// Value indexed as-is.
    #[default]
    Identity,
    /// Trimmed and lowercased, for email addresses.
    Email,
    /// ASCII digits only, for phone numbers and similar.
    Digits,
    /// Leading and trailing whitespace removed.
    Trim,
    /// Lowercased.
    Lowercase,
    /// Caller-supplied transform.
    Custom(fn(&str) -> String),
}

impl Normalizer {
    /// Applies the transform.
    ///
    /// # Example
    ///
    /// ```
    /// use sealdb::blind_index::Normalizer;
    ///
    /// assert_eq!(Normalizer::Email.apply(" Alice@Example.COM "), "alice@example.com");
    /// assert_eq!(Normalizer::Digits.apply("+1 (555) 010-9999"), "15550109999");
    /// ```
    #[must_use]
    pub fn apply(&self, value: &str) -> String {
        match self {
            Self::Identity => value.to_string(),
            Self::Email => value.trim().to_lowercase(),
            Self::Digits => value.chars().filter(char::is_ascii_digit).collect(),
            Self::Trim => value.trim().to_string(),
            Self::Lowercase => value.to_lowercase(),
            Self::Custom(transform) => transform(value),
        }
    }
}

/// Computes the blind index of `value` under one key set.
#[must_use]
pub fn compute(keys: &DerivedKeySet, value: &[u8]) -> BlindIndex {
    let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(keys.hmac_key()) else {
        unreachable!("HMAC accepts keys of any length")
    };
    mac.update(value);

    let mut index = [0u8; BLIND_INDEX_SIZE];
    index.copy_from_slice(&mac.finalize().into_bytes());
    index
}

impl Vault {
    /// Blind index of `plaintext` under the default key.
    ///
    /// # Panics
    ///
    /// Panics if the vault is closed.
    #[must_use]
    pub fn blind_index(&self, plaintext: Option<&[u8]>) -> Option<BlindIndex> {
        let ring = self.default_ring();
        let keys = ring.get(self.default_key_id()).ok()?;
        plaintext.map(|p| compute(keys, p))
    }

    /// Blind index of a normalized string under the default key.
    ///
    /// # Panics
    ///
    /// Panics if the vault is closed.
    #[must_use]
    pub fn blind_index_str(
        &self,
        plaintext: Option<&str>,
        normalizer: Normalizer,
    ) -> Option<BlindIndex> {
        let ring = self.default_ring();
        let keys = ring.get(self.default_key_id()).ok()?;
        plaintext.map(|p| compute(keys, normalizer.apply(p).as_bytes()))
    }

    /// Blind index of `plaintext` under `key_id`.
    ///
    /// # Errors
    ///
    /// - `Error::ClosedEngine` if the vault is closed
    /// - `Error::KeyNotFound` if `key_id` is not active
    pub fn blind_index_with_key(
        &self,
        key_id: &str,
        plaintext: Option<&[u8]>,
    ) -> Result<Option<BlindIndex>, Error> {
        let ring = self.ring(EXPLICIT_KEY)?;
        let Some(plaintext) = plaintext else {
            return Ok(None);
        };
        Ok(Some(compute(ring.get(key_id)?, plaintext)))
    }

    /// Blind index of `plaintext` under every active key, keyed by key id.
    ///
    /// Used to query rows written under any key still in rotation.
    ///
    /// # Errors
    ///
    /// Returns `Error::ClosedEngine` if the vault is closed.
    pub fn blind_index_all(
        &self,
        plaintext: Option<&[u8]>,
    ) -> Result<Option<HashMap<String, BlindIndex>>, Error> {
        let ring = self.ring(EXPLICIT_KEY)?;
        let Some(plaintext) = plaintext else {
            return Ok(None);
        };

        self.active_key_ids()
            .iter()
            .map(|key_id| Ok((key_id.clone(), compute(ring.get(key_id)?, plaintext))))
            .collect::<Result<HashMap<_, _>, Error>>()
            .map(Some)
    }
}
