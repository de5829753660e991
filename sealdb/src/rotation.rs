//! Re-encryption of stored values under the current default key.
//!
//! A rotation adds a new key to the registry, makes it the default, and
//! rewrites rows at leisure. Until every row is rewritten the old key stays
//! active so existing envelopes still decrypt and search conditions still
//! match rows indexed under it.

use crate::blind_index::{self, BlindIndex};
use crate::envelope;
use crate::error::Error;
use crate::vault::{Vault, DEFAULT_KEY};

impl Vault {
    /// Decrypts `envelope` under whichever active key it names and re-encrypts
    /// it under the default key.
    ///
    /// Values already under the default key are re-encrypted too, with a fresh nonce.
    ///
    /// # Panics
    ///
    /// Panics if the vault is closed or the system entropy source fails.
    ///
    /// # Errors
    ///
    /// As [`Vault::decrypt`] and [`Vault::encrypt`].
    pub fn rotate_value(&self, envelope: Option<&[u8]>) -> Result<Option<Vec<u8>>, Error> {
        let ring = self.default_ring();
        let Some(envelope) = envelope else {
            return Ok(None);
        };

        let plaintext = Self::decrypt_under(&ring, envelope, None)?;
        let rotated = self.encrypt_under(&ring, self.default_key_id(), &plaintext, DEFAULT_KEY)?;

        tracing::trace!(to = %self.default_key_id(), "value rotated");
        Ok(Some(rotated))
    }

    /// Blind index of `plaintext` under the default key, for the index column
    /// of a rotated row.
    ///
    /// # Panics
    ///
    /// Panics if the vault is closed.
    #[must_use]
    pub fn rotate_blind_index(&self, plaintext: Option<&[u8]>) -> Option<BlindIndex> {
        let ring = self.default_ring();
        let keys = ring.get(self.default_key_id()).ok()?;
        plaintext.map(|p| blind_index::compute(keys, p))
    }

    /// Whether `envelope` was written under a key other than the default.
    ///
    /// `None`, envelopes too short to carry a key id, and envelopes whose key
    /// id is not UTF-8 report `false`; the header is read without decrypting.
    ///
    /// # Panics
    ///
    /// Panics if the vault is closed.
    #[must_use]
    pub fn needs_rotation(&self, envelope: Option<&[u8]>) -> bool {
        let _ring = self.default_ring();
        envelope
            .and_then(|e| envelope::peek_key_id(e).ok())
            .is_some_and(|key_id| key_id != self.default_key_id())
    }
}
