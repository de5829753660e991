//! Key derivation using HKDF (HMAC-based Key Derivation Function).
//!
//! Each 32-byte master key yields two independent subkeys: one for the
//! envelope cipher and one for blind indexes. The two HKDF `info` strings
//! are fixed; changing either breaks every stored envelope and index.

use crate::error::Error;
use hkdf::Hkdf;
use sha2::Sha256;
use std::fmt;
use zeroize::Zeroize;

/// Master key and subkey size in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// HKDF `info` for the envelope encryption subkey.
pub const ENCRYPTION_INFO: &[u8] = b"sealdb-v1-encryption";

/// HKDF `info` for the blind index subkey.
pub const BLIND_INDEX_INFO: &[u8] = b"sealdb-v1-blind-index";

/// Subkeys derived from one master key.
///
/// Zeroized on drop.
pub struct DerivedKeySet {
    encryption_key: [u8; KEY_SIZE],
    hmac_key: [u8; KEY_SIZE],
}

impl DerivedKeySet {
    /// Returns the XSalsa20-Poly1305 key.
    #[must_use]
    pub const fn encryption_key(&self) -> &[u8; KEY_SIZE] {
        &self.encryption_key
    }

    /// Returns the HMAC-SHA256 key used for blind indexes.
    #[must_use]
    pub const fn hmac_key(&self) -> &[u8; KEY_SIZE] {
        &self.hmac_key
    }

    /// Overwrites both subkeys with zeros.
    pub fn scrub(&mut self) {
        self.encryption_key.zeroize();
        self.hmac_key.zeroize();
    }
}

impl Drop for DerivedKeySet {
    fn drop(&mut self) {
        self.scrub();
    }
}

impl fmt::Debug for DerivedKeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKeySet")
            .field("encryption_key", &"[REDACTED]")
            .field("hmac_key", &"[REDACTED]")
            .finish()
    }
}

/// Derives the encryption and blind index subkeys from a master key.
///
/// HKDF-SHA256 with an empty salt; the two subkeys differ only by `info`.
///
/// # Errors
///
/// Returns `Error::InvalidKeySize` unless `master_key` is exactly 32 bytes.
///
/// # Example
///
/// ```
/// use sealdb::kdf::derive;
///
/// let keys = derive(&[7u8; 32]).expect("key derivation failed");
/// assert_ne!(keys.encryption_key(), keys.hmac_key());
/// ```
pub fn derive(master_key: &[u8]) -> Result<DerivedKeySet, Error> {
    if master_key.len() != KEY_SIZE {
        return Err(Error::InvalidKeySize { expected: KEY_SIZE, actual: master_key.len() });
    }

    let hkdf = Hkdf::<Sha256>::new(None, master_key);

    let mut keys = DerivedKeySet { encryption_key: [0u8; KEY_SIZE], hmac_key: [0u8; KEY_SIZE] };

    hkdf.expand(ENCRYPTION_INFO, &mut keys.encryption_key).map_err(|_| Error::KeyDerivation)?;
    hkdf.expand(BLIND_INDEX_INFO, &mut keys.hmac_key).map_err(|_| Error::KeyDerivation)?;

    Ok(keys)
}
