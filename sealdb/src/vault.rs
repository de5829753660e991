//! Vault for encryption and decryption operations.
//!
//! The vault derives subkeys for every active master key once, at
//! construction, and seals values into self-describing envelopes with
//! XSalsa20-Poly1305 under a fresh random 24-byte nonce.
//!
//! # Entry-point shapes
//!
//! Every operation comes in two shapes over one implementation:
//!
//! | Shape | Closed vault | Entropy source failure |
//! |-------|--------------|------------------------|
//! | default key (`encrypt`, `decrypt`, ...) | panic | panic |
//! | explicit key (`encrypt_with_key`, ...) | `Error::ClosedEngine` | panic |
//!
//! Data errors (bad envelopes, unknown keys, failed authentication) are
//! returned by both shapes.

use crate::blind_index::{self, BlindIndex, Normalizer};
use crate::compression::{self, CompressionAlgorithm};
use crate::config::VaultConfig;
use crate::envelope::{validate_key_id, Envelope, InnerPlaintext, NONCE_SIZE};
use crate::error::{Error, KeyRegistryError};
use crate::kdf::{self, DerivedKeySet};
use crate::key_registry::KeyRegistry;
use crypto_secretbox::{
    aead::{Aead, KeyInit},
    XSalsa20Poly1305,
};
use rand::{rngs::OsRng, RngCore};
use secrecy::ExposeSecret;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use subtle::ConstantTimeEq;

/// How an entry point reports a fault that is not caused by the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnFault {
    Panic,
    Return,
}

/// Failure-surfacing rules for one entry-point shape.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Convention {
    on_closed: OnFault,
    on_entropy: OnFault,
}

/// Default-key entry points: misuse after close is a programmer error.
pub(crate) const DEFAULT_KEY: Convention =
    Convention { on_closed: OnFault::Panic, on_entropy: OnFault::Panic };

/// Explicit-key entry points: closed state is reported to the caller.
pub(crate) const EXPLICIT_KEY: Convention =
    Convention { on_closed: OnFault::Return, on_entropy: OnFault::Panic };

impl Convention {
    fn closed(self) -> Error {
        match self.on_closed {
            OnFault::Panic => panic!("sealdb: {}", Error::ClosedEngine),
            OnFault::Return => Error::ClosedEngine,
        }
    }

    fn entropy(self, err: &rand::Error) -> Error {
        match self.on_entropy {
            OnFault::Panic => panic!("sealdb: entropy source failure: {err}"),
            OnFault::Return => Error::EncryptionFailed(format!("entropy source failure: {err}")),
        }
    }
}

/// Derived key sets for every active key.
pub(crate) struct KeyRing {
    keys: HashMap<String, DerivedKeySet>,
}

impl KeyRing {
    pub(crate) fn get(&self, key_id: &str) -> Result<&DerivedKeySet, Error> {
        self.keys.get(key_id).ok_or_else(|| Error::KeyNotFound(key_id.to_string()))
    }

    fn scrub(&mut self) {
        for keys in self.keys.values_mut() {
            keys.scrub();
        }
    }
}

enum Lifecycle {
    Open(Arc<KeyRing>),
    Closed,
}

struct Shared {
    closed: AtomicBool,
    lifecycle: RwLock<Lifecycle>,
    default_key_id: String,
    active_key_ids: Vec<String>,
    config: VaultConfig,
}

/// A value ready to be written to an encrypted column pair.
///
/// `None` fields encode SQL `NULL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedValue {
    /// Envelope bytes for the ciphertext column.
    pub ciphertext: Option<Vec<u8>>,
    /// Digest for the blind index column.
    pub blind_index: Option<BlindIndex>,
    /// Key the value was sealed under.
    pub key_id: String,
}

/// Vault for encryption, blind indexing and key rotation.
///
/// Cloning is cheap and shares state: closing any clone closes all of them.
///
/// # Example
///
/// ```
/// use sealdb::config::VaultConfig;
/// use sealdb::key_registry::MemoryKeyRegistry;
/// use sealdb::vault::Vault;
///
/// # fn main() -> Result<(), sealdb::error::Error> {
/// let registry = MemoryKeyRegistry::new().with_key("v1", [7u8; 32]);
/// let vault = Vault::new(&registry, VaultConfig::default())?;
///
/// let envelope = vault.encrypt(Some(b"alice@example.com"))?;
/// let plaintext = vault.decrypt(envelope.as_deref())?;
///
/// assert_eq!(plaintext.as_deref(), Some(&b"alice@example.com"[..]));
/// assert_eq!(vault.encrypt(None)?, None);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Vault {
    shared: Arc<Shared>,
}

impl Vault {
    /// Creates a vault from every active key in `registry`.
    ///
    /// Key material is read and derived here; the registry is not retained.
    /// Duplicate ids in the active list are collapsed, keeping the first position.
    ///
    /// # Errors
    ///
    /// - `Error::NoKeysConfigured` if the registry has no active keys
    /// - `Error::InvalidKeyId` if an id is empty or longer than 255 bytes
    /// - `Error::KeyNotFound` if the registry cannot supply an active key
    /// - `Error::InvalidKeySize` if a master key is not 32 bytes
    /// - `Error::DefaultKeyNotFound` if the default id is not active
    pub fn new<R: KeyRegistry + ?Sized>(registry: &R, config: VaultConfig) -> Result<Self, Error> {
        let requested = registry.active_key_ids();
        if requested.is_empty() {
            return Err(Error::NoKeysConfigured);
        }

        let mut keys = HashMap::with_capacity(requested.len());
        let mut active_key_ids = Vec::with_capacity(requested.len());

        for key_id in requested {
            validate_key_id(&key_id)?;
            if keys.contains_key(&key_id) {
                continue;
            }

            let master = registry.get_key(&key_id).map_err(|e| match e {
                KeyRegistryError::KeyNotFound(id) => Error::KeyNotFound(id),
                other => Error::KeyRegistry(other),
            })?;
            let derived = kdf::derive(master.expose_secret())?;

            keys.insert(key_id.clone(), derived);
            active_key_ids.push(key_id);
        }

        let default_key_id = registry.default_key_id();
        if !keys.contains_key(&default_key_id) {
            return Err(Error::DefaultKeyNotFound(default_key_id));
        }

        tracing::debug!(
            keys = active_key_ids.len(),
            default_key_id = %default_key_id,
            "vault opened"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                closed: AtomicBool::new(false),
                lifecycle: RwLock::new(Lifecycle::Open(Arc::new(KeyRing { keys }))),
                default_key_id,
                active_key_ids,
                config,
            }),
        })
    }

    /// Returns the key new values are encrypted under.
    #[must_use]
    pub fn default_key_id(&self) -> &str {
        &self.shared.default_key_id
    }

    /// Returns the active key ids in search-condition order.
    #[must_use]
    pub fn active_key_ids(&self) -> &[String] {
        &self.shared.active_key_ids
    }

    /// Returns the configuration the vault was built with.
    #[must_use]
    pub fn config(&self) -> &VaultConfig {
        &self.shared.config
    }

    /// Whether [`Vault::close`] has been called on this vault or any clone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Closes the vault and scrubs its key material.
    ///
    /// Only the first call has an effect. Subkeys are zeroed in place when no
    /// operation still holds them; otherwise the last in-flight operation
    /// zeroes them as it finishes. This is a best-effort scrub, not a barrier
    /// against operations already running.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let previous = {
            let mut lifecycle =
                self.shared.lifecycle.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *lifecycle, Lifecycle::Closed)
        };

        if let Lifecycle::Open(mut ring) = previous {
            if let Some(ring) = Arc::get_mut(&mut ring) {
                ring.scrub();
            }
        }

        tracing::debug!("vault closed");
    }

    /// Returns the key ring, or the closed fault under `convention`.
    pub(crate) fn ring(&self, convention: Convention) -> Result<Arc<KeyRing>, Error> {
        if self.is_closed() {
            return Err(convention.closed());
        }

        let ring = match &*self.shared.lifecycle.read().unwrap_or_else(PoisonError::into_inner) {
            Lifecycle::Open(ring) => Some(Arc::clone(ring)),
            Lifecycle::Closed => None,
        };
        ring.ok_or_else(|| convention.closed())
    }

    /// Returns the key ring for entry points that cannot report a closed vault.
    ///
    /// # Panics
    ///
    /// Panics if the vault is closed.
    pub(crate) fn default_ring(&self) -> Arc<KeyRing> {
        match self.ring(DEFAULT_KEY) {
            Ok(ring) => ring,
            Err(e) => panic!("sealdb: {e}"),
        }
    }

    /// Encrypts under the default key.
    ///
    /// `None` is returned unchanged, so SQL `NULL` stays `NULL`.
    ///
    /// # Panics
    ///
    /// Panics if the vault is closed or the system entropy source fails.
    ///
    /// # Errors
    ///
    /// Returns `Error::EncryptionFailed` if the cipher rejects the payload.
    pub fn encrypt(&self, plaintext: Option<&[u8]>) -> Result<Option<Vec<u8>>, Error> {
        let ring = self.ring(DEFAULT_KEY)?;
        plaintext
            .map(|p| self.encrypt_under(&ring, self.default_key_id(), p, DEFAULT_KEY))
            .transpose()
    }

    /// Decrypts an envelope under whichever active key it names.
    ///
    /// `None` is returned unchanged.
    ///
    /// # Panics
    ///
    /// Panics if the vault is closed.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidFormat` for malformed envelopes
    /// - `Error::KeyNotFound` if the envelope names an inactive key
    /// - `Error::DecryptionFailed` if authentication fails
    /// - `Error::KeyIdMismatch` if the envelope header was rewritten
    /// - `Error::UnsupportedCompressionAlgorithm` / `Error::DecompressionFailed`
    pub fn decrypt(&self, envelope: Option<&[u8]>) -> Result<Option<Vec<u8>>, Error> {
        let ring = self.ring(DEFAULT_KEY)?;
        envelope.map(|e| Self::decrypt_under(&ring, e, None)).transpose()
    }

    /// Encrypts under `key_id`.
    ///
    /// # Panics
    ///
    /// Panics if the system entropy source fails.
    ///
    /// # Errors
    ///
    /// - `Error::ClosedEngine` if the vault is closed
    /// - `Error::KeyNotFound` if `key_id` is not active
    /// - `Error::EncryptionFailed` if the cipher rejects the payload
    pub fn encrypt_with_key(
        &self,
        key_id: &str,
        plaintext: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, Error> {
        let ring = self.ring(EXPLICIT_KEY)?;
        plaintext.map(|p| self.encrypt_under(&ring, key_id, p, EXPLICIT_KEY)).transpose()
    }

    /// Decrypts an envelope that must name `key_id`.
    ///
    /// # Errors
    ///
    /// As [`Vault::decrypt`], plus `Error::ClosedEngine` if the vault is closed
    /// and `Error::KeyIdMismatch` if the envelope names a different key.
    pub fn decrypt_with_key(
        &self,
        key_id: &str,
        envelope: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, Error> {
        let ring = self.ring(EXPLICIT_KEY)?;
        envelope.map(|e| Self::decrypt_under(&ring, e, Some(key_id))).transpose()
    }

    /// Encrypts and blind-indexes a value under the default key in one step.
    ///
    /// # Panics
    ///
    /// Panics if the vault is closed or the system entropy source fails.
    ///
    /// # Errors
    ///
    /// As [`Vault::encrypt`].
    pub fn seal(&self, plaintext: Option<&[u8]>) -> Result<SealedValue, Error> {
        let ring = self.ring(DEFAULT_KEY)?;
        let key_id = self.default_key_id();
        let keys = ring.get(key_id)?;

        Ok(SealedValue {
            ciphertext: plaintext
                .map(|p| self.encrypt_under(&ring, key_id, p, DEFAULT_KEY))
                .transpose()?,
            blind_index: plaintext.map(|p| blind_index::compute(keys, p)),
            key_id: key_id.to_string(),
        })
    }

    /// Seals a string, indexing its normalized form and storing it verbatim.
    ///
    /// # Panics
    ///
    /// Panics if the vault is closed or the system entropy source fails.
    ///
    /// # Errors
    ///
    /// As [`Vault::encrypt`].
    pub fn seal_str(
        &self,
        plaintext: Option<&str>,
        normalizer: Normalizer,
    ) -> Result<SealedValue, Error> {
        let mut sealed = self.seal(plaintext.map(str::as_bytes))?;
        sealed.blind_index = self.blind_index_str(plaintext, normalizer);
        Ok(sealed)
    }

    pub(crate) fn encrypt_under(
        &self,
        ring: &KeyRing,
        key_id: &str,
        plaintext: &[u8],
        convention: Convention,
    ) -> Result<Vec<u8>, Error> {
        let keys = ring.get(key_id)?;

        let inner = InnerPlaintext::encode(key_id, plaintext)?;
        let (payload, compression) =
            compression::maybe_compress(inner, &self.shared.config.compression);

        let nonce = fresh_nonce(convention)?;

        let cipher = XSalsa20Poly1305::new(keys.encryption_key().into());
        let ciphertext = cipher
            .encrypt(&nonce.into(), payload.as_slice())
            .map_err(|e| Error::EncryptionFailed(format!("XSalsa20-Poly1305: {e}")))?;

        Envelope::new(compression, key_id, nonce, ciphertext).to_bytes()
    }

    pub(crate) fn decrypt_under(
        ring: &KeyRing,
        data: &[u8],
        expected_key_id: Option<&str>,
    ) -> Result<Vec<u8>, Error> {
        let envelope = Envelope::from_bytes(data)?;

        if let Some(expected) = expected_key_id {
            if expected != envelope.key_id() {
                return Err(Error::KeyIdMismatch {
                    envelope: envelope.key_id().to_string(),
                    expected: expected.to_string(),
                });
            }
        }

        let keys = ring.get(envelope.key_id())?;

        let cipher = XSalsa20Poly1305::new(keys.encryption_key().into());
        let decrypted = cipher
            .decrypt(envelope.nonce().into(), envelope.ciphertext())
            .map_err(|_| Error::DecryptionFailed)?;

        let compression = CompressionAlgorithm::from_u8(envelope.flag())?;
        let inner = InnerPlaintext::decode(compression::decompress(decrypted, compression)?)?;

        if !bool::from(inner.key_id().ct_eq(envelope.key_id().as_bytes())) {
            tracing::warn!(
                envelope_key_id = %envelope.key_id(),
                "authenticated key id differs from envelope header, possible key confusion"
            );
            return Err(Error::KeyIdMismatch {
                envelope: envelope.key_id().to_string(),
                expected: String::from_utf8_lossy(inner.key_id()).into_owned(),
            });
        }

        Ok(inner.into_payload())
    }
}

fn fresh_nonce(convention: Convention) -> Result<[u8; NONCE_SIZE], Error> {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.try_fill_bytes(&mut nonce).map_err(|e| convention.entropy(&e))?;
    Ok(nonce)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_registry::MemoryKeyRegistry;
    use std::collections::HashSet;

    const KEY_A: [u8; 32] = [0xA1; 32];
    const KEY_B: [u8; 32] = [0xB2; 32];

    fn registry() -> MemoryKeyRegistry {
        MemoryKeyRegistry::new().with_key("key_a", KEY_A).with_key("key_b", KEY_B)
    }

    fn test_vault() -> Vault {
        Vault::new(&registry(), VaultConfig::default()).unwrap()
    }

    /// Seals `inner` under `master`, labelling the envelope with `outer_key_id`.
    fn forge(master: &[u8], outer_key_id: &str, inner_key_id: &str, payload: &[u8]) -> Vec<u8> {
        let keys = kdf::derive(master).unwrap();
        let inner = InnerPlaintext::encode(inner_key_id, payload).unwrap();
        let nonce = [3u8; NONCE_SIZE];
        let ciphertext = XSalsa20Poly1305::new(keys.encryption_key().into())
            .encrypt(&nonce.into(), inner.as_slice())
            .unwrap();
        Envelope::new(CompressionAlgorithm::None, outer_key_id, nonce, ciphertext)
            .to_bytes()
            .unwrap()
    }

    #[test]
    fn test_vault_encrypt_decrypt_round_trip() {
        let vault = test_vault();
        let plaintext = b"alice@example.com";

        let ciphertext = vault.encrypt(Some(plaintext)).unwrap().unwrap();
        let decrypted = vault.decrypt(Some(&ciphertext)).unwrap().unwrap();

        assert_eq!(plaintext, &decrypted[..]);
    }

    #[test]
    fn test_vault_null_passthrough() {
        let vault = test_vault();
        assert_eq!(vault.encrypt(None).unwrap(), None);
        assert_eq!(vault.decrypt(None).unwrap(), None);
        assert_eq!(vault.encrypt_with_key("key_b", None).unwrap(), None);
        assert_eq!(vault.decrypt_with_key("key_b", None).unwrap(), None);
    }

    #[test]
    fn test_null_short_circuits_before_key_lookup() {
        let vault = test_vault();
        assert_eq!(vault.encrypt_with_key("missing", None).unwrap(), None);
    }

    #[test]
    fn test_vault_empty_plaintext() {
        let vault = test_vault();
        let ciphertext = vault.encrypt(Some(b"")).unwrap().unwrap();
        let decrypted = vault.decrypt(Some(&ciphertext)).unwrap().unwrap();

        assert!(decrypted.is_empty());
    }

    #[test]
    fn test_vault_unicode_plaintext() {
        let vault = test_vault();
        let plaintext = "Grüße, 世界 🌍".as_bytes();
        let ciphertext = vault.encrypt(Some(plaintext)).unwrap().unwrap();

        assert_eq!(vault.decrypt(Some(&ciphertext)).unwrap().unwrap(), plaintext);
    }

    #[test]
    fn test_vault_large_plaintext() {
        let vault = test_vault();
        let plaintext: Vec<u8> = (0..1_200_000u32).map(|i| (i % 251) as u8).collect();

        let ciphertext = vault.encrypt(Some(&plaintext)).unwrap().unwrap();
        let decrypted = vault.decrypt(Some(&ciphertext)).unwrap().unwrap();

        assert_eq!(plaintext, decrypted);
    }

    #[test]
    fn test_compressible_plaintext_above_ceiling_round_trips() {
        let vault = test_vault();
        let plaintext = vec![b'a'; compression::MAX_DECOMPRESSED_SIZE];

        let ciphertext = vault.encrypt(Some(&plaintext)).unwrap().unwrap();
        assert_eq!(ciphertext[0], CompressionAlgorithm::None.as_u8());

        let decrypted = vault.decrypt(Some(&ciphertext)).unwrap().unwrap();
        assert_eq!(decrypted.len(), plaintext.len());
        assert!(decrypted == plaintext);
    }

    #[test]
    fn test_config_is_kept() {
        let config = VaultConfig::default()
            .with_compression_algorithm(CompressionAlgorithm::None)
            .with_compression_threshold(16);
        let vault = Vault::new(&registry(), config.clone()).unwrap();
        assert_eq!(vault.config(), &config);

        let ciphertext = vault.encrypt(Some(&b"0123456789".repeat(100))).unwrap().unwrap();
        assert_eq!(ciphertext[0], CompressionAlgorithm::None.as_u8());
    }

    #[test]
    fn test_envelope_names_default_key() {
        let vault = test_vault();
        let ciphertext = vault.encrypt(Some(b"x")).unwrap().unwrap();
        assert_eq!(crate::envelope::peek_key_id(&ciphertext).unwrap(), "key_a");
    }

    #[test]
    fn test_nonces_never_repeat() {
        let vault = test_vault();
        let mut nonces = HashSet::new();
        let mut envelopes = HashSet::new();

        for _ in 0..1000 {
            let ciphertext = vault.encrypt(Some(b"same plaintext")).unwrap().unwrap();
            let envelope = Envelope::from_bytes(&ciphertext).unwrap();
            assert!(nonces.insert(*envelope.nonce()));
            assert!(envelopes.insert(ciphertext));
        }
    }

    #[test]
    fn test_repetitive_data_shrinks() {
        let vault = test_vault();
        let plaintext = b"0123456789".repeat(1000);

        let ciphertext = vault.encrypt(Some(&plaintext)).unwrap().unwrap();
        assert!(ciphertext.len() < plaintext.len());
        assert_eq!(ciphertext[0], CompressionAlgorithm::Zstd.as_u8());
        assert_eq!(vault.decrypt(Some(&ciphertext)).unwrap().unwrap(), plaintext);
    }

    #[test]
    fn test_small_data_is_not_compressed() {
        let vault = test_vault();
        let ciphertext = vault.encrypt(Some(&b"a".repeat(100))).unwrap().unwrap();
        assert_eq!(ciphertext[0], CompressionAlgorithm::None.as_u8());
    }

    #[test]
    fn test_compression_disabled() {
        let vault = Vault::new(&registry(), VaultConfig::default().without_compression()).unwrap();
        let plaintext = b"0123456789".repeat(1000);

        let ciphertext = vault.encrypt(Some(&plaintext)).unwrap().unwrap();
        assert_eq!(ciphertext[0], CompressionAlgorithm::None.as_u8());
        assert!(ciphertext.len() > plaintext.len());
        assert_eq!(vault.decrypt(Some(&ciphertext)).unwrap().unwrap(), plaintext);
    }

    #[test]
    fn test_explicit_key_round_trip() {
        let vault = test_vault();
        let ciphertext = vault.encrypt_with_key("key_b", Some(b"bob")).unwrap().unwrap();

        assert_eq!(crate::envelope::peek_key_id(&ciphertext).unwrap(), "key_b");
        assert_eq!(vault.decrypt_with_key("key_b", Some(&ciphertext)).unwrap().unwrap(), b"bob");
        assert_eq!(vault.decrypt(Some(&ciphertext)).unwrap().unwrap(), b"bob");
    }

    #[test]
    fn test_explicit_key_mismatch() {
        let vault = test_vault();
        let ciphertext = vault.encrypt_with_key("key_b", Some(b"bob")).unwrap().unwrap();

        let result = vault.decrypt_with_key("key_a", Some(&ciphertext));
        assert!(matches!(result, Err(Error::KeyIdMismatch { .. })));
    }

    #[test]
    fn test_unknown_key() {
        let vault = test_vault();
        assert!(matches!(
            vault.encrypt_with_key("missing", Some(b"x")),
            Err(Error::KeyNotFound(id)) if id == "missing"
        ));

        let foreign = forge(&[9u8; 32], "missing", "missing", b"x");
        assert!(matches!(vault.decrypt(Some(&foreign)), Err(Error::KeyNotFound(_))));
    }

    #[test]
    fn test_inner_key_id_binding() {
        let vault = test_vault();
        let confused = forge(&KEY_A, "key_a", "key_b", b"payload");

        let result = vault.decrypt(Some(&confused));
        assert!(matches!(result, Err(Error::KeyIdMismatch { .. })));
    }

    #[test]
    fn test_forged_envelope_with_matching_ids_decrypts() {
        let vault = test_vault();
        let honest = forge(&KEY_A, "key_a", "key_a", b"payload");
        assert_eq!(vault.decrypt(Some(&honest)).unwrap().unwrap(), b"payload");
    }

    #[test]
    fn test_swapped_outer_key_id_fails() {
        let vault = test_vault();
        let mut ciphertext = vault.encrypt(Some(b"alice@example.com")).unwrap().unwrap();

        // "key_a" -> "key_b", same length
        ciphertext[6] = b'b';
        assert_eq!(crate::envelope::peek_key_id(&ciphertext).unwrap(), "key_b");

        let result = vault.decrypt(Some(&ciphertext));
        assert!(matches!(result, Err(Error::DecryptionFailed | Error::KeyIdMismatch { .. })));
    }

    #[test]
    fn test_vault_corrupted_ciphertext_fails() {
        let vault = test_vault();
        let mut ciphertext = vault.encrypt(Some(b"alice@example.com")).unwrap().unwrap();

        let len = ciphertext.len();
        ciphertext[len - 1] ^= 0xFF;

        assert!(matches!(vault.decrypt(Some(&ciphertext)), Err(Error::DecryptionFailed)));
    }

    #[test]
    fn test_malformed_envelope() {
        let vault = test_vault();
        assert!(matches!(vault.decrypt(Some(&[0u8; 5])), Err(Error::InvalidFormat(_))));
    }

    #[test]
    fn test_reserved_flag_rejected_after_authentication() {
        let vault = test_vault();
        let mut ciphertext = vault.encrypt(Some(b"x")).unwrap().unwrap();
        ciphertext[0] = CompressionAlgorithm::Reserved.as_u8();

        let result = vault.decrypt(Some(&ciphertext));
        assert!(matches!(result, Err(Error::UnsupportedCompressionAlgorithm(0x02))));
    }

    #[test]
    fn test_seal() {
        let vault = test_vault();
        let sealed = vault.seal(Some(b"alice@example.com")).unwrap();

        assert_eq!(sealed.key_id, "key_a");
        assert_eq!(sealed.blind_index, vault.blind_index(Some(b"alice@example.com")));
        let ciphertext = sealed.ciphertext.unwrap();
        assert_eq!(vault.decrypt(Some(&ciphertext)).unwrap().unwrap(), b"alice@example.com");

        let null = vault.seal(None).unwrap();
        assert_eq!(null.ciphertext, None);
        assert_eq!(null.blind_index, None);
        assert_eq!(null.key_id, "key_a");
    }

    #[test]
    fn test_seal_str_indexes_normalized_form() {
        let vault = test_vault();
        let sealed = vault.seal_str(Some("  Alice@Example.COM "), Normalizer::Email).unwrap();

        assert_eq!(sealed.blind_index, vault.blind_index(Some(b"alice@example.com")));
        let stored = vault.decrypt(sealed.ciphertext.as_deref()).unwrap().unwrap();
        assert_eq!(stored, b"  Alice@Example.COM ");
    }

    #[test]
    fn test_construction_errors() {
        let empty = MemoryKeyRegistry::new();
        assert!(matches!(Vault::new(&empty, VaultConfig::default()), Err(Error::NoKeysConfigured)));

        let bad_default = registry().with_default("key_z");
        assert!(matches!(
            Vault::new(&bad_default, VaultConfig::default()),
            Err(Error::DefaultKeyNotFound(id)) if id == "key_z"
        ));

        let short_key = MemoryKeyRegistry::new().with_key("k", vec![1u8; 16]);
        assert!(matches!(
            Vault::new(&short_key, VaultConfig::default()),
            Err(Error::InvalidKeySize { expected: 32, actual: 16 })
        ));

        let long_id = MemoryKeyRegistry::new().with_key("k".repeat(256), KEY_A);
        assert!(matches!(Vault::new(&long_id, VaultConfig::default()), Err(Error::InvalidKeyId(_))));
    }

    #[test]
    fn test_registry_order_is_kept() {
        let vault = Vault::new(&registry().with_default("key_b"), VaultConfig::default()).unwrap();
        assert_eq!(vault.default_key_id(), "key_b");
        assert_eq!(vault.active_key_ids(), ["key_a", "key_b"]);
    }

    #[test]
    fn test_explicit_key_after_close_returns_error() {
        let vault = test_vault();
        let ciphertext = vault.encrypt(Some(b"x")).unwrap().unwrap();
        vault.close();

        assert!(vault.is_closed());
        assert!(matches!(vault.encrypt_with_key("key_a", Some(b"x")), Err(Error::ClosedEngine)));
        assert!(matches!(
            vault.decrypt_with_key("key_a", Some(&ciphertext)),
            Err(Error::ClosedEngine)
        ));
        // Closed state is checked before the NULL short-circuit.
        assert!(matches!(vault.encrypt_with_key("key_a", None), Err(Error::ClosedEngine)));
    }

    #[test]
    #[should_panic(expected = "vault is closed")]
    fn test_encrypt_after_close_panics() {
        let vault = test_vault();
        vault.close();
        let _ = vault.encrypt(Some(b"x"));
    }

    #[test]
    #[should_panic(expected = "vault is closed")]
    fn test_decrypt_after_close_panics() {
        let vault = test_vault();
        vault.close();
        let _ = vault.decrypt(None);
    }

    #[test]
    fn test_close_is_idempotent_and_shared() {
        let vault = test_vault();
        let clone = vault.clone();

        vault.close();
        vault.close();

        assert!(clone.is_closed());
        assert!(matches!(clone.encrypt_with_key("key_a", Some(b"x")), Err(Error::ClosedEngine)));
    }

    #[test]
    fn test_close_scrubs_unshared_ring() {
        let vault = test_vault();
        let ring = vault.ring(EXPLICIT_KEY).unwrap();
        let weak = Arc::downgrade(&ring);
        drop(ring);

        vault.close();
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_concurrent_use() {
        let vault = test_vault();
        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let vault = vault.clone();
                std::thread::spawn(move || {
                    for j in 0..50u8 {
                        let plaintext = [i, j];
                        let ciphertext = vault.encrypt(Some(&plaintext)).unwrap().unwrap();
                        assert_eq!(vault.decrypt(Some(&ciphertext)).unwrap().unwrap(), plaintext);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }
}
