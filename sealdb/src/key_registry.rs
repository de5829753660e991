//! Key registry abstraction for master key lookup.

use crate::error::KeyRegistryError;
use secrecy::{ExposeSecret, SecretVec};

/// Supplies master keys to a [`Vault`](crate::vault::Vault).
///
/// The vault reads every active key once, at construction, and derives its
/// subkeys from them; the registry is not consulted afterwards.
///
/// Implementations must be thread-safe (`Send + Sync`).
///
/// # Example
///
/// ```rust,ignore
/// use sealdb::key_registry::KeyRegistry;
///
/// struct MyRegistry;
///
/// impl KeyRegistry for MyRegistry {
///     fn get_key(&self, key_id: &str) -> Result<SecretVec<u8>, KeyRegistryError> {
///         // Implementation
///     }
///     // ... other methods
/// }
/// ```
pub trait KeyRegistry: Send + Sync {
    /// Returns the 32-byte master key registered under `key_id`.
    ///
    /// # Errors
    ///
    /// Returns `KeyRegistryError::KeyNotFound` if no such key exists.
    fn get_key(&self, key_id: &str) -> Result<SecretVec<u8>, KeyRegistryError>;

    /// Returns the identifier new data is encrypted under.
    fn default_key_id(&self) -> String;

    /// Returns every key id that may still appear in stored data, in a stable order.
    ///
    /// The order determines the fragment order of generated search conditions.
    fn active_key_ids(&self) -> Vec<String>;
}

/// In-memory registry assembled in code.
///
/// Active key order is insertion order. The first key added becomes the
/// default unless [`MemoryKeyRegistry::with_default`] says otherwise.
///
/// # Example
///
/// ```
/// use sealdb::key_registry::{KeyRegistry, MemoryKeyRegistry};
///
/// let registry = MemoryKeyRegistry::new()
///     .with_key("v1", [1u8; 32])
///     .with_key("v2", [2u8; 32])
///     .with_default("v2");
///
/// assert_eq!(registry.default_key_id(), "v2");
/// assert_eq!(registry.active_key_ids(), vec!["v1", "v2"]);
/// ```
#[derive(Default)]
pub struct MemoryKeyRegistry {
    keys: Vec<(String, SecretVec<u8>)>,
    default_key_id: Option<String>,
}

impl MemoryKeyRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a master key. A later key with the same id replaces the earlier one.
    #[must_use]
    pub fn with_key(mut self, key_id: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        let key_id = key_id.into();
        let key = SecretVec::new(key.into());
        if let Some(slot) = self.keys.iter_mut().find(|(id, _)| *id == key_id) {
            slot.1 = key;
        } else {
            self.keys.push((key_id, key));
        }
        self
    }

    /// Sets the default key id.
    #[must_use]
    pub fn with_default(mut self, key_id: impl Into<String>) -> Self {
        self.default_key_id = Some(key_id.into());
        self
    }
}

impl KeyRegistry for MemoryKeyRegistry {
    fn get_key(&self, key_id: &str) -> Result<SecretVec<u8>, KeyRegistryError> {
        self.keys
            .iter()
            .find(|(id, _)| id == key_id)
            .map(|(_, key)| SecretVec::new(key.expose_secret().clone()))
            .ok_or_else(|| KeyRegistryError::KeyNotFound(key_id.to_string()))
    }

    fn default_key_id(&self) -> String {
        self.default_key_id
            .clone()
            .or_else(|| self.keys.first().map(|(id, _)| id.clone()))
            .unwrap_or_default()
    }

    fn active_key_ids(&self) -> Vec<String> {
        self.keys.iter().map(|(id, _)| id.clone()).collect()
    }
}
