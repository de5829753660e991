//! File-based key registry for `SealDB`.
//!
//! This registry stores master keys in the filesystem and is suitable for
//! development, testing and single-host deployments.

#![warn(clippy::pedantic, clippy::nursery)]

use rand::{rngs::OsRng, RngCore};
use sealdb::envelope::validate_key_id;
use sealdb::error::KeyRegistryError;
use sealdb::kdf::KEY_SIZE;
use sealdb::key_registry::KeyRegistry;
use secrecy::{ExposeSecret, SecretVec};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Extension of master key files.
pub const KEY_EXTENSION: &str = "key";

/// Name of the file holding the default key id.
pub const CURRENT_FILE: &str = "current";

/// File-based key registry.
///
/// Keys are stored in the filesystem with the following structure:
/// ```text
/// keys/
/// ├── v1.key      (32 bytes, 0600 permissions)
/// ├── v2.key      (32 bytes, 0600 permissions)
/// └── current     (text file naming the default key: "v2")
/// ```
///
/// Every `.key` file in the directory is an active key. The default key comes
/// first in [`KeyRegistry::active_key_ids`], the rest follow in id order.
pub struct FileKeyRegistry {
    key_dir: PathBuf,
    keys: BTreeMap<String, SecretVec<u8>>,
    current: String,
}

impl FileKeyRegistry {
    /// Loads every key in `key_dir`.
    ///
    /// Without a `current` file, a directory holding exactly one key uses it
    /// as the default.
    ///
    /// # Arguments
    ///
    /// * `key_dir` - Directory containing key files
    ///
    /// # Errors
    ///
    /// - `KeyRegistryError::CreationFailed` if the directory does not exist
    /// - `KeyRegistryError::InvalidKey` for a key file that is not 32 bytes or has a bad id
    /// - `KeyRegistryError::NoDefaultKey` if the default cannot be determined
    /// - `KeyRegistryError::KeyNotFound` if `current` names a missing key
    /// - `KeyRegistryError::Io` if reading fails
    pub fn new(key_dir: impl Into<PathBuf>) -> Result<Self, KeyRegistryError> {
        let key_dir = key_dir.into();
        if !key_dir.is_dir() {
            return Err(KeyRegistryError::CreationFailed(format!(
                "Key directory does not exist: {}",
                key_dir.display()
            )));
        }

        let mut keys = BTreeMap::new();
        for entry in fs::read_dir(&key_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(KEY_EXTENSION) {
                continue;
            }
            let key_id = key_id_from_path(&path)?;
            let key = load_key(&path)?;
            keys.insert(key_id, key);
        }

        let current = match read_current(&key_dir)? {
            Some(current) => current,
            None if keys.len() == 1 => keys.keys().next().cloned().unwrap_or_default(),
            None => return Err(KeyRegistryError::NoDefaultKey),
        };
        if !keys.contains_key(&current) {
            return Err(KeyRegistryError::KeyNotFound(current));
        }

        tracing::debug!(
            key_dir = %key_dir.display(),
            keys = keys.len(),
            current = %current,
            "loaded key directory"
        );

        Ok(Self { key_dir, keys, current })
    }

    /// Initializes a new key directory with one fresh key as the default.
    ///
    /// # Errors
    ///
    /// Returns `KeyRegistryError::CreationFailed` if the directory already
    /// holds a `current` file, or any error from [`Self::generate_key`].
    pub fn init(key_dir: impl Into<PathBuf>, key_id: &str) -> Result<Self, KeyRegistryError> {
        let key_dir = key_dir.into();
        fs::create_dir_all(&key_dir)?;

        if key_dir.join(CURRENT_FILE).exists() {
            return Err(KeyRegistryError::CreationFailed(format!(
                "Key directory already initialized: {}",
                key_dir.display()
            )));
        }

        let mut registry =
            Self { key_dir, keys: BTreeMap::new(), current: key_id.to_string() };
        registry.generate_key(key_id)?;
        registry.set_current(key_id)?;
        Ok(registry)
    }

    /// Returns the directory keys are loaded from.
    #[must_use]
    pub fn key_dir(&self) -> &Path {
        &self.key_dir
    }

    /// Generates a random master key and writes it to `<key_id>.key`.
    ///
    /// The new key is active but not the default; see [`Self::set_current`].
    ///
    /// # Errors
    ///
    /// - `KeyRegistryError::InvalidKey` if `key_id` is not a valid key id
    /// - `KeyRegistryError::CreationFailed` if the key already exists or the entropy source fails
    /// - `KeyRegistryError::Io` if writing fails
    pub fn generate_key(&mut self, key_id: &str) -> Result<(), KeyRegistryError> {
        check_key_id(key_id)?;

        let path = self.key_path(key_id);
        if self.keys.contains_key(key_id) || path.exists() {
            return Err(KeyRegistryError::CreationFailed(format!("Key already exists: {key_id}")));
        }

        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        OsRng
            .try_fill_bytes(&mut key[..])
            .map_err(|e| KeyRegistryError::CreationFailed(format!("entropy source failure: {e}")))?;

        write_private(&path, &key[..])?;
        self.keys.insert(key_id.to_string(), SecretVec::new(key.to_vec()));

        tracing::info!(key_id = %key_id, "generated master key");
        Ok(())
    }

    /// Makes `key_id` the default key and records it in the `current` file.
    ///
    /// # Errors
    ///
    /// - `KeyRegistryError::KeyNotFound` if `key_id` is not loaded
    /// - `KeyRegistryError::Io` if writing fails
    pub fn set_current(&mut self, key_id: &str) -> Result<(), KeyRegistryError> {
        if !self.keys.contains_key(key_id) {
            return Err(KeyRegistryError::KeyNotFound(key_id.to_string()));
        }

        fs::write(self.key_dir.join(CURRENT_FILE), format!("{key_id}\n"))?;
        self.current = key_id.to_string();

        tracing::info!(key_id = %key_id, "default key changed");
        Ok(())
    }

    fn key_path(&self, key_id: &str) -> PathBuf {
        self.key_dir.join(format!("{key_id}.{KEY_EXTENSION}"))
    }
}

impl KeyRegistry for FileKeyRegistry {
    fn get_key(&self, key_id: &str) -> Result<SecretVec<u8>, KeyRegistryError> {
        self.keys
            .get(key_id)
            .map(|key| SecretVec::new(key.expose_secret().clone()))
            .ok_or_else(|| KeyRegistryError::KeyNotFound(key_id.to_string()))
    }

    fn default_key_id(&self) -> String {
        self.current.clone()
    }

    fn active_key_ids(&self) -> Vec<String> {
        std::iter::once(self.current.clone())
            .chain(self.keys.keys().filter(|id| **id != self.current).cloned())
            .collect()
    }
}

/// Key ids become file names, so path separators are rejected on top of the
/// envelope's length rules.
fn check_key_id(key_id: &str) -> Result<(), KeyRegistryError> {
    validate_key_id(key_id).map_err(|e| KeyRegistryError::InvalidKey(e.to_string()))?;
    if key_id == "." || key_id == ".." || key_id.contains(['/', '\\', '\0']) {
        return Err(KeyRegistryError::InvalidKey(format!("key id is not a file name: {key_id}")));
    }
    Ok(())
}

fn key_id_from_path(path: &Path) -> Result<String, KeyRegistryError> {
    let key_id = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .ok_or_else(|| {
            KeyRegistryError::InvalidKey(format!("key file name is not UTF-8: {}", path.display()))
        })?;
    check_key_id(key_id)?;
    Ok(key_id.to_string())
}

fn load_key(path: &Path) -> Result<SecretVec<u8>, KeyRegistryError> {
    let data = Zeroizing::new(fs::read(path)?);
    if data.len() != KEY_SIZE {
        return Err(KeyRegistryError::InvalidKey(format!(
            "{} must be exactly {KEY_SIZE} bytes, got {}",
            path.display(),
            data.len()
        )));
    }
    Ok(SecretVec::new(data.to_vec()))
}

fn read_current(key_dir: &Path) -> Result<Option<String>, KeyRegistryError> {
    let path = key_dir.join(CURRENT_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let current = fs::read_to_string(path)?.trim().to_string();
    if current.is_empty() {
        return Err(KeyRegistryError::NoDefaultKey);
    }
    Ok(Some(current))
}

fn write_private(path: &Path, data: &[u8]) -> Result<(), KeyRegistryError> {
    fs::write(path, data)?;

    // Owner-only read/write.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}
