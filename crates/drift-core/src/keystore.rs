//! Platform secret store adapter.
//!
//! Private key bytes are sealed under canonical names
//! (`device/<uuid>/sign-key`, `device/<uuid>/crypt-key`, and
//! `device/<uuid>/key/<index>` for account-secret generations). Unsealed
//! bytes are zeroized on drop.

use std::collections::HashMap;
use std::io::ErrorKind as IoErrorKind;
use std::path::PathBuf;

use zeroize::ZeroizeOnDrop;

use crate::errors::KeystoreError;

/// Unsealed key bytes; wiped from memory on drop.
#[derive(ZeroizeOnDrop)]
pub struct SealedKey(Vec<u8>);

impl SealedKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Opaque interface to a platform secret store.
pub trait Keystore: Send {
    /// Open the backing store. Must be called before any other operation;
    /// may be called again to retry after a failure.
    fn open(&mut self) -> Result<(), KeystoreError>;

    /// Close the backing store. Further operations require a new `open`.
    fn close(&mut self);

    fn store_key(&mut self, name: &str, key: &[u8]) -> Result<(), KeystoreError>;

    fn load_key(&self, name: &str) -> Result<SealedKey, KeystoreError>;

    fn delete_key(&mut self, name: &str) -> Result<(), KeystoreError>;

    fn contains(&self, name: &str) -> bool;
}

/// In-memory keystore for tests.
#[derive(Default)]
pub struct MemoryKeystore {
    entries: HashMap<String, Vec<u8>>,
    open: bool,
}

impl MemoryKeystore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Keystore for MemoryKeystore {
    fn open(&mut self) -> Result<(), KeystoreError> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn store_key(&mut self, name: &str, key: &[u8]) -> Result<(), KeystoreError> {
        if !self.open {
            return Err(KeystoreError::Unavailable("store not open".into()));
        }
        self.entries.insert(name.to_string(), key.to_vec());
        Ok(())
    }

    fn load_key(&self, name: &str) -> Result<SealedKey, KeystoreError> {
        if !self.open {
            return Err(KeystoreError::Unavailable("store not open".into()));
        }
        self.entries
            .get(name)
            .map(|k| SealedKey::new(k.clone()))
            .ok_or_else(|| KeystoreError::NotFound(name.to_string()))
    }

    fn delete_key(&mut self, name: &str) -> Result<(), KeystoreError> {
        self.entries.remove(name);
        Ok(())
    }

    fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}

/// File-per-key store with restrictive permissions. A development fallback;
/// production deployments plug a platform store (TPM, Keychain, libsecret)
/// in through the [`Keystore`] trait.
pub struct FileKeystore {
    key_dir: PathBuf,
    open: bool,
}

impl FileKeystore {
    pub fn new(key_dir: impl Into<PathBuf>) -> Self {
        Self {
            key_dir: key_dir.into(),
            open: false,
        }
    }

    fn key_path(&self, name: &str) -> PathBuf {
        // Canonical names contain '/' separators; map them onto the
        // directory tree below `key_dir`.
        let mut path = self.key_dir.clone();
        for part in name.split('/') {
            path.push(part);
        }
        path.set_extension("key");
        path
    }
}

impl Keystore for FileKeystore {
    fn open(&mut self) -> Result<(), KeystoreError> {
        std::fs::create_dir_all(&self.key_dir)?;
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn store_key(&mut self, name: &str, key: &[u8]) -> Result<(), KeystoreError> {
        if !self.open {
            return Err(KeystoreError::Unavailable("store not open".into()));
        }
        let path = self.key_path(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, key)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    fn load_key(&self, name: &str) -> Result<SealedKey, KeystoreError> {
        if !self.open {
            return Err(KeystoreError::Unavailable("store not open".into()));
        }
        match std::fs::read(self.key_path(name)) {
            Ok(bytes) => Ok(SealedKey::new(bytes)),
            Err(err) if err.kind() == IoErrorKind::NotFound => {
                Err(KeystoreError::NotFound(name.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn delete_key(&mut self, name: &str) -> Result<(), KeystoreError> {
        let path = self.key_path(name);
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == IoErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn contains(&self, name: &str) -> bool {
        self.key_path(name).exists()
    }
}

/// Canonical keystore entry names.
pub fn sign_key_name(device_id: &uuid::Uuid) -> String {
    format!("device/{device_id}/sign-key")
}

pub fn crypt_key_name(device_id: &uuid::Uuid) -> String {
    format!("device/{device_id}/crypt-key")
}

pub fn secret_key_name(device_id: &uuid::Uuid, index: u32) -> String {
    format!("device/{device_id}/key/{index}")
}
