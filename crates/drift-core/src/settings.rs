//! Hierarchical persistent settings.
//!
//! All long-lived connector and controller state lives here under exact
//! string paths. Lookups fall back to the compiled-in defaults when a key is
//! absent (the connector implements that policy in its `s_value`); this
//! module is the raw store.

use std::collections::BTreeMap;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::error;
use uuid::Uuid;

use crate::errors::SettingsError;

/// Exact settings key paths.
pub mod keys {
    pub const ENABLED: &str = "enabled";
    pub const REMOTE_GROUP: &str = "remote";
    pub const REMOTE_URL: &str = "remote/url";
    pub const ACCESS_KEY: &str = "remote/accessKey";
    pub const HEADERS: &str = "remote/headers";
    pub const KEEPALIVE_TIMEOUT: &str = "remote/keepaliveTimeout";
    pub const DEVICE_ID: &str = "deviceId";
    pub const DEVICE_NAME: &str = "deviceName";
    pub const IMPORT_GROUP: &str = "import";
    pub const IMPORT_NONCE: &str = "import/nonce";
    pub const IMPORT_PARTNER: &str = "import/partner";
    pub const IMPORT_SCHEME: &str = "import/scheme";
    pub const IMPORT_CMAC: &str = "import/cmac";
    pub const IMPORT_KEY: &str = "import/key";
    pub const SEND_CMAC: &str = "sendCmac";
    pub const SIGN_SCHEME: &str = "scheme/signing";
    pub const CRYPT_SCHEME: &str = "scheme/encryption";
    pub const KEYS_ALL: &str = "keys/all";
    pub const KEYS_ACTIVE: &str = "keys/active";
    pub const KEYS_PENDING: &str = "keys/pending";
    pub const KEYS_SCHEME: &str = "keys/scheme";
}

/// Storage backend for the settings document.
pub trait SettingsBackend: Send + Sync {
    fn load(&self) -> Result<BTreeMap<String, Value>, SettingsError>;
    fn save(&self, values: &BTreeMap<String, Value>) -> Result<(), SettingsError>;
}

/// Volatile backend for tests.
pub struct MemoryBackend;

impl SettingsBackend for MemoryBackend {
    fn load(&self) -> Result<BTreeMap<String, Value>, SettingsError> {
        Ok(BTreeMap::new())
    }

    fn save(&self, _values: &BTreeMap<String, Value>) -> Result<(), SettingsError> {
        Ok(())
    }
}

/// Flat JSON document on disk, one entry per settings path.
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SettingsBackend for JsonFileBackend {
    fn load(&self) -> Result<BTreeMap<String, Value>, SettingsError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = std::fs::read(&self.path)?;
        let values: BTreeMap<String, Value> = serde_json::from_slice(&raw)
            .map_err(|_| SettingsError::BadValue(self.path.display().to_string()))?;
        Ok(values)
    }

    fn save(&self, values: &BTreeMap<String, Value>) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_vec_pretty(values)
            .map_err(|_| SettingsError::BadValue(self.path.display().to_string()))?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }
}

/// The settings store. Mutations are written through to the backend
/// immediately; write failures are logged, not propagated, so a broken disk
/// degrades to volatile settings rather than wedging the connector.
pub struct Settings {
    values: RwLock<BTreeMap<String, Value>>,
    backend: Box<dyn SettingsBackend>,
}

impl Settings {
    pub fn new(backend: Box<dyn SettingsBackend>) -> Result<Self, SettingsError> {
        let values = backend.load()?;
        Ok(Self {
            values: RwLock::new(values),
            backend,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            values: RwLock::new(BTreeMap::new()),
            backend: Box::new(MemoryBackend),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.read().contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.read().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: Value) {
        let mut values = self.values.write();
        values.insert(key.to_string(), value);
        self.persist(&values);
    }

    pub fn remove(&self, key: &str) {
        let mut values = self.values.write();
        if values.remove(key).is_some() {
            self.persist(&values);
        }
    }

    /// Remove a key and its whole subtree (`group` plus every `group/...`).
    pub fn remove_group(&self, group: &str) {
        let prefix = format!("{group}/");
        let mut values = self.values.write();
        let before = values.len();
        values.retain(|k, _| k != group && !k.starts_with(&prefix));
        if values.len() != before {
            self.persist(&values);
        }
    }

    /// Immediate child names under `group` (e.g. header names under
    /// `remote/headers`).
    pub fn child_keys(&self, group: &str) -> Vec<String> {
        let prefix = format!("{group}/");
        self.values
            .read()
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .map(|rest| rest.to_string())
            .collect()
    }

    fn persist(&self, values: &BTreeMap<String, Value>) {
        if let Err(err) = self.backend.save(values) {
            error!("failed to persist settings: {err}");
        }
    }

    // ------------------------------------------------------------------
    // Typed accessors
    // ------------------------------------------------------------------

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_str().map(String::from))
    }

    pub fn set_str(&self, key: &str, value: &str) {
        self.set(key, Value::String(value.to_string()));
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.as_bool())
    }

    pub fn set_bool(&self, key: &str, value: bool) {
        self.set(key, Value::Bool(value));
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.get(key)
            .and_then(|v| v.as_u64())
            .and_then(|v| u32::try_from(v).ok())
    }

    pub fn set_u32(&self, key: &str, value: u32) {
        self.set(key, Value::from(value));
    }

    pub fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        self.get_str(key).and_then(|s| BASE64.decode(s).ok())
    }

    pub fn set_bytes(&self, key: &str, value: &[u8]) {
        self.set_str(key, &BASE64.encode(value));
    }

    pub fn get_uuid(&self, key: &str) -> Option<Uuid> {
        self.get_str(key).and_then(|s| Uuid::parse_str(&s).ok())
    }

    pub fn set_uuid(&self, key: &str, value: &Uuid) {
        self.set_str(key, &value.to_string());
    }

    pub fn get_u32_list(&self, key: &str) -> Vec<u32> {
        self.get(key)
            .and_then(|v| {
                v.as_array().map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_u64())
                        .filter_map(|v| u32::try_from(v).ok())
                        .collect()
                })
            })
            .unwrap_or_default()
    }

    pub fn set_u32_list(&self, key: &str, values: &[u32]) {
        self.set(key, Value::from(values.to_vec()));
    }
}
