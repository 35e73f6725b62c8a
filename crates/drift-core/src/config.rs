//! Remote server configuration and compiled-in defaults.

use std::collections::BTreeMap;
use std::time::Duration;

use drift_crypto::asym::{EncryptionScheme, SignatureScheme};

/// Connection parameters for the relay server. Value semantics with
/// structural equality; either compiled in via [`Defaults`], overridden in
/// settings, or carried inside an account export.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoteConfig {
    pub url: String,
    pub access_key: String,
    /// Extra headers for the HTTP upgrade request.
    pub headers: BTreeMap<String, String>,
    /// Keepalive ping period in minutes; `0` disables the keepalive.
    pub keepalive_timeout: u32,
}

impl RemoteConfig {
    pub fn new(url: impl Into<String>, access_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            access_key: access_key.into(),
            headers: BTreeMap::new(),
            keepalive_timeout: DEFAULT_KEEPALIVE_MINUTES,
        }
    }
}

pub const DEFAULT_KEEPALIVE_MINUTES: u32 = 5;

/// Compiled-in defaults. Settings values take precedence over everything
/// here.
#[derive(Debug, Clone)]
pub struct Defaults {
    pub remote: RemoteConfig,
    /// Signature scheme used when generating a new device identity.
    pub sign_scheme: SignatureScheme,
    /// Encryption scheme used when generating a new device identity.
    pub crypt_scheme: EncryptionScheme,
    /// Modulus size for RSA key generation.
    pub rsa_bits: usize,
    /// Upper bound for the ordered-shutdown deadline.
    pub global_timeout: Duration,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            remote: RemoteConfig::default(),
            sign_scheme: SignatureScheme::RsaPssSha3_512,
            crypt_scheme: EncryptionScheme::RsaOaepSha3_512,
            rsa_bits: 2048,
            global_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_config_structural_equality() {
        let mut a = RemoteConfig::new("wss://sync.example.com", "key");
        let b = a.clone();
        assert_eq!(a, b);
        a.headers.insert("X-Tenant".into(), "demo".into());
        assert_ne!(a, b);
    }
}
