//! Export key derivation for account transfer between devices.
//!
//! A *trusted* export derives the key from a user-chosen password with
//! Argon2id and a random salt; the importing device re-derives it from the
//! typed password. An *untrusted* export uses a random key that never leaves
//! the exporting side, forcing an interactive acceptance step.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::rng::fill_random;

pub const EXPORT_SCHEME_ARGON2ID: &str = "Argon2id";
pub const EXPORT_SCHEME_RANDOM: &str = "Random";

pub const EXPORT_KEY_LEN: usize = 32;
pub const EXPORT_SALT_LEN: usize = 16;

/// A derived export key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ExportKey {
    bytes: [u8; EXPORT_KEY_LEN],
}

impl ExportKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; EXPORT_KEY_LEN] =
            bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; EXPORT_KEY_LEN] {
        &self.bytes
    }
}

/// Generate an export key. With a password the key is derived with Argon2id
/// under a random salt; without, the key itself is random and the scheme tag
/// records that no password was involved.
///
/// Returns `(scheme, salt, key)`.
pub fn generate_export_key(
    password: Option<&str>,
) -> Result<(String, Vec<u8>, ExportKey), CryptoError> {
    let mut salt = [0u8; EXPORT_SALT_LEN];
    fill_random(&mut salt)?;

    match password {
        Some(password) => {
            let key = derive_export_key(EXPORT_SCHEME_ARGON2ID, &salt, password)?;
            Ok((EXPORT_SCHEME_ARGON2ID.to_string(), salt.to_vec(), key))
        }
        None => {
            let mut bytes = [0u8; EXPORT_KEY_LEN];
            fill_random(&mut bytes)?;
            Ok((
                EXPORT_SCHEME_RANDOM.to_string(),
                salt.to_vec(),
                ExportKey { bytes },
            ))
        }
    }
}

/// Re-derive a trusted export key on the importing device.
pub fn derive_export_key(
    scheme: &str,
    salt: &[u8],
    password: &str,
) -> Result<ExportKey, CryptoError> {
    if scheme != EXPORT_SCHEME_ARGON2ID {
        return Err(CryptoError::UnsupportedScheme(scheme.to_string()));
    }
    let mut bytes = [0u8; EXPORT_KEY_LEN];
    argon2::Argon2::default()
        .hash_password_into(password.as_bytes(), salt, &mut bytes)
        .map_err(|_| CryptoError::KdfFailed)?;
    Ok(ExportKey { bytes })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_derivation_is_deterministic() {
        let (scheme, salt, key) = generate_export_key(Some("hunter2")).unwrap();
        assert_eq!(scheme, EXPORT_SCHEME_ARGON2ID);
        let again = derive_export_key(&scheme, &salt, "hunter2").unwrap();
        assert_eq!(key.as_bytes(), again.as_bytes());
    }

    #[test]
    fn wrong_password_differs() {
        let (scheme, salt, key) = generate_export_key(Some("hunter2")).unwrap();
        let other = derive_export_key(&scheme, &salt, "hunter3").unwrap();
        assert_ne!(key.as_bytes(), other.as_bytes());
    }

    #[test]
    fn untrusted_export_is_random() {
        let (scheme, _, a) = generate_export_key(None).unwrap();
        let (_, _, b) = generate_export_key(None).unwrap();
        assert_eq!(scheme, EXPORT_SCHEME_RANDOM);
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn random_scheme_cannot_be_rederived() {
        assert!(derive_export_key(EXPORT_SCHEME_RANDOM, &[0u8; 16], "pw").is_err());
    }
}
