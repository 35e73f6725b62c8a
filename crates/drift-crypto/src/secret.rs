//! The symmetric account secret shared across a device fleet.
//!
//! One `SecretKey` per generation; payloads are sealed with ChaCha20Poly1305
//! under a fresh random salt (the AEAD nonce) per message.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::rng::fill_random;

pub const CHACHA20_POLY1305: &str = "ChaCha20Poly1305";

pub const SECRET_KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 12;

/// One generation of the account secret.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey {
    bytes: [u8; SECRET_KEY_LEN],
}

impl SecretKey {
    /// Generate a fresh random secret.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; SECRET_KEY_LEN];
        fill_random(&mut bytes)?;
        Ok(Self { bytes })
    }

    /// Reconstruct a secret delivered by a peer, checking the scheme tag.
    pub fn from_bytes(scheme: &str, bytes: &[u8]) -> Result<Self, CryptoError> {
        if scheme != CHACHA20_POLY1305 {
            return Err(CryptoError::UnsupportedScheme(scheme.to_string()));
        }
        let bytes: [u8; SECRET_KEY_LEN] =
            bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self { bytes })
    }

    pub fn scheme(&self) -> &'static str {
        CHACHA20_POLY1305
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_KEY_LEN] {
        &self.bytes
    }

    /// AEAD-seal `plaintext` under a freshly generated salt.
    /// Returns `(salt, ciphertext)`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
        let mut salt = [0u8; SALT_LEN];
        fill_random(&mut salt)?;

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.bytes));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&salt), plaintext)
            .map_err(|_| CryptoError::EncryptFailed)?;
        Ok((salt.to_vec(), ciphertext))
    }

    /// AEAD-open a payload sealed with [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, salt: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if salt.len() != SALT_LEN {
            return Err(CryptoError::DecryptFailed);
        }
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.bytes));
        cipher
            .decrypt(Nonce::from_slice(salt), ciphertext)
            .map_err(|_| CryptoError::DecryptFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = SecretKey::generate().unwrap();
        let (salt, ct) = key.encrypt(b"change payload").unwrap();
        assert_eq!(key.decrypt(&salt, &ct).unwrap(), b"change payload");
    }

    #[test]
    fn fresh_salt_per_encryption() {
        let key = SecretKey::generate().unwrap();
        let (s1, c1) = key.encrypt(b"same").unwrap();
        let (s2, c2) = key.encrypt(b"same").unwrap();
        assert_ne!(s1, s2);
        assert_ne!(c1, c2);
    }

    #[test]
    fn wrong_key_fails() {
        let a = SecretKey::generate().unwrap();
        let b = SecretKey::generate().unwrap();
        let (salt, ct) = a.encrypt(b"data").unwrap();
        assert!(b.decrypt(&salt, &ct).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = SecretKey::generate().unwrap();
        let (salt, mut ct) = key.encrypt(b"data").unwrap();
        ct[0] ^= 0xFF;
        assert!(key.decrypt(&salt, &ct).is_err());
    }

    #[test]
    fn scheme_tag_is_checked() {
        let key = SecretKey::generate().unwrap();
        assert!(SecretKey::from_bytes("AES-256-EAX", key.as_bytes()).is_err());
        assert!(SecretKey::from_bytes(CHACHA20_POLY1305, key.as_bytes()).is_ok());
        assert!(SecretKey::from_bytes(CHACHA20_POLY1305, b"short").is_err());
    }
}
