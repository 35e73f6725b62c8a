//! CMAC-based proofs of knowledge.
//!
//! All proofs in the protocol are AES-256-CMAC tags keyed by a 32-byte
//! shared secret (the account secret or an export key). Verification is
//! constant-time.

use aes::Aes256;
use cmac::{Cmac, Mac};

use crate::error::CryptoError;

pub const AES_256_CMAC: &str = "AES-256-CMAC";

/// Compute the CMAC of `data` under `key` (32 bytes).
pub fn create_cmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut mac = Cmac::<Aes256>::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Verify a CMAC tag in constant time.
pub fn verify_cmac(key: &[u8], data: &[u8], tag: &[u8]) -> Result<(), CryptoError> {
    let mut mac = Cmac::<Aes256>::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)?;
    mac.update(data);
    mac.verify_slice(tag).map_err(|_| CryptoError::BadMac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmac_round_trip() {
        let key = [3u8; 32];
        let tag = create_cmac(&key, b"proof data").unwrap();
        verify_cmac(&key, b"proof data", &tag).unwrap();
    }

    #[test]
    fn wrong_key_or_data_fails() {
        let key = [3u8; 32];
        let other = [4u8; 32];
        let tag = create_cmac(&key, b"proof data").unwrap();
        assert!(verify_cmac(&other, b"proof data", &tag).is_err());
        assert!(verify_cmac(&key, b"other data", &tag).is_err());
    }

    #[test]
    fn truncated_tag_fails() {
        let key = [3u8; 32];
        let tag = create_cmac(&key, b"proof data").unwrap();
        assert!(verify_cmac(&key, b"proof data", &tag[..8]).is_err());
    }

    #[test]
    fn short_key_is_rejected() {
        assert!(create_cmac(&[0u8; 16], b"x").is_err());
    }
}
