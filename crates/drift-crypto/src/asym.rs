//! Scheme-tagged asymmetric key pairs.
//!
//! Private keys serialize as PKCS#8 DER, public keys as SPKI DER, so blobs
//! can be sealed into a platform keystore and shipped over the wire next to
//! their scheme tag.

use std::fmt;

use rand_core::CryptoRngCore;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::Oaep;
use sha3::{Digest, Sha3_512};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::hash;

pub const RSA_PSS_SHA3_512: &str = "RSA-PSS-SHA3-512";
pub const ECDSA_ECP_SHA3_512: &str = "ECDSA-ECP-SHA3-512";
pub const ECNR_ECP_SHA3_512: &str = "ECNR-ECP-SHA3-512";
pub const RSA_OAEP_SHA3_512: &str = "RSA-OAEP-SHA3-512";

const VALIDATION_ROUNDS: usize = 3;
const VALIDATION_PROBE: &[u8] = b"driftsync key validation probe";

/// Supported signature schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    RsaPssSha3_512,
    EcdsaEcpSha3_512,
}

impl SignatureScheme {
    pub fn tag(self) -> &'static str {
        match self {
            SignatureScheme::RsaPssSha3_512 => RSA_PSS_SHA3_512,
            SignatureScheme::EcdsaEcpSha3_512 => ECDSA_ECP_SHA3_512,
        }
    }

    /// Resolve a wire scheme tag. `ECNR-ECP-SHA3-512` is a known tag with no
    /// implementation in the ecosystem and is rejected like any other
    /// unsupported scheme.
    pub fn from_tag(tag: &str) -> Result<Self, CryptoError> {
        match tag {
            RSA_PSS_SHA3_512 => Ok(SignatureScheme::RsaPssSha3_512),
            ECDSA_ECP_SHA3_512 => Ok(SignatureScheme::EcdsaEcpSha3_512),
            other => Err(CryptoError::UnsupportedScheme(other.to_string())),
        }
    }
}

impl fmt::Display for SignatureScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Supported asymmetric encryption schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionScheme {
    RsaOaepSha3_512,
}

impl EncryptionScheme {
    pub fn tag(self) -> &'static str {
        match self {
            EncryptionScheme::RsaOaepSha3_512 => RSA_OAEP_SHA3_512,
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self, CryptoError> {
        match tag {
            RSA_OAEP_SHA3_512 => Ok(EncryptionScheme::RsaOaepSha3_512),
            other => Err(CryptoError::UnsupportedScheme(other.to_string())),
        }
    }
}

impl fmt::Display for EncryptionScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

enum SignPrivate {
    Rsa(rsa::RsaPrivateKey),
    Ecdsa(p256::SecretKey),
}

/// A device signing key pair.
pub struct SigningKeyPair {
    scheme: SignatureScheme,
    key: SignPrivate,
}

impl SigningKeyPair {
    /// Generate a fresh key pair. `rsa_bits` only applies to the RSA scheme.
    pub fn generate<R: CryptoRngCore>(
        scheme: SignatureScheme,
        rsa_bits: usize,
        rng: &mut R,
    ) -> Result<Self, CryptoError> {
        let key = match scheme {
            SignatureScheme::RsaPssSha3_512 => SignPrivate::Rsa(
                rsa::RsaPrivateKey::new(rng, rsa_bits).map_err(|_| CryptoError::KeyValidation)?,
            ),
            SignatureScheme::EcdsaEcpSha3_512 => SignPrivate::Ecdsa(p256::SecretKey::random(rng)),
        };
        let pair = Self { scheme, key };
        pair.validate()?;
        Ok(pair)
    }

    pub fn from_pkcs8_der(scheme: SignatureScheme, der: &[u8]) -> Result<Self, CryptoError> {
        let key = match scheme {
            SignatureScheme::RsaPssSha3_512 => SignPrivate::Rsa(
                rsa::RsaPrivateKey::from_pkcs8_der(der).map_err(|_| CryptoError::InvalidKey)?,
            ),
            SignatureScheme::EcdsaEcpSha3_512 => SignPrivate::Ecdsa(
                p256::SecretKey::from_pkcs8_der(der).map_err(|_| CryptoError::InvalidKey)?,
            ),
        };
        let pair = Self { scheme, key };
        pair.validate()?;
        Ok(pair)
    }

    pub fn scheme(&self) -> SignatureScheme {
        self.scheme
    }

    pub fn to_pkcs8_der(&self) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let doc = match &self.key {
            SignPrivate::Rsa(k) => k.to_pkcs8_der().map_err(|_| CryptoError::InvalidKey)?,
            SignPrivate::Ecdsa(k) => k.to_pkcs8_der().map_err(|_| CryptoError::InvalidKey)?,
        };
        Ok(Zeroizing::new(doc.as_bytes().to_vec()))
    }

    pub fn public_key(&self) -> SigningPublicKey {
        let key = match &self.key {
            SignPrivate::Rsa(k) => SignPublic::Rsa(k.to_public_key()),
            SignPrivate::Ecdsa(k) => SignPublic::Ecdsa(k.public_key()),
        };
        SigningPublicKey {
            scheme: self.scheme,
            key,
        }
    }

    pub fn public_der(&self) -> Result<Vec<u8>, CryptoError> {
        self.public_key().to_der()
    }

    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match &self.key {
            SignPrivate::Rsa(k) => {
                let signer = rsa::pss::SigningKey::<Sha3_512>::new(k.clone());
                let sig = signer
                    .try_sign_with_rng(&mut rand_core::OsRng, message)
                    .map_err(|_| CryptoError::BadSignature)?;
                Ok(sig.to_vec())
            }
            SignPrivate::Ecdsa(k) => {
                use p256::ecdsa::signature::hazmat::PrehashSigner;
                let signer = p256::ecdsa::SigningKey::from(k);
                let digest = Sha3_512::digest(message);
                let sig: p256::ecdsa::Signature = signer
                    .sign_prehash(digest.as_slice())
                    .map_err(|_| CryptoError::BadSignature)?;
                Ok(sig.to_bytes().to_vec())
            }
        }
    }

    /// Sign/verify round-trip self-check, run after generation and load.
    pub fn validate(&self) -> Result<(), CryptoError> {
        let public = self.public_key();
        for _ in 0..VALIDATION_ROUNDS {
            let sig = self.sign(VALIDATION_PROBE)?;
            public
                .verify(VALIDATION_PROBE, &sig)
                .map_err(|_| CryptoError::KeyValidation)?;
        }
        Ok(())
    }
}

enum SignPublic {
    Rsa(rsa::RsaPublicKey),
    Ecdsa(p256::PublicKey),
}

/// A peer's (or our own) verifying key.
pub struct SigningPublicKey {
    scheme: SignatureScheme,
    key: SignPublic,
}

impl SigningPublicKey {
    pub fn from_der(scheme: SignatureScheme, der: &[u8]) -> Result<Self, CryptoError> {
        let key = match scheme {
            SignatureScheme::RsaPssSha3_512 => SignPublic::Rsa(
                rsa::RsaPublicKey::from_public_key_der(der).map_err(|_| CryptoError::InvalidKey)?,
            ),
            SignatureScheme::EcdsaEcpSha3_512 => SignPublic::Ecdsa(
                p256::PublicKey::from_public_key_der(der).map_err(|_| CryptoError::InvalidKey)?,
            ),
        };
        Ok(Self { scheme, key })
    }

    pub fn from_tagged_der(tag: &str, der: &[u8]) -> Result<Self, CryptoError> {
        Self::from_der(SignatureScheme::from_tag(tag)?, der)
    }

    pub fn scheme(&self) -> SignatureScheme {
        self.scheme
    }

    pub fn to_der(&self) -> Result<Vec<u8>, CryptoError> {
        let doc = match &self.key {
            SignPublic::Rsa(k) => k.to_public_key_der().map_err(|_| CryptoError::InvalidKey)?,
            SignPublic::Ecdsa(k) => k.to_public_key_der().map_err(|_| CryptoError::InvalidKey)?,
        };
        Ok(doc.as_bytes().to_vec())
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        match &self.key {
            SignPublic::Rsa(k) => {
                let verifier = rsa::pss::VerifyingKey::<Sha3_512>::new(k.clone());
                let sig = rsa::pss::Signature::try_from(signature)
                    .map_err(|_| CryptoError::BadSignature)?;
                verifier
                    .verify(message, &sig)
                    .map_err(|_| CryptoError::BadSignature)
            }
            SignPublic::Ecdsa(k) => {
                use p256::ecdsa::signature::hazmat::PrehashVerifier;
                let verifier = p256::ecdsa::VerifyingKey::from(k);
                let digest = Sha3_512::digest(message);
                let sig = p256::ecdsa::Signature::from_slice(signature)
                    .map_err(|_| CryptoError::BadSignature)?;
                verifier
                    .verify_prehash(digest.as_slice(), &sig)
                    .map_err(|_| CryptoError::BadSignature)
            }
        }
    }
}

/// A device encryption key pair (RSA-OAEP).
pub struct EncryptionKeyPair {
    scheme: EncryptionScheme,
    key: rsa::RsaPrivateKey,
}

impl EncryptionKeyPair {
    pub fn generate<R: CryptoRngCore>(
        scheme: EncryptionScheme,
        rsa_bits: usize,
        rng: &mut R,
    ) -> Result<Self, CryptoError> {
        let EncryptionScheme::RsaOaepSha3_512 = scheme;
        let key = rsa::RsaPrivateKey::new(rng, rsa_bits).map_err(|_| CryptoError::KeyValidation)?;
        let pair = Self { scheme, key };
        pair.validate()?;
        Ok(pair)
    }

    pub fn from_pkcs8_der(scheme: EncryptionScheme, der: &[u8]) -> Result<Self, CryptoError> {
        let EncryptionScheme::RsaOaepSha3_512 = scheme;
        let key = rsa::RsaPrivateKey::from_pkcs8_der(der).map_err(|_| CryptoError::InvalidKey)?;
        let pair = Self { scheme, key };
        pair.validate()?;
        Ok(pair)
    }

    pub fn scheme(&self) -> EncryptionScheme {
        self.scheme
    }

    pub fn to_pkcs8_der(&self) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let doc = self.key.to_pkcs8_der().map_err(|_| CryptoError::InvalidKey)?;
        Ok(Zeroizing::new(doc.as_bytes().to_vec()))
    }

    pub fn public_key(&self) -> EncryptionPublicKey {
        EncryptionPublicKey {
            scheme: self.scheme,
            key: self.key.to_public_key(),
        }
    }

    pub fn public_der(&self) -> Result<Vec<u8>, CryptoError> {
        self.public_key().to_der()
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let plain = self
            .key
            .decrypt(Oaep::new::<Sha3_512>(), ciphertext)
            .map_err(|_| CryptoError::DecryptFailed)?;
        Ok(Zeroizing::new(plain))
    }

    /// Encrypt/decrypt round-trip self-check, run after generation and load.
    pub fn validate(&self) -> Result<(), CryptoError> {
        let public = self.public_key();
        for _ in 0..VALIDATION_ROUNDS {
            let ct = public
                .encrypt(VALIDATION_PROBE)
                .map_err(|_| CryptoError::KeyValidation)?;
            let pt = self.decrypt(&ct).map_err(|_| CryptoError::KeyValidation)?;
            if pt.as_slice() != VALIDATION_PROBE {
                return Err(CryptoError::KeyValidation);
            }
        }
        Ok(())
    }
}

/// A peer's (or our own) encryption public key.
pub struct EncryptionPublicKey {
    scheme: EncryptionScheme,
    key: rsa::RsaPublicKey,
}

impl EncryptionPublicKey {
    pub fn from_der(scheme: EncryptionScheme, der: &[u8]) -> Result<Self, CryptoError> {
        let EncryptionScheme::RsaOaepSha3_512 = scheme;
        let key =
            rsa::RsaPublicKey::from_public_key_der(der).map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self { scheme, key })
    }

    pub fn from_tagged_der(tag: &str, der: &[u8]) -> Result<Self, CryptoError> {
        Self::from_der(EncryptionScheme::from_tag(tag)?, der)
    }

    pub fn scheme(&self) -> EncryptionScheme {
        self.scheme
    }

    pub fn to_der(&self) -> Result<Vec<u8>, CryptoError> {
        let doc = self
            .key
            .to_public_key_der()
            .map_err(|_| CryptoError::InvalidKey)?;
        Ok(doc.as_bytes().to_vec())
    }

    pub fn encrypt(&self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.key
            .encrypt(&mut rand_core::OsRng, Oaep::new::<Sha3_512>(), message)
            .map_err(|_| CryptoError::EncryptFailed)
    }
}

/// A peer device's public key bundle, as carried in proof and key-exchange
/// messages.
pub struct PeerKeys {
    pub sign: SigningPublicKey,
    pub crypt: EncryptionPublicKey,
}

impl PeerKeys {
    /// Parse and validate both keys against their declared schemes.
    pub fn new(
        sign_tag: &str,
        sign_der: &[u8],
        crypt_tag: &str,
        crypt_der: &[u8],
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            sign: SigningPublicKey::from_tagged_der(sign_tag, sign_der)?,
            crypt: EncryptionPublicKey::from_tagged_der(crypt_tag, crypt_der)?,
        })
    }

    pub fn fingerprint(&self) -> Result<Vec<u8>, CryptoError> {
        Ok(hash::fingerprint(
            self.sign.scheme().tag(),
            &self.sign.to_der()?,
            self.crypt.scheme().tag(),
            &self.crypt.to_der()?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::seeded_rng;

    #[test]
    fn ecdsa_sign_verify_round_trip() {
        let mut rng = seeded_rng(b"test").unwrap();
        let pair = SigningKeyPair::generate(SignatureScheme::EcdsaEcpSha3_512, 0, &mut rng).unwrap();
        let sig = pair.sign(b"hello").unwrap();
        pair.public_key().verify(b"hello", &sig).unwrap();
        assert!(pair.public_key().verify(b"tampered", &sig).is_err());
    }

    #[test]
    fn ecdsa_pkcs8_round_trip() {
        let mut rng = seeded_rng(b"test").unwrap();
        let pair = SigningKeyPair::generate(SignatureScheme::EcdsaEcpSha3_512, 0, &mut rng).unwrap();
        let der = pair.to_pkcs8_der().unwrap();
        let restored = SigningKeyPair::from_pkcs8_der(SignatureScheme::EcdsaEcpSha3_512, &der).unwrap();
        let sig = restored.sign(b"data").unwrap();
        pair.public_key().verify(b"data", &sig).unwrap();
    }

    #[test]
    fn public_key_der_round_trip() {
        let mut rng = seeded_rng(b"test").unwrap();
        let pair = SigningKeyPair::generate(SignatureScheme::EcdsaEcpSha3_512, 0, &mut rng).unwrap();
        let der = pair.public_der().unwrap();
        let public = SigningPublicKey::from_tagged_der(ECDSA_ECP_SHA3_512, &der).unwrap();
        let sig = pair.sign(b"x").unwrap();
        public.verify(b"x", &sig).unwrap();
    }

    #[test]
    fn ecnr_tag_is_rejected() {
        assert!(matches!(
            SignatureScheme::from_tag(ECNR_ECP_SHA3_512),
            Err(CryptoError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn rsa_oaep_round_trip() {
        let mut rng = seeded_rng(b"test").unwrap();
        let pair =
            EncryptionKeyPair::generate(EncryptionScheme::RsaOaepSha3_512, 2048, &mut rng).unwrap();
        let secret = [7u8; 32];
        let ct = pair.public_key().encrypt(&secret).unwrap();
        let pt = pair.decrypt(&ct).unwrap();
        assert_eq!(pt.as_slice(), &secret);
    }

    #[test]
    fn rsa_pss_sign_verify() {
        let mut rng = seeded_rng(b"test").unwrap();
        let pair = SigningKeyPair::generate(SignatureScheme::RsaPssSha3_512, 2048, &mut rng).unwrap();
        let sig = pair.sign(b"signed payload").unwrap();
        pair.public_key().verify(b"signed payload", &sig).unwrap();
        assert!(pair.public_key().verify(b"other", &sig).is_err());
    }

    #[test]
    fn garbage_der_is_invalid() {
        assert!(matches!(
            SigningPublicKey::from_der(SignatureScheme::EcdsaEcpSha3_512, b"not der"),
            Err(CryptoError::InvalidKey)
        ));
    }
}
