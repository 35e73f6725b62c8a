use thiserror::Error;

/// Errors from cryptographic primitives.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Scheme tag is not one this implementation can instantiate.
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    /// Key bytes could not be parsed for the declared scheme.
    #[error("invalid key data")]
    InvalidKey,

    /// A freshly generated or loaded key failed its self-check.
    #[error("key failed self-validation")]
    KeyValidation,

    /// Signature did not verify.
    #[error("signature verification failed")]
    BadSignature,

    /// CMAC did not verify.
    #[error("mac verification failed")]
    BadMac,

    /// Asymmetric or symmetric encryption failed.
    #[error("encryption failed")]
    EncryptFailed,

    /// Decryption or AEAD authentication failed.
    #[error("decryption failed")]
    DecryptFailed,

    /// Password-based key derivation failed.
    #[error("key derivation failed")]
    KdfFailed,

    /// The operating system RNG was unavailable.
    #[error("random number generator failure")]
    Rng,
}
