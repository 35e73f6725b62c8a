//! Error types for the driftsync core.
//!
//! Errors fall into three bands: recoverable (close the socket and retry
//! with backoff), fatal (deactivate until the user intervenes), and
//! operation-failed (log and drop, connection stays up). Server-originated
//! errors arrive as protocol [`ErrorMessage`]s and are classified by their
//! `can_recover` flag.

use thiserror::Error;

use drift_proto::messages::{ErrorKind, ErrorMessage};

/// Keystore adapter errors.
#[derive(Debug, Error)]
pub enum KeystoreError {
    /// The backing store could not be opened.
    #[error("keystore unavailable: {0}")]
    Unavailable(String),

    /// No entry under the requested name.
    #[error("key not found: {0}")]
    NotFound(String),

    /// Read or write to the backing store failed.
    #[error("keystore I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Settings store errors.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("settings value for {0} has the wrong type")]
    BadValue(String),
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("transport disconnected")]
    Disconnected,

    #[error("transport I/O error: {0}")]
    Io(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("too many redirects")]
    TooManyRedirects,
}

/// Unified error type for core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("crypto error: {0}")]
    Crypto(#[from] drift_crypto::CryptoError),

    #[error("wire error: {0}")]
    Wire(#[from] drift_proto::WireError),

    #[error("keystore error: {0}")]
    Keystore(#[from] KeystoreError),

    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The device is not registered with a server.
    #[error("not registered with a server")]
    NotRegistered,

    /// No key material loaded for the current identity.
    #[error("no key material loaded")]
    NoKeyMaterial,

    /// A payload referenced a secret generation this device does not hold.
    #[error("unknown key generation: {0}")]
    UnknownKeyGeneration(u32),

    /// A proof arrived for an export nonce that was never issued.
    #[error("proof for unknown export")]
    UnknownProof,

    /// Protocol violation by the remote.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl CoreError {
    /// Map a local failure into the wire error message reported back through
    /// the error path. Local errors are always client errors.
    pub fn to_error_message(&self) -> ErrorMessage {
        ErrorMessage {
            kind: ErrorKind::Client,
            can_recover: true,
            message: self.to_string(),
        }
    }
}

/// The user-facing description of a fatal server error, emitted as a
/// `ControllerError` event.
pub fn fatal_error_description(kind: ErrorKind) -> String {
    match kind {
        ErrorKind::IncompatibleVersion => {
            "Server is not compatible with your application version.".to_string()
        }
        ErrorKind::Authentication => {
            "Authentication failed. Try to remove and add your device again, or reset your account!"
                .to_string()
        }
        ErrorKind::Access => {
            "Account access (import) failed. The partner device was not available or did not accept your request!"
                .to_string()
        }
        ErrorKind::KeyIndex => {
            "Cannot update key! This client is not using the latest existing keys.".to_string()
        }
        ErrorKind::Client | ErrorKind::Server | ErrorKind::UnexpectedMessage => {
            "Internal application error. Check the logs for details.".to_string()
        }
        ErrorKind::Unknown => "Unknown error occurred.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_errors_map_to_recoverable_client_errors() {
        let err = CoreError::UnknownKeyGeneration(5);
        let wire = err.to_error_message();
        assert_eq!(wire.kind, ErrorKind::Client);
        assert!(wire.can_recover);
        assert!(wire.message.contains('5'));
    }

    #[test]
    fn every_fatal_kind_has_a_description() {
        for kind in [
            ErrorKind::Unknown,
            ErrorKind::IncompatibleVersion,
            ErrorKind::Authentication,
            ErrorKind::Access,
            ErrorKind::KeyIndex,
            ErrorKind::Client,
            ErrorKind::Server,
            ErrorKind::UnexpectedMessage,
        ] {
            assert!(!fatal_error_description(kind).is_empty());
        }
    }
}
