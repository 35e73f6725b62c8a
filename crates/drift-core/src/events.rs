//! Events delivered to the engine façade.

use uuid::Uuid;

/// A peer device in the account, as shown to UIs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: Uuid,
    pub name: String,
    /// SHA3-256 over the device's public keys and scheme tags.
    pub fingerprint: Vec<u8>,
}

/// Everything the connector reports outward. Delivered in order over the
/// event channel returned at spawn time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// The connection is down and no reconnect is scheduled.
    Disconnected,
    /// A connect attempt is starting.
    Reconnecting,
    /// Logged in, no pending remote changes.
    Ready,
    /// Logged in and the server holds changes for this device.
    ReadyWithChanges,
    /// An upload is in flight.
    Sending,

    DeviceNameChanged(String),
    SyncEnabledChanged(bool),

    /// The server acknowledged an uploaded change.
    UploadDone(Vec<u8>),
    /// The server acknowledged a device-targeted upload.
    DeviceUploadDone(Vec<u8>, Uuid),
    /// A downloaded change, already decrypted.
    DownloadData(u64, Vec<u8>),

    DevicesListed(Vec<DeviceInfo>),

    /// An untrusted import wants access; the user must accept or deny.
    LoginRequested(DeviceInfo),
    /// A partner device was granted access to the account.
    AccountAccessGranted(Uuid),
    /// This device's import completed and it is now part of the account.
    ImportCompleted,

    UpdateUploadLimit(u32),
    ProgressAdded(u32),
    ProgressIncrement,

    /// A fatal error that requires user action; the message is displayable.
    ControllerError(String),

    /// Ordered shutdown completed.
    Finalized,
}
