//! Typed protocol messages.
//!
//! Each message knows its wire name and how to read/write its fields. The
//! [`Message`] enum dispatches an incoming frame to its typed form; the
//! sender of `Register`, `Login` and `Access` appends a trailing signature
//! over the whole frame.

use bytes::Bytes;
use uuid::Uuid;

use crate::wire::{Reader, Writer, WireError, MAX_FRAME_SIZE, WIRE_VERSION};

/// The keepalive ping frame. Distinct from every typed frame, whose first
/// byte is always [`WIRE_VERSION`].
pub const PING_FRAME: &[u8] = &[0xFF];

/// Size of the server and proof nonces.
pub const NONCE_SIZE: usize = 32;

/// A message type that can be framed.
pub trait WireMessage: Sized {
    const NAME: &'static str;

    fn write_fields(&self, w: &mut Writer);
    fn read_fields(r: &mut Reader<'_>) -> Result<Self, WireError>;
}

/// Encode a message into a frame: version byte, type name, fields.
pub fn encode_message<M: WireMessage>(msg: &M) -> Result<Bytes, WireError> {
    let mut w = Writer::new();
    w.put_u8(WIRE_VERSION);
    w.put_str(M::NAME);
    msg.write_fields(&mut w);
    if w.len() > MAX_FRAME_SIZE {
        return Err(WireError::TooLarge(w.len(), MAX_FRAME_SIZE));
    }
    Ok(w.freeze())
}

/// Append a trailing signature to an encoded frame. The signature covers
/// every byte of `frame`.
pub fn append_signature(frame: Bytes, signature: &[u8]) -> Bytes {
    let mut w = Writer::new();
    let mut out = Vec::with_capacity(frame.len() + 4 + signature.len());
    out.extend_from_slice(&frame);
    w.put_bytes(signature);
    out.extend_from_slice(w.as_slice());
    Bytes::from(out)
}

/// The signed tail of a frame, if present.
#[derive(Debug, Clone)]
pub struct SignedPart {
    /// Length of the signed prefix (everything before the signature field).
    pub payload_len: usize,
    pub signature: Vec<u8>,
}

/// A decoded frame.
#[derive(Debug)]
pub struct Frame {
    pub message: Message,
    pub signed: Option<SignedPart>,
}

/// Decode a typed frame. If bytes remain after the message fields they are
/// read as a trailing signature; the caller verifies it against
/// `frame[..signed.payload_len]`.
pub fn decode_frame(frame: &[u8]) -> Result<Frame, WireError> {
    let mut r = Reader::new(frame);
    let version = r.get_u8()?;
    if version != WIRE_VERSION {
        return Err(WireError::BadVersion(version));
    }
    let name = r.get_str()?;
    let message = Message::read_named(&name, &mut r)?;

    let signed = if r.remaining() == 0 {
        None
    } else {
        let payload_len = r.position();
        let signature = r.get_bytes()?;
        r.expect_end()?;
        Some(SignedPart {
            payload_len,
            signature,
        })
    };

    Ok(Frame { message, signed })
}

// ============================================================================
// Server error reporting
// ============================================================================

/// Protocol-level error classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unknown,
    IncompatibleVersion,
    Authentication,
    Access,
    KeyIndex,
    Client,
    Server,
    UnexpectedMessage,
}

impl ErrorKind {
    fn to_u32(self) -> u32 {
        match self {
            ErrorKind::Unknown => 0,
            ErrorKind::IncompatibleVersion => 1,
            ErrorKind::Authentication => 2,
            ErrorKind::Access => 3,
            ErrorKind::KeyIndex => 4,
            ErrorKind::Client => 5,
            ErrorKind::Server => 6,
            ErrorKind::UnexpectedMessage => 7,
        }
    }

    fn from_u32(v: u32) -> Self {
        match v {
            1 => ErrorKind::IncompatibleVersion,
            2 => ErrorKind::Authentication,
            3 => ErrorKind::Access,
            4 => ErrorKind::KeyIndex,
            5 => ErrorKind::Client,
            6 => ErrorKind::Server,
            7 => ErrorKind::UnexpectedMessage,
            _ => ErrorKind::Unknown,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ErrorMessage {
    pub kind: ErrorKind,
    pub can_recover: bool,
    pub message: String,
}

impl WireMessage for ErrorMessage {
    const NAME: &'static str = "Error";

    fn write_fields(&self, w: &mut Writer) {
        w.put_u32(self.kind.to_u32());
        w.put_bool(self.can_recover);
        w.put_str(&self.message);
    }

    fn read_fields(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            kind: ErrorKind::from_u32(r.get_u32()?),
            can_recover: r.get_bool()?,
            message: r.get_str()?,
        })
    }
}

// ============================================================================
// Handshake
// ============================================================================

#[derive(Debug, Clone)]
pub struct IdentifyMessage {
    pub nonce: Vec<u8>,
    pub upload_limit: u32,
}

impl WireMessage for IdentifyMessage {
    const NAME: &'static str = "Identify";

    fn write_fields(&self, w: &mut Writer) {
        w.put_bytes(&self.nonce);
        w.put_u32(self.upload_limit);
    }

    fn read_fields(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            nonce: r.get_bytes()?,
            upload_limit: r.get_u32()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RegisterMessage {
    pub device_name: String,
    pub nonce: Vec<u8>,
    pub sign_scheme: String,
    pub sign_key: Vec<u8>,
    pub crypt_scheme: String,
    pub crypt_key: Vec<u8>,
    pub cmac: Vec<u8>,
}

impl WireMessage for RegisterMessage {
    const NAME: &'static str = "Register";

    fn write_fields(&self, w: &mut Writer) {
        w.put_str(&self.device_name);
        w.put_bytes(&self.nonce);
        w.put_str(&self.sign_scheme);
        w.put_bytes(&self.sign_key);
        w.put_str(&self.crypt_scheme);
        w.put_bytes(&self.crypt_key);
        w.put_bytes(&self.cmac);
    }

    fn read_fields(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            device_name: r.get_str()?,
            nonce: r.get_bytes()?,
            sign_scheme: r.get_str()?,
            sign_key: r.get_bytes()?,
            crypt_scheme: r.get_str()?,
            crypt_key: r.get_bytes()?,
            cmac: r.get_bytes()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LoginMessage {
    pub device_id: Uuid,
    pub device_name: String,
    pub nonce: Vec<u8>,
}

impl WireMessage for LoginMessage {
    const NAME: &'static str = "Login";

    fn write_fields(&self, w: &mut Writer) {
        w.put_uuid(&self.device_id);
        w.put_str(&self.device_name);
        w.put_bytes(&self.nonce);
    }

    fn read_fields(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            device_id: r.get_uuid()?,
            device_name: r.get_str()?,
            nonce: r.get_bytes()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AccessMessage {
    pub device_name: String,
    pub nonce: Vec<u8>,
    pub sign_scheme: String,
    pub sign_key: Vec<u8>,
    pub crypt_scheme: String,
    pub crypt_key: Vec<u8>,
    pub partner_id: Uuid,
    pub p_nonce: Vec<u8>,
    pub mac_scheme: String,
    pub cmac: Vec<u8>,
    pub trust_cmac: Option<Vec<u8>>,
}

impl WireMessage for AccessMessage {
    const NAME: &'static str = "Access";

    fn write_fields(&self, w: &mut Writer) {
        w.put_str(&self.device_name);
        w.put_bytes(&self.nonce);
        w.put_str(&self.sign_scheme);
        w.put_bytes(&self.sign_key);
        w.put_str(&self.crypt_scheme);
        w.put_bytes(&self.crypt_key);
        w.put_uuid(&self.partner_id);
        w.put_bytes(&self.p_nonce);
        w.put_str(&self.mac_scheme);
        w.put_bytes(&self.cmac);
        w.put_opt_bytes(self.trust_cmac.as_deref());
    }

    fn read_fields(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            device_name: r.get_str()?,
            nonce: r.get_bytes()?,
            sign_scheme: r.get_str()?,
            sign_key: r.get_bytes()?,
            crypt_scheme: r.get_str()?,
            crypt_key: r.get_bytes()?,
            partner_id: r.get_uuid()?,
            p_nonce: r.get_bytes()?,
            mac_scheme: r.get_str()?,
            cmac: r.get_bytes()?,
            trust_cmac: r.get_opt_bytes()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AccountMessage {
    pub device_id: Uuid,
}

impl WireMessage for AccountMessage {
    const NAME: &'static str = "Account";

    fn write_fields(&self, w: &mut Writer) {
        w.put_uuid(&self.device_id);
    }

    fn read_fields(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            device_id: r.get_uuid()?,
        })
    }
}

/// One key-generation update delivered in a `Welcome`.
#[derive(Debug, Clone)]
pub struct KeyUpdate {
    pub index: u32,
    pub scheme: String,
    pub key: Vec<u8>,
    pub cmac: Vec<u8>,
}

impl KeyUpdate {
    fn write(&self, w: &mut Writer) {
        w.put_u32(self.index);
        w.put_str(&self.scheme);
        w.put_bytes(&self.key);
        w.put_bytes(&self.cmac);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            index: r.get_u32()?,
            scheme: r.get_str()?,
            key: r.get_bytes()?,
            cmac: r.get_bytes()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct WelcomeMessage {
    pub has_changes: bool,
    pub key_updates: Vec<KeyUpdate>,
}

impl WireMessage for WelcomeMessage {
    const NAME: &'static str = "Welcome";

    fn write_fields(&self, w: &mut Writer) {
        w.put_bool(self.has_changes);
        w.put_u32(self.key_updates.len() as u32);
        for ku in &self.key_updates {
            ku.write(w);
        }
    }

    fn read_fields(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let has_changes = r.get_bool()?;
        let count = r.get_u32()?;
        let mut key_updates = Vec::new();
        for _ in 0..count {
            key_updates.push(KeyUpdate::read(r)?);
        }
        Ok(Self {
            has_changes,
            key_updates,
        })
    }
}

#[derive(Debug, Clone)]
pub struct GrantMessage {
    pub device_id: Uuid,
    pub index: u32,
    pub scheme: String,
    pub secret: Vec<u8>,
}

impl WireMessage for GrantMessage {
    const NAME: &'static str = "Grant";

    fn write_fields(&self, w: &mut Writer) {
        w.put_uuid(&self.device_id);
        w.put_u32(self.index);
        w.put_str(&self.scheme);
        w.put_bytes(&self.secret);
    }

    fn read_fields(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            device_id: r.get_uuid()?,
            index: r.get_u32()?,
            scheme: r.get_str()?,
            secret: r.get_bytes()?,
        })
    }
}

/// Canonical byte string covered by a key-update CMAC: the wrapping device
/// MACs it under the generation *before* `index`, the receiving device
/// verifies the same bytes with its own id.
pub fn key_update_signature_data(
    device_id: &Uuid,
    index: u32,
    scheme: &str,
    wrapped_key: &[u8],
) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_u32(index);
    w.put_str(scheme);
    w.put_uuid(device_id);
    w.put_bytes(wrapped_key);
    w.freeze().to_vec()
}

// ============================================================================
// Data synchronization
// ============================================================================

#[derive(Debug, Clone)]
pub struct SyncMessage;

impl WireMessage for SyncMessage {
    const NAME: &'static str = "Sync";

    fn write_fields(&self, _w: &mut Writer) {}

    fn read_fields(_r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self)
    }
}

#[derive(Debug, Clone)]
pub struct ChangeMessage {
    pub data_id: Vec<u8>,
    pub key_index: u32,
    pub salt: Vec<u8>,
    pub data: Vec<u8>,
}

impl WireMessage for ChangeMessage {
    const NAME: &'static str = "Change";

    fn write_fields(&self, w: &mut Writer) {
        w.put_bytes(&self.data_id);
        w.put_u32(self.key_index);
        w.put_bytes(&self.salt);
        w.put_bytes(&self.data);
    }

    fn read_fields(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            data_id: r.get_bytes()?,
            key_index: r.get_u32()?,
            salt: r.get_bytes()?,
            data: r.get_bytes()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ChangeAckMessage {
    pub data_id: Vec<u8>,
}

impl WireMessage for ChangeAckMessage {
    const NAME: &'static str = "ChangeAck";

    fn write_fields(&self, w: &mut Writer) {
        w.put_bytes(&self.data_id);
    }

    fn read_fields(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            data_id: r.get_bytes()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DeviceChangeMessage {
    pub data_id: Vec<u8>,
    pub device_id: Uuid,
    pub key_index: u32,
    pub salt: Vec<u8>,
    pub data: Vec<u8>,
}

impl WireMessage for DeviceChangeMessage {
    const NAME: &'static str = "DeviceChange";

    fn write_fields(&self, w: &mut Writer) {
        w.put_bytes(&self.data_id);
        w.put_uuid(&self.device_id);
        w.put_u32(self.key_index);
        w.put_bytes(&self.salt);
        w.put_bytes(&self.data);
    }

    fn read_fields(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            data_id: r.get_bytes()?,
            device_id: r.get_uuid()?,
            key_index: r.get_u32()?,
            salt: r.get_bytes()?,
            data: r.get_bytes()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DeviceChangeAckMessage {
    pub data_id: Vec<u8>,
    pub device_id: Uuid,
}

impl WireMessage for DeviceChangeAckMessage {
    const NAME: &'static str = "DeviceChangeAck";

    fn write_fields(&self, w: &mut Writer) {
        w.put_bytes(&self.data_id);
        w.put_uuid(&self.device_id);
    }

    fn read_fields(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            data_id: r.get_bytes()?,
            device_id: r.get_uuid()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ChangedMessage {
    pub data_index: u64,
    pub key_index: u32,
    pub salt: Vec<u8>,
    pub data: Vec<u8>,
}

impl WireMessage for ChangedMessage {
    const NAME: &'static str = "Changed";

    fn write_fields(&self, w: &mut Writer) {
        w.put_u64(self.data_index);
        w.put_u32(self.key_index);
        w.put_bytes(&self.salt);
        w.put_bytes(&self.data);
    }

    fn read_fields(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            data_index: r.get_u64()?,
            key_index: r.get_u32()?,
            salt: r.get_bytes()?,
            data: r.get_bytes()?,
        })
    }
}

/// First message of a change download stream; carries the stream estimate
/// plus the first change payload.
#[derive(Debug, Clone)]
pub struct ChangedInfoMessage {
    pub change_estimate: u32,
    pub data_index: u64,
    pub key_index: u32,
    pub salt: Vec<u8>,
    pub data: Vec<u8>,
}

impl ChangedInfoMessage {
    pub fn to_changed(&self) -> ChangedMessage {
        ChangedMessage {
            data_index: self.data_index,
            key_index: self.key_index,
            salt: self.salt.clone(),
            data: self.data.clone(),
        }
    }
}

impl WireMessage for ChangedInfoMessage {
    const NAME: &'static str = "ChangedInfo";

    fn write_fields(&self, w: &mut Writer) {
        w.put_u32(self.change_estimate);
        w.put_u64(self.data_index);
        w.put_u32(self.key_index);
        w.put_bytes(&self.salt);
        w.put_bytes(&self.data);
    }

    fn read_fields(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            change_estimate: r.get_u32()?,
            data_index: r.get_u64()?,
            key_index: r.get_u32()?,
            salt: r.get_bytes()?,
            data: r.get_bytes()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LastChangedMessage;

impl WireMessage for LastChangedMessage {
    const NAME: &'static str = "LastChanged";

    fn write_fields(&self, _w: &mut Writer) {}

    fn read_fields(_r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self)
    }
}

#[derive(Debug, Clone)]
pub struct ChangedAckMessage {
    pub data_index: u64,
}

impl WireMessage for ChangedAckMessage {
    const NAME: &'static str = "ChangedAck";

    fn write_fields(&self, w: &mut Writer) {
        w.put_u64(self.data_index);
    }

    fn read_fields(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            data_index: r.get_u64()?,
        })
    }
}

// ============================================================================
// Device management
// ============================================================================

#[derive(Debug, Clone)]
pub struct ListDevicesMessage;

impl WireMessage for ListDevicesMessage {
    const NAME: &'static str = "ListDevices";

    fn write_fields(&self, _w: &mut Writer) {}

    fn read_fields(_r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self)
    }
}

#[derive(Debug, Clone)]
pub struct DeviceEntry {
    pub device_id: Uuid,
    pub name: String,
    pub fingerprint: Vec<u8>,
}

impl DeviceEntry {
    fn write(&self, w: &mut Writer) {
        w.put_uuid(&self.device_id);
        w.put_str(&self.name);
        w.put_bytes(&self.fingerprint);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            device_id: r.get_uuid()?,
            name: r.get_str()?,
            fingerprint: r.get_bytes()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DevicesMessage {
    pub devices: Vec<DeviceEntry>,
}

impl WireMessage for DevicesMessage {
    const NAME: &'static str = "Devices";

    fn write_fields(&self, w: &mut Writer) {
        w.put_u32(self.devices.len() as u32);
        for d in &self.devices {
            d.write(w);
        }
    }

    fn read_fields(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let count = r.get_u32()?;
        let mut devices = Vec::new();
        for _ in 0..count {
            devices.push(DeviceEntry::read(r)?);
        }
        Ok(Self { devices })
    }
}

#[derive(Debug, Clone)]
pub struct RemoveMessage {
    pub device_id: Uuid,
}

impl WireMessage for RemoveMessage {
    const NAME: &'static str = "Remove";

    fn write_fields(&self, w: &mut Writer) {
        w.put_uuid(&self.device_id);
    }

    fn read_fields(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            device_id: r.get_uuid()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RemovedMessage {
    pub device_id: Uuid,
}

impl WireMessage for RemovedMessage {
    const NAME: &'static str = "Removed";

    fn write_fields(&self, w: &mut Writer) {
        w.put_uuid(&self.device_id);
    }

    fn read_fields(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            device_id: r.get_uuid()?,
        })
    }
}

// ============================================================================
// Account import (partner side)
// ============================================================================

#[derive(Debug, Clone)]
pub struct ProofMessage {
    pub p_nonce: Vec<u8>,
    pub device_id: Uuid,
    pub device_name: String,
    pub sign_scheme: String,
    pub sign_key: Vec<u8>,
    pub crypt_scheme: String,
    pub crypt_key: Vec<u8>,
    pub mac_scheme: String,
    pub cmac: Vec<u8>,
    pub trust_cmac: Option<Vec<u8>>,
}

impl WireMessage for ProofMessage {
    const NAME: &'static str = "Proof";

    fn write_fields(&self, w: &mut Writer) {
        w.put_bytes(&self.p_nonce);
        w.put_uuid(&self.device_id);
        w.put_str(&self.device_name);
        w.put_str(&self.sign_scheme);
        w.put_bytes(&self.sign_key);
        w.put_str(&self.crypt_scheme);
        w.put_bytes(&self.crypt_key);
        w.put_str(&self.mac_scheme);
        w.put_bytes(&self.cmac);
        w.put_opt_bytes(self.trust_cmac.as_deref());
    }

    fn read_fields(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            p_nonce: r.get_bytes()?,
            device_id: r.get_uuid()?,
            device_name: r.get_str()?,
            sign_scheme: r.get_str()?,
            sign_key: r.get_bytes()?,
            crypt_scheme: r.get_str()?,
            crypt_key: r.get_bytes()?,
            mac_scheme: r.get_str()?,
            cmac: r.get_bytes()?,
            trust_cmac: r.get_opt_bytes()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AcceptMessage {
    pub device_id: Uuid,
    pub index: u32,
    pub scheme: String,
    pub secret: Vec<u8>,
}

impl WireMessage for AcceptMessage {
    const NAME: &'static str = "Accept";

    fn write_fields(&self, w: &mut Writer) {
        w.put_uuid(&self.device_id);
        w.put_u32(self.index);
        w.put_str(&self.scheme);
        w.put_bytes(&self.secret);
    }

    fn read_fields(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            device_id: r.get_uuid()?,
            index: r.get_u32()?,
            scheme: r.get_str()?,
            secret: r.get_bytes()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DenyMessage {
    pub device_id: Uuid,
}

impl WireMessage for DenyMessage {
    const NAME: &'static str = "Deny";

    fn write_fields(&self, w: &mut Writer) {
        w.put_uuid(&self.device_id);
    }

    fn read_fields(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            device_id: r.get_uuid()?,
        })
    }
}

// ============================================================================
// Key rotation
// ============================================================================

#[derive(Debug, Clone)]
pub struct MacUpdateMessage {
    pub key_index: u32,
    pub cmac: Vec<u8>,
}

impl WireMessage for MacUpdateMessage {
    const NAME: &'static str = "MacUpdate";

    fn write_fields(&self, w: &mut Writer) {
        w.put_u32(self.key_index);
        w.put_bytes(&self.cmac);
    }

    fn read_fields(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            key_index: r.get_u32()?,
            cmac: r.get_bytes()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct MacUpdateAckMessage;

impl WireMessage for MacUpdateAckMessage {
    const NAME: &'static str = "MacUpdateAck";

    fn write_fields(&self, _w: &mut Writer) {}

    fn read_fields(_r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self)
    }
}

#[derive(Debug, Clone)]
pub struct KeyChangeMessage {
    pub next_index: u32,
}

impl WireMessage for KeyChangeMessage {
    const NAME: &'static str = "KeyChange";

    fn write_fields(&self, w: &mut Writer) {
        w.put_u32(self.next_index);
    }

    fn read_fields(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            next_index: r.get_u32()?,
        })
    }
}

/// One fleet member in a `DeviceKeys` reply: its public keys plus the CMAC
/// proving it knows the current account secret.
#[derive(Debug, Clone)]
pub struct KeyDeviceEntry {
    pub device_id: Uuid,
    pub sign_scheme: String,
    pub sign_key: Vec<u8>,
    pub crypt_scheme: String,
    pub crypt_key: Vec<u8>,
    pub cmac: Vec<u8>,
}

impl KeyDeviceEntry {
    fn write(&self, w: &mut Writer) {
        w.put_uuid(&self.device_id);
        w.put_str(&self.sign_scheme);
        w.put_bytes(&self.sign_key);
        w.put_str(&self.crypt_scheme);
        w.put_bytes(&self.crypt_key);
        w.put_bytes(&self.cmac);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            device_id: r.get_uuid()?,
            sign_scheme: r.get_str()?,
            sign_key: r.get_bytes()?,
            crypt_scheme: r.get_str()?,
            crypt_key: r.get_bytes()?,
            cmac: r.get_bytes()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DeviceKeysMessage {
    pub key_index: u32,
    pub duplicated: bool,
    pub devices: Vec<KeyDeviceEntry>,
}

impl WireMessage for DeviceKeysMessage {
    const NAME: &'static str = "DeviceKeys";

    fn write_fields(&self, w: &mut Writer) {
        w.put_u32(self.key_index);
        w.put_bool(self.duplicated);
        w.put_u32(self.devices.len() as u32);
        for d in &self.devices {
            d.write(w);
        }
    }

    fn read_fields(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let key_index = r.get_u32()?;
        let duplicated = r.get_bool()?;
        let count = r.get_u32()?;
        let mut devices = Vec::new();
        for _ in 0..count {
            devices.push(KeyDeviceEntry::read(r)?);
        }
        Ok(Self {
            key_index,
            duplicated,
            devices,
        })
    }
}

/// The wrapped new secret for one fleet member.
#[derive(Debug, Clone)]
pub struct NewKeyUpdate {
    pub device_id: Uuid,
    pub key: Vec<u8>,
    pub cmac: Vec<u8>,
}

impl NewKeyUpdate {
    fn write(&self, w: &mut Writer) {
        w.put_uuid(&self.device_id);
        w.put_bytes(&self.key);
        w.put_bytes(&self.cmac);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            device_id: r.get_uuid()?,
            key: r.get_bytes()?,
            cmac: r.get_bytes()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewKeyMessage {
    pub key_index: u32,
    pub scheme: String,
    pub cmac: Vec<u8>,
    pub device_keys: Vec<NewKeyUpdate>,
}

impl WireMessage for NewKeyMessage {
    const NAME: &'static str = "NewKey";

    fn write_fields(&self, w: &mut Writer) {
        w.put_u32(self.key_index);
        w.put_str(&self.scheme);
        w.put_bytes(&self.cmac);
        w.put_u32(self.device_keys.len() as u32);
        for d in &self.device_keys {
            d.write(w);
        }
    }

    fn read_fields(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let key_index = r.get_u32()?;
        let scheme = r.get_str()?;
        let cmac = r.get_bytes()?;
        let count = r.get_u32()?;
        let mut device_keys = Vec::new();
        for _ in 0..count {
            device_keys.push(NewKeyUpdate::read(r)?);
        }
        Ok(Self {
            key_index,
            scheme,
            cmac,
            device_keys,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewKeyAckMessage {
    pub key_index: u32,
}

impl WireMessage for NewKeyAckMessage {
    const NAME: &'static str = "NewKeyAck";

    fn write_fields(&self, w: &mut Writer) {
        w.put_u32(self.key_index);
    }

    fn read_fields(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            key_index: r.get_u32()?,
        })
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// All protocol messages, for decoding a frame of unknown type.
#[derive(Debug)]
pub enum Message {
    Error(ErrorMessage),
    Identify(IdentifyMessage),
    Register(RegisterMessage),
    Login(LoginMessage),
    Access(AccessMessage),
    Account(AccountMessage),
    Welcome(WelcomeMessage),
    Grant(GrantMessage),
    Sync(SyncMessage),
    Change(ChangeMessage),
    ChangeAck(ChangeAckMessage),
    DeviceChange(DeviceChangeMessage),
    DeviceChangeAck(DeviceChangeAckMessage),
    Changed(ChangedMessage),
    ChangedInfo(ChangedInfoMessage),
    LastChanged(LastChangedMessage),
    ChangedAck(ChangedAckMessage),
    ListDevices(ListDevicesMessage),
    Devices(DevicesMessage),
    Remove(RemoveMessage),
    Removed(RemovedMessage),
    Proof(ProofMessage),
    Accept(AcceptMessage),
    Deny(DenyMessage),
    MacUpdate(MacUpdateMessage),
    MacUpdateAck(MacUpdateAckMessage),
    KeyChange(KeyChangeMessage),
    DeviceKeys(DeviceKeysMessage),
    NewKey(NewKeyMessage),
    NewKeyAck(NewKeyAckMessage),
}

impl Message {
    fn read_named(name: &str, r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(match name {
            ErrorMessage::NAME => Message::Error(ErrorMessage::read_fields(r)?),
            IdentifyMessage::NAME => Message::Identify(IdentifyMessage::read_fields(r)?),
            RegisterMessage::NAME => Message::Register(RegisterMessage::read_fields(r)?),
            LoginMessage::NAME => Message::Login(LoginMessage::read_fields(r)?),
            AccessMessage::NAME => Message::Access(AccessMessage::read_fields(r)?),
            AccountMessage::NAME => Message::Account(AccountMessage::read_fields(r)?),
            WelcomeMessage::NAME => Message::Welcome(WelcomeMessage::read_fields(r)?),
            GrantMessage::NAME => Message::Grant(GrantMessage::read_fields(r)?),
            SyncMessage::NAME => Message::Sync(SyncMessage::read_fields(r)?),
            ChangeMessage::NAME => Message::Change(ChangeMessage::read_fields(r)?),
            ChangeAckMessage::NAME => Message::ChangeAck(ChangeAckMessage::read_fields(r)?),
            DeviceChangeMessage::NAME => Message::DeviceChange(DeviceChangeMessage::read_fields(r)?),
            DeviceChangeAckMessage::NAME => {
                Message::DeviceChangeAck(DeviceChangeAckMessage::read_fields(r)?)
            }
            ChangedMessage::NAME => Message::Changed(ChangedMessage::read_fields(r)?),
            ChangedInfoMessage::NAME => Message::ChangedInfo(ChangedInfoMessage::read_fields(r)?),
            LastChangedMessage::NAME => Message::LastChanged(LastChangedMessage::read_fields(r)?),
            ChangedAckMessage::NAME => Message::ChangedAck(ChangedAckMessage::read_fields(r)?),
            ListDevicesMessage::NAME => Message::ListDevices(ListDevicesMessage::read_fields(r)?),
            DevicesMessage::NAME => Message::Devices(DevicesMessage::read_fields(r)?),
            RemoveMessage::NAME => Message::Remove(RemoveMessage::read_fields(r)?),
            RemovedMessage::NAME => Message::Removed(RemovedMessage::read_fields(r)?),
            ProofMessage::NAME => Message::Proof(ProofMessage::read_fields(r)?),
            AcceptMessage::NAME => Message::Accept(AcceptMessage::read_fields(r)?),
            DenyMessage::NAME => Message::Deny(DenyMessage::read_fields(r)?),
            MacUpdateMessage::NAME => Message::MacUpdate(MacUpdateMessage::read_fields(r)?),
            MacUpdateAckMessage::NAME => {
                Message::MacUpdateAck(MacUpdateAckMessage::read_fields(r)?)
            }
            KeyChangeMessage::NAME => Message::KeyChange(KeyChangeMessage::read_fields(r)?),
            DeviceKeysMessage::NAME => Message::DeviceKeys(DeviceKeysMessage::read_fields(r)?),
            NewKeyMessage::NAME => Message::NewKey(NewKeyMessage::read_fields(r)?),
            NewKeyAckMessage::NAME => Message::NewKeyAck(NewKeyAckMessage::read_fields(r)?),
            other => return Err(WireError::UnknownType(other.to_string())),
        })
    }

    /// Wire name of the contained message.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Error(_) => ErrorMessage::NAME,
            Message::Identify(_) => IdentifyMessage::NAME,
            Message::Register(_) => RegisterMessage::NAME,
            Message::Login(_) => LoginMessage::NAME,
            Message::Access(_) => AccessMessage::NAME,
            Message::Account(_) => AccountMessage::NAME,
            Message::Welcome(_) => WelcomeMessage::NAME,
            Message::Grant(_) => GrantMessage::NAME,
            Message::Sync(_) => SyncMessage::NAME,
            Message::Change(_) => ChangeMessage::NAME,
            Message::ChangeAck(_) => ChangeAckMessage::NAME,
            Message::DeviceChange(_) => DeviceChangeMessage::NAME,
            Message::DeviceChangeAck(_) => DeviceChangeAckMessage::NAME,
            Message::Changed(_) => ChangedMessage::NAME,
            Message::ChangedInfo(_) => ChangedInfoMessage::NAME,
            Message::LastChanged(_) => LastChangedMessage::NAME,
            Message::ChangedAck(_) => ChangedAckMessage::NAME,
            Message::ListDevices(_) => ListDevicesMessage::NAME,
            Message::Devices(_) => DevicesMessage::NAME,
            Message::Remove(_) => RemoveMessage::NAME,
            Message::Removed(_) => RemovedMessage::NAME,
            Message::Proof(_) => ProofMessage::NAME,
            Message::Accept(_) => AcceptMessage::NAME,
            Message::Deny(_) => DenyMessage::NAME,
            Message::MacUpdate(_) => MacUpdateMessage::NAME,
            Message::MacUpdateAck(_) => MacUpdateAckMessage::NAME,
            Message::KeyChange(_) => KeyChangeMessage::NAME,
            Message::DeviceKeys(_) => DeviceKeysMessage::NAME,
            Message::NewKey(_) => NewKeyMessage::NAME,
            Message::NewKeyAck(_) => NewKeyAckMessage::NAME,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identify_round_trip() {
        let msg = IdentifyMessage {
            nonce: vec![1u8; NONCE_SIZE],
            upload_limit: 1_048_576,
        };
        let frame = encode_message(&msg).unwrap();
        let decoded = decode_frame(&frame).unwrap();
        assert!(decoded.signed.is_none());
        match decoded.message {
            Message::Identify(m) => {
                assert_eq!(m.nonce, msg.nonce);
                assert_eq!(m.upload_limit, msg.upload_limit);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn signed_frame_round_trip() {
        let msg = LoginMessage {
            device_id: Uuid::new_v4(),
            device_name: "laptop".into(),
            nonce: vec![9u8; NONCE_SIZE],
        };
        let frame = encode_message(&msg).unwrap();
        let payload_len = frame.len();
        let signed = append_signature(frame.clone(), b"fake signature");

        let decoded = decode_frame(&signed).unwrap();
        let part = decoded.signed.expect("signature part");
        assert_eq!(part.payload_len, payload_len);
        assert_eq!(part.signature, b"fake signature");
        assert_eq!(&signed[..part.payload_len], &frame[..]);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut w = Writer::new();
        w.put_u8(WIRE_VERSION);
        w.put_str("Bogus");
        let frame = w.freeze();
        assert!(matches!(
            decode_frame(&frame),
            Err(WireError::UnknownType(_))
        ));
    }

    #[test]
    fn wrong_version_is_rejected() {
        let mut w = Writer::new();
        w.put_u8(9);
        w.put_str("Sync");
        let frame = w.freeze();
        assert!(matches!(decode_frame(&frame), Err(WireError::BadVersion(9))));
    }

    #[test]
    fn ping_frame_is_not_a_typed_frame() {
        assert!(decode_frame(PING_FRAME).is_err());
    }

    #[test]
    fn welcome_with_key_updates_round_trips() {
        let msg = WelcomeMessage {
            has_changes: true,
            key_updates: vec![
                KeyUpdate {
                    index: 8,
                    scheme: "ChaCha20Poly1305".into(),
                    key: vec![1, 2, 3],
                    cmac: vec![4, 5, 6],
                },
                KeyUpdate {
                    index: 9,
                    scheme: "ChaCha20Poly1305".into(),
                    key: vec![7],
                    cmac: vec![8],
                },
            ],
        };
        let frame = encode_message(&msg).unwrap();
        match decode_frame(&frame).unwrap().message {
            Message::Welcome(m) => {
                assert!(m.has_changes);
                assert_eq!(m.key_updates.len(), 2);
                assert_eq!(m.key_updates[1].index, 9);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn proof_optional_trust_cmac() {
        let base = ProofMessage {
            p_nonce: vec![0xAA; NONCE_SIZE],
            device_id: Uuid::new_v4(),
            device_name: "phone".into(),
            sign_scheme: "ECDSA-ECP-SHA3-512".into(),
            sign_key: vec![1],
            crypt_scheme: "RSA-OAEP-SHA3-512".into(),
            crypt_key: vec![2],
            mac_scheme: "Argon2id".into(),
            cmac: vec![3],
            trust_cmac: None,
        };
        let frame = encode_message(&base).unwrap();
        match decode_frame(&frame).unwrap().message {
            Message::Proof(m) => assert!(m.trust_cmac.is_none()),
            other => panic!("unexpected message: {:?}", other),
        }

        let trusted = ProofMessage {
            trust_cmac: Some(vec![9, 9]),
            ..base
        };
        let frame = encode_message(&trusted).unwrap();
        match decode_frame(&frame).unwrap().message {
            Message::Proof(m) => assert_eq!(m.trust_cmac, Some(vec![9, 9])),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn device_keys_round_trip() {
        let msg = DeviceKeysMessage {
            key_index: 4,
            duplicated: false,
            devices: vec![KeyDeviceEntry {
                device_id: Uuid::new_v4(),
                sign_scheme: "RSA-PSS-SHA3-512".into(),
                sign_key: vec![1, 2],
                crypt_scheme: "RSA-OAEP-SHA3-512".into(),
                crypt_key: vec![3, 4],
                cmac: vec![5, 6],
            }],
        };
        let frame = encode_message(&msg).unwrap();
        match decode_frame(&frame).unwrap().message {
            Message::DeviceKeys(m) => {
                assert_eq!(m.key_index, 4);
                assert!(!m.duplicated);
                assert_eq!(m.devices.len(), 1);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn key_update_signature_data_is_stable() {
        let id = Uuid::new_v4();
        let a = key_update_signature_data(&id, 3, "ChaCha20Poly1305", b"wrapped");
        let b = key_update_signature_data(&id, 3, "ChaCha20Poly1305", b"wrapped");
        assert_eq!(a, b);
        assert_ne!(a, key_update_signature_data(&id, 4, "ChaCha20Poly1305", b"wrapped"));
    }

    #[test]
    fn truncated_message_fails_cleanly() {
        let msg = ChangeMessage {
            data_id: b"obj-1".to_vec(),
            key_index: 1,
            salt: vec![0; 12],
            data: vec![1, 2, 3, 4],
        };
        let frame = encode_message(&msg).unwrap();
        for cut in [1, 5, frame.len() - 1] {
            assert!(decode_frame(&frame[..cut]).is_err());
        }
    }
}
