//! driftsync client core.
//!
//! This crate implements:
//! - The remote connector: WebSocket lifecycle, connection state machine
//!   with retry/backoff, registration/login/import handshake, keepalive,
//!   change upload/download, fleet key rotation
//! - The crypto controller: device key pairs, the generation-indexed
//!   account secret, CMAC proofs, export/import keys
//! - Keystore and settings abstractions backing both

#![forbid(unsafe_code)]

pub mod config;
pub mod connector;
pub mod controller;
pub mod errors;
pub mod events;
pub mod harness;
pub mod keystore;
pub mod machine;
pub mod settings;
pub mod transport;

pub use config::{Defaults, RemoteConfig};
pub use connector::{ConnectorHandle, ExportData, RemoteConnector};
pub use errors::CoreError;
pub use events::{DeviceInfo, SyncEvent};
