//! Wire codec and typed protocol messages for driftsync.
//!
//! Every frame is a self-contained binary message: a codec version byte, a
//! length-prefixed type name, then the message fields. Signed frames carry a
//! trailing signature over all preceding bytes. The well-known ping frame is
//! a single `0xFF` byte and can never collide with a typed frame.

#![forbid(unsafe_code)]

pub mod messages;
pub mod wire;

pub use messages::{
    decode_frame, encode_message, Frame, Message, SignedPart, PING_FRAME,
};
pub use wire::{Reader, Writer, WireError, MAX_FRAME_SIZE, WIRE_VERSION};
