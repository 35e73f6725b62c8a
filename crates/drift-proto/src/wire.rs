//! Length-prefixed binary encoding primitives.
//!
//! Integers are big-endian; byte strings are a `u32` length followed by the
//! raw bytes; UUIDs are 16 raw bytes; optional byte strings are a presence
//! byte followed by the value.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use uuid::Uuid;

/// Codec version written as the first byte of every typed frame.
pub const WIRE_VERSION: u8 = 1;

/// Upper bound on a single frame.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Codec errors.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    #[error("frame too large: {0} bytes (max {1})")]
    TooLarge(usize, usize),

    #[error("unsupported frame version: {0}")]
    BadVersion(u8),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("invalid field encoding")]
    InvalidFormat,

    #[error("trailing bytes after message")]
    TrailingBytes,
}

/// Frame writer.
#[derive(Default)]
pub struct Writer {
    buf: BytesMut,
}

impl Writer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.put_u8(v as u8);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    pub fn put_bytes(&mut self, v: &[u8]) {
        debug_assert!(v.len() <= u32::MAX as usize);
        self.buf.put_u32(v.len() as u32);
        self.buf.put_slice(v);
    }

    pub fn put_str(&mut self, v: &str) {
        self.put_bytes(v.as_bytes());
    }

    pub fn put_uuid(&mut self, v: &Uuid) {
        self.buf.put_slice(v.as_bytes());
    }

    pub fn put_opt_bytes(&mut self, v: Option<&[u8]>) {
        match v {
            Some(v) => {
                self.put_bool(true);
                self.put_bytes(v);
            }
            None => self.put_bool(false),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Frame reader that tracks its cursor, so a trailing signature can be
/// verified against the bytes that precede it.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Incomplete(n - self.remaining()));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_bool(&mut self) -> Result<bool, WireError> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(WireError::InvalidFormat),
        }
    }

    pub fn get_u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn get_bytes(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.get_u32()? as usize;
        if len > MAX_FRAME_SIZE {
            return Err(WireError::TooLarge(len, MAX_FRAME_SIZE));
        }
        Ok(self.take(len)?.to_vec())
    }

    pub fn get_str(&mut self) -> Result<String, WireError> {
        String::from_utf8(self.get_bytes()?).map_err(|_| WireError::InvalidFormat)
    }

    pub fn get_uuid(&mut self) -> Result<Uuid, WireError> {
        let b = self.take(16)?;
        Ok(Uuid::from_slice(b).expect("16 bytes"))
    }

    pub fn get_opt_bytes(&mut self) -> Result<Option<Vec<u8>>, WireError> {
        if self.get_bool()? {
            Ok(Some(self.get_bytes()?))
        } else {
            Ok(None)
        }
    }

    pub fn expect_end(&self) -> Result<(), WireError> {
        if self.remaining() == 0 {
            Ok(())
        } else {
            Err(WireError::TrailingBytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn primitive_round_trip() {
        let id = Uuid::new_v4();
        let mut w = Writer::new();
        w.put_u8(7);
        w.put_bool(true);
        w.put_u32(0xDEAD_BEEF);
        w.put_u64(42);
        w.put_bytes(b"payload");
        w.put_str("name");
        w.put_uuid(&id);
        w.put_opt_bytes(Some(b"opt"));
        w.put_opt_bytes(None);

        let frame = w.freeze();
        let mut r = Reader::new(&frame);
        assert_eq!(r.get_u8().unwrap(), 7);
        assert!(r.get_bool().unwrap());
        assert_eq!(r.get_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.get_u64().unwrap(), 42);
        assert_eq!(r.get_bytes().unwrap(), b"payload");
        assert_eq!(r.get_str().unwrap(), "name");
        assert_eq!(r.get_uuid().unwrap(), id);
        assert_eq!(r.get_opt_bytes().unwrap().as_deref(), Some(&b"opt"[..]));
        assert_eq!(r.get_opt_bytes().unwrap(), None);
        r.expect_end().unwrap();
    }

    #[test]
    fn truncated_input_reports_missing_bytes() {
        let mut w = Writer::new();
        w.put_bytes(b"hello");
        let frame = w.freeze();

        let mut r = Reader::new(&frame[..6]);
        assert!(matches!(r.get_bytes(), Err(WireError::Incomplete(_))));
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut r = Reader::new(&[0xFF, 0xFF, 0xFF, 0xFF]);
        assert!(matches!(r.get_bytes(), Err(WireError::TooLarge(_, _))));
    }

    #[test]
    fn invalid_bool_is_rejected() {
        let mut r = Reader::new(&[2]);
        assert!(matches!(r.get_bool(), Err(WireError::InvalidFormat)));
    }

    proptest! {
        #[test]
        fn prop_bytes_round_trip(data in prop::collection::vec(any::<u8>(), 0..4096)) {
            let mut w = Writer::new();
            w.put_bytes(&data);
            let frame = w.freeze();
            let mut r = Reader::new(&frame);
            prop_assert_eq!(r.get_bytes().unwrap(), data);
            prop_assert!(r.expect_end().is_ok());
        }
    }
}
