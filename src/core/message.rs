//! # Message
//!
//! An opcode plus an ordered byte payload with a read cursor.
//!
//! Inbound messages are produced by the codecs and read sequentially by the
//! excluded game layer. Outbound messages are built with the `put_*` writers
//! and handed to [`Session::send_message`](crate::session::Session::send_message).
//!
//! All integers are little-endian. Strings are `u16 length || ASCII bytes`,
//! booleans one byte, points two `i16` values. Reading past the end is a
//! [`ProtocolError::MalformedPayload`], never a panic.

use bytes::{Buf, BufMut};

use crate::error::{ProtocolError, Result};

/// A 2D point as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Point {
    pub x: i16,
    pub y: i16,
}

impl Point {
    pub const fn new(x: i16, y: i16) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    opcode: u16,
    payload: Vec<u8>,
    cursor: usize,
}

impl Message {
    /// Empty outbound message for `opcode`.
    pub fn new(opcode: u16) -> Self {
        Self::with_payload(opcode, Vec::new())
    }

    /// Message wrapping an existing payload, cursor at the start.
    pub fn with_payload(opcode: u16, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            payload,
            cursor: 0,
        }
    }

    pub fn opcode(&self) -> u16 {
        self.opcode
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.payload.len() - self.cursor
    }

    /// Current read offset into the payload.
    pub fn position(&self) -> usize {
        self.cursor
    }

    fn take(&mut self, needed: usize) -> Result<&[u8]> {
        let remaining = self.remaining();
        if remaining < needed {
            return Err(ProtocolError::MalformedPayload { needed, remaining });
        }
        let start = self.cursor;
        self.cursor += needed;
        Ok(&self.payload[start..self.cursor])
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        Ok(self.take(2)?.get_u16_le())
    }

    pub fn get_i16(&mut self) -> Result<i16> {
        Ok(self.take(2)?.get_i16_le())
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(self.take(4)?.get_u32_le())
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        Ok(self.take(4)?.get_i32_le())
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        Ok(self.take(8)?.get_u64_le())
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        Ok(self.take(8)?.get_i64_le())
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        Ok(self.take(len)?.to_vec())
    }

    /// Length-prefixed ASCII string.
    pub fn get_string(&mut self) -> Result<String> {
        let len = usize::from(self.get_u16()?);
        let raw = self.take(len)?;
        if !raw.is_ascii() {
            return Err(ProtocolError::InvalidString);
        }
        String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidString)
    }

    pub fn get_point(&mut self) -> Result<Point> {
        let x = self.get_i16()?;
        let y = self.get_i16()?;
        Ok(Point { x, y })
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.take(len).map(|_| ())
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.payload.put_u8(value);
        self
    }

    pub fn put_bool(&mut self, value: bool) -> &mut Self {
        self.put_u8(u8::from(value))
    }

    pub fn put_u16(&mut self, value: u16) -> &mut Self {
        self.payload.put_u16_le(value);
        self
    }

    pub fn put_i16(&mut self, value: i16) -> &mut Self {
        self.payload.put_i16_le(value);
        self
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.payload.put_u32_le(value);
        self
    }

    pub fn put_i32(&mut self, value: i32) -> &mut Self {
        self.payload.put_i32_le(value);
        self
    }

    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.payload.put_u64_le(value);
        self
    }

    pub fn put_i64(&mut self, value: i64) -> &mut Self {
        self.payload.put_i64_le(value);
        self
    }

    pub fn put_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.payload.put_slice(value);
        self
    }

    /// Write a length-prefixed string.
    ///
    /// Fails for non-ASCII text or text longer than a `u16` prefix can carry.
    pub fn put_string(&mut self, value: &str) -> Result<&mut Self> {
        if !value.is_ascii() {
            return Err(ProtocolError::InvalidString);
        }
        let len = u16::try_from(value.len()).map_err(|_| ProtocolError::InvalidString)?;
        self.put_u16(len);
        self.payload.put_slice(value.as_bytes());
        Ok(self)
    }

    pub fn put_point(&mut self, value: Point) -> &mut Self {
        self.put_i16(value.x).put_i16(value.y)
    }

    /// Length of the encoded body: opcode plus payload.
    pub fn body_len(&self) -> usize {
        2 + self.payload.len()
    }
}
