//! # Cipher State
//!
//! Per-direction stream cipher applied to every client frame body, plus the
//! 4-byte header transform that both hides and carries the body length.
//!
//! A connection owns two instances. The receive side is keyed with the raw
//! client version and the send side with `0xFFFF - version`, so the two
//! directions never share a keystream even if the IVs collide.
//!
//! ## Header layout
//! ```text
//! iiv  = ((iv[2] << 8) | iv[3]) ^ version
//! mlen = len.swap_bytes()
//! [iiv >> 8] [iiv & 0xFF] [(iiv ^ mlen) >> 8] [(iiv ^ mlen) & 0xFF]
//! ```
//! The receiver checks the first two bytes against its own IV and version,
//! which is deterministic: a header built from any other state is rejected.

use crate::core::rand32::Rand32;
use crate::error::{constants, ProtocolError, Result};

/// Size of the obfuscated length header in bytes.
pub const HEADER_LEN: usize = 4;

/// Largest body a single header can describe.
pub const MAX_BODY_LEN: usize = u16::MAX as usize;

/// A 4-byte initialization vector exchanged in the handshake.
pub type Iv = [u8; 4];

/// Derive the send-direction version from the client version.
#[inline]
pub const fn send_version(version: u16) -> u16 {
    0xFFFF - version
}

#[derive(Debug, Clone)]
pub struct CipherState {
    iv: Iv,
    version: u16,
    rng: Rand32,
}

impl CipherState {
    /// Build a cipher from a fresh IV and the direction's version constant.
    pub fn new(iv: Iv, version: u16) -> Self {
        Self {
            iv,
            version,
            rng: Rand32::new(Self::seed(iv, version)),
        }
    }

    fn seed(iv: Iv, version: u16) -> u32 {
        let key = (u32::from(version) << 16) | u32::from(version.rotate_left(8));
        u32::from_le_bytes(iv) ^ key
    }

    /// Current IV; changes after every `advance`.
    pub fn iv(&self) -> Iv {
        self.iv
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    #[inline]
    fn header_key(&self) -> u16 {
        ((u16::from(self.iv[2]) << 8) | u16::from(self.iv[3])) ^ self.version
    }

    /// Encode a body length into an obfuscated header for the current state.
    pub fn header(&self, len: usize) -> Result<[u8; HEADER_LEN]> {
        if len > MAX_BODY_LEN {
            return Err(ProtocolError::OversizedPacket(len));
        }
        let iiv = self.header_key();
        let mlen = (len as u16).swap_bytes();
        let xored = iiv ^ mlen;
        Ok([
            (iiv >> 8) as u8,
            iiv as u8,
            (xored >> 8) as u8,
            xored as u8,
        ])
    }

    /// Whether `header` was produced by a peer in the same state as this one.
    pub fn is_valid_header(&self, header: &[u8; HEADER_LEN]) -> bool {
        let iiv = self.header_key();
        header[0] == (iiv >> 8) as u8 && header[1] == iiv as u8
    }

    /// Validate a raw header and extract the declared body length.
    ///
    /// A failed check is a protocol violation, never a zero length.
    pub fn transform_header(&self, header: &[u8; HEADER_LEN]) -> Result<usize> {
        if !self.is_valid_header(header) {
            return Err(ProtocolError::ProtocolViolation(
                constants::ERR_INVALID_HEADER,
            ));
        }
        Ok(decode_length(header))
    }

    /// Xor `data` in place with the keystream of the current state.
    ///
    /// The same call encrypts and decrypts. State is not mutated; call
    /// [`advance`](Self::advance) once per packet.
    pub fn transform(&self, data: &mut [u8]) {
        let mut keystream = self.rng.clone();
        for chunk in data.chunks_mut(4) {
            let word = keystream.next_u32().to_le_bytes();
            for (byte, key) in chunk.iter_mut().zip(word.iter()) {
                *byte ^= key;
            }
        }
    }

    /// Step to the next per-packet state.
    pub fn advance(&mut self) {
        let next = self.rng.next_u32();
        self.iv = next.to_le_bytes();
        self.rng = Rand32::new(Self::seed(self.iv, self.version));
    }
}

/// Length carried by a header, without validating its check bytes.
#[inline]
pub fn decode_length(header: &[u8; HEADER_LEN]) -> usize {
    (usize::from(header[1] ^ header[3]) << 8) | usize::from(header[0] ^ header[2])
}
