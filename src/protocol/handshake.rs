//! Plaintext connection handshake.
//!
//! The listener writes this immediately on accept. It is the only message
//! that is never enciphered; it carries the two IVs that seed both cipher
//! directions.
//!
//! ```text
//! size(u16 LE) = 14
//! version(u16 LE) patch(u16 LE) subtype(u8)
//! recv_iv(4) send_iv(4)
//! locale(u8)
//! ```
//!
//! `recv_iv` is the IV the server *receives* under (the client sends with
//! it), `send_iv` the one the server sends under.

use bytes::{Buf, BufMut, BytesMut};
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::config::ProtocolSettings;
use crate::core::cipher::Iv;
use crate::core::codec::ClientCodec;
use crate::core::obfuscation::Obfuscator;
use crate::error::{constants, ProtocolError, Result};

/// Value of the leading size field: bytes that follow it.
pub const HANDSHAKE_BODY_LEN: u16 = 14;

/// Total encoded size including the size field.
pub const HANDSHAKE_LEN: usize = 2 + HANDSHAKE_BODY_LEN as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub version: u16,
    pub patch: u16,
    pub subtype: u8,
    pub recv_iv: Iv,
    pub send_iv: Iv,
    pub locale: u8,
}

/// Fresh random IV from the thread-local CSPRNG.
pub fn generate_iv() -> Iv {
    let mut iv = [0u8; 4];
    rand::rng().fill(&mut iv);
    iv
}

impl Handshake {
    /// New handshake with fresh IVs for both directions.
    #[instrument(level = "debug", skip(settings))]
    pub fn generate(settings: &ProtocolSettings) -> Self {
        let handshake = Self {
            version: settings.version,
            patch: settings.patch,
            subtype: settings.subtype,
            recv_iv: generate_iv(),
            send_iv: generate_iv(),
            locale: settings.locale,
        };
        debug!(version = handshake.version, "Generated connection handshake");
        handshake
    }

    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u16_le(HANDSHAKE_BODY_LEN);
        buf.put_u16_le(self.version);
        buf.put_u16_le(self.patch);
        buf.put_u8(self.subtype);
        buf.put_slice(&self.recv_iv);
        buf.put_slice(&self.send_iv);
        buf.put_u8(self.locale);

        let mut out = [0u8; HANDSHAKE_LEN];
        out.copy_from_slice(&buf);
        out
    }

    /// Parse a handshake as a client would read it off the wire.
    pub fn decode(mut raw: &[u8]) -> Result<Self> {
        if raw.len() < HANDSHAKE_LEN {
            return Err(ProtocolError::ProtocolViolation(constants::ERR_SHORT_HANDSHAKE));
        }
        if raw.get_u16_le() != HANDSHAKE_BODY_LEN {
            return Err(ProtocolError::ProtocolViolation(constants::ERR_HANDSHAKE_SIZE));
        }

        let version = raw.get_u16_le();
        let patch = raw.get_u16_le();
        let subtype = raw.get_u8();
        let mut recv_iv = [0u8; 4];
        raw.copy_to_slice(&mut recv_iv);
        let mut send_iv = [0u8; 4];
        raw.copy_to_slice(&mut send_iv);
        let locale = raw.get_u8();

        Ok(Self {
            version,
            patch,
            subtype,
            recv_iv,
            send_iv,
            locale,
        })
    }

    /// Codec for the server end of this connection.
    pub fn server_codec(&self, obfuscator: Arc<dyn Obfuscator>) -> ClientCodec {
        ClientCodec::server(self.send_iv, self.recv_iv, self.version, obfuscator)
    }

    /// Codec for the client end of this connection.
    pub fn peer_codec(&self, obfuscator: Arc<dyn Obfuscator>) -> ClientCodec {
        ClientCodec::peer(self.send_iv, self.recv_iv, self.version, obfuscator)
    }
}
