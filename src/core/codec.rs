//! # Frame Codecs
//!
//! Two framings share this module:
//!
//! - [`ClientCodec`]: the obfuscated client framing. Every frame is
//!   `header(4) || body` where the body is `opcode(u16 LE) || payload`,
//!   shuffled by the secondary pass and xored by the direction's
//!   [`CipherState`].
//! - [`RelayCodec`]: the plain hub framing used between server roles over a
//!   private transport: `length(u32 BE) || opcode(u16 LE) || payload`.
//!
//! Both implement tokio-util's `Decoder`/`Encoder`, so they plug into
//! `Framed`, but they are plain state machines over `BytesMut` and can be
//! driven by any reactor.
//!
//! ## Suspension
//! A decoder that sees fewer bytes than the frame needs returns `Ok(None)`
//! without touching cipher state. No partial message is ever surfaced.

use bytes::{Buf, BufMut, BytesMut};
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::core::cipher::{send_version, CipherState, Iv, HEADER_LEN};
use crate::core::message::Message;
use crate::core::obfuscation::{ByteShuffle, Obfuscator};
use crate::error::{constants, ProtocolError, Result};

/// Opcode width at the start of every body.
pub const OPCODE_LEN: usize = 2;

/// Decoding half of the client framing. Owned by the connection's reader.
#[derive(Debug)]
pub struct FrameDecoder {
    cipher: CipherState,
    obfuscator: Arc<dyn Obfuscator>,
}

impl FrameDecoder {
    pub fn new(cipher: CipherState, obfuscator: Arc<dyn Obfuscator>) -> Self {
        Self { cipher, obfuscator }
    }

    pub fn cipher(&self) -> &CipherState {
        &self.cipher
    }
}

impl Decoder for FrameDecoder {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&src[..HEADER_LEN]);
        let body_len = self.cipher.transform_header(&header)?;

        let frame_len = HEADER_LEN + body_len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let mut body = src.split_to(body_len);
        self.cipher.transform(&mut body);
        self.obfuscator.decrypt(&mut body);
        self.cipher.advance();

        if body.len() < OPCODE_LEN {
            return Err(ProtocolError::ProtocolViolation(constants::ERR_SHORT_BODY));
        }
        let opcode = body.get_u16_le();
        trace!(opcode, len = body.len(), "Decoded client frame");
        Ok(Some(Message::with_payload(opcode, body.to_vec())))
    }
}

/// Encoding half of the client framing. Lives behind the session send guard.
#[derive(Debug)]
pub struct FrameEncoder {
    cipher: CipherState,
    obfuscator: Arc<dyn Obfuscator>,
}

impl FrameEncoder {
    pub fn new(cipher: CipherState, obfuscator: Arc<dyn Obfuscator>) -> Self {
        Self { cipher, obfuscator }
    }

    pub fn cipher(&self) -> &CipherState {
        &self.cipher
    }

    /// Frame an opcode and raw payload.
    pub fn encode_parts(&mut self, opcode: u16, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
        let body_len = OPCODE_LEN + payload.len();
        let header = self.cipher.header(body_len)?;

        let mut body = Vec::with_capacity(body_len);
        body.put_u16_le(opcode);
        body.put_slice(payload);

        self.obfuscator.encrypt(&mut body);
        self.cipher.transform(&mut body);
        self.cipher.advance();

        dst.reserve(HEADER_LEN + body_len);
        dst.put_slice(&header);
        dst.put_slice(&body);
        trace!(opcode, len = body_len, "Encoded client frame");
        Ok(())
    }
}

impl Encoder<Message> for FrameEncoder {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        self.encode_parts(item.opcode(), item.payload(), dst)
    }
}

/// Both directions of the client framing for one connection.
///
/// Use [`ClientCodec::split`] to hand the decoder to the reader and the
/// encoder to the session's send guard.
#[derive(Debug)]
pub struct ClientCodec {
    decoder: FrameDecoder,
    encoder: FrameEncoder,
}

impl ClientCodec {
    /// Server side of a connection: receive with `recv_iv` under the raw
    /// version, send with `send_iv` under its complement.
    pub fn server(send_iv: Iv, recv_iv: Iv, version: u16, obfuscator: Arc<dyn Obfuscator>) -> Self {
        Self {
            decoder: FrameDecoder::new(CipherState::new(recv_iv, version), obfuscator.clone()),
            encoder: FrameEncoder::new(CipherState::new(send_iv, send_version(version)), obfuscator),
        }
    }

    /// Peer (game client) side of the same connection, built from the IVs the
    /// server announced in its handshake.
    pub fn peer(server_send_iv: Iv, server_recv_iv: Iv, version: u16, obfuscator: Arc<dyn Obfuscator>) -> Self {
        Self {
            decoder: FrameDecoder::new(
                CipherState::new(server_send_iv, send_version(version)),
                obfuscator.clone(),
            ),
            encoder: FrameEncoder::new(CipherState::new(server_recv_iv, version), obfuscator),
        }
    }

    /// Server side with the default secondary pass.
    pub fn server_default(send_iv: Iv, recv_iv: Iv, version: u16) -> Self {
        Self::server(send_iv, recv_iv, version, Arc::new(ByteShuffle))
    }

    pub fn split(self) -> (FrameDecoder, FrameEncoder) {
        (self.decoder, self.encoder)
    }
}

impl Decoder for ClientCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        self.decoder.decode(src)
    }
}

impl Encoder<Message> for ClientCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        self.encoder.encode(item, dst)
    }
}

/// Length prefix width of relay frames.
pub const RELAY_LENGTH_LEN: usize = 4;

/// Plain length-delimited framing for role-to-hub links.
#[derive(Debug, Clone, Copy)]
pub struct RelayCodec {
    max_frame_size: usize,
}

impl RelayCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for RelayCodec {
    fn default() -> Self {
        Self::new(crate::config::MAX_RELAY_FRAME_SIZE)
    }
}

impl Decoder for RelayCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.len() < RELAY_LENGTH_LEN {
            return Ok(None);
        }

        let mut len_bytes = [0u8; RELAY_LENGTH_LEN];
        len_bytes.copy_from_slice(&src[..RELAY_LENGTH_LEN]);
        let len = u32::from_be_bytes(len_bytes) as usize;

        if len > self.max_frame_size {
            return Err(ProtocolError::OversizedPacket(len));
        }
        if len < OPCODE_LEN {
            return Err(ProtocolError::ProtocolViolation(constants::ERR_SHORT_BODY));
        }
        if src.len() < RELAY_LENGTH_LEN + len {
            src.reserve(RELAY_LENGTH_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(RELAY_LENGTH_LEN);
        let mut body = src.split_to(len);
        let opcode = body.get_u16_le();
        Ok(Some(Message::with_payload(opcode, body.to_vec())))
    }
}

impl Encoder<Message> for RelayCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let len = item.body_len();
        if len > self.max_frame_size {
            return Err(ProtocolError::OversizedPacket(len));
        }
        dst.reserve(RELAY_LENGTH_LEN + len);
        dst.put_u32(len as u32);
        dst.put_u16_le(item.opcode());
        dst.put_slice(item.payload());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const VERSION: u16 = 28;
    const SEND_IV: Iv = [0x10, 0x20, 0x30, 0x40];
    const RECV_IV: Iv = [0x55, 0x66, 0x77, 0x88];

    fn pair() -> (ClientCodec, ClientCodec) {
        (
            ClientCodec::server_default(SEND_IV, RECV_IV, VERSION),
            ClientCodec::peer(SEND_IV, RECV_IV, VERSION, Arc::new(ByteShuffle)),
        )
    }

    #[test]
    fn test_peer_to_server_roundtrip() {
        let (mut server, mut peer) = pair();
        let mut wire = BytesMut::new();
        let mut msg = Message::new(0x14);
        msg.put_u32(1234);
        peer.encode(msg, &mut wire).unwrap();

        let mut decoded = server.decode(&mut wire).unwrap().unwrap();
        assert_eq!(decoded.opcode(), 0x14);
        assert_eq!(decoded.get_u32().unwrap(), 1234);
        assert!(wire.is_empty());
    }

    #[test]
    fn test_server_to_peer_roundtrip() {
        let (mut server, mut peer) = pair();
        let mut wire = BytesMut::new();
        server
            .encode(Message::with_payload(3, vec![1, 2, 3]), &mut wire)
            .unwrap();
        let decoded = peer.decode(&mut wire).unwrap().unwrap();
        assert_eq!(decoded.opcode(), 3);
        assert_eq!(decoded.payload(), &[1, 2, 3]);
    }

    #[test]
    fn test_incomplete_frame_suspends_without_advancing() {
        let (mut server, mut peer) = pair();
        let mut wire = BytesMut::new();
        peer.encode(Message::with_payload(9, vec![0xAA; 32]), &mut wire)
            .unwrap();
        let iv_before = server.decoder.cipher().iv();

        let mut partial = BytesMut::from(&wire[..10]);
        assert!(server.decode(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), 10);
        assert_eq!(server.decoder.cipher().iv(), iv_before);
    }

    #[test]
    fn test_wrong_direction_is_violation() {
        let (mut server, _) = pair();
        let mut other = ClientCodec::server_default(SEND_IV, RECV_IV, VERSION);
        let mut wire = BytesMut::new();
        // Server-to-client frames cannot be fed back into a server decoder.
        other.encode(Message::new(1), &mut wire).unwrap();
        assert!(matches!(
            server.decode(&mut wire),
            Err(ProtocolError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_relay_roundtrip_and_layout() {
        let mut codec = RelayCodec::default();
        let mut wire = BytesMut::new();
        codec
            .encode(Message::with_payload(0x0102, vec![9, 9]), &mut wire)
            .unwrap();
        assert_eq!(&wire[..], &[0, 0, 0, 4, 0x02, 0x01, 9, 9]);

        let decoded = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(decoded.opcode(), 0x0102);
        assert_eq!(decoded.payload(), &[9, 9]);
    }

    #[test]
    fn test_relay_oversized_rejected() {
        let mut codec = RelayCodec::new(16);
        let mut wire = BytesMut::from(&[0u8, 0, 1, 0][..]);
        assert!(matches!(
            codec.decode(&mut wire),
            Err(ProtocolError::OversizedPacket(256))
        ));
    }
}
