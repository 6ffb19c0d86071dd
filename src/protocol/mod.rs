//! # Protocol Layer
//!
//! Everything above raw framing: the plaintext connection handshake, the
//! opcodes the core handles itself, the relay hub message set, and the
//! dispatcher that hands gated business messages to the game layer.
//!
//! ## Components
//! - **Handshake**: 16-byte plaintext greeting carrying both cipher IVs
//! - **Opcode**: client, server and relay opcode tables plus [`opcode::MessageKind`]
//! - **Relay**: role-to-hub messages ([`relay::RelayMessage`])
//! - **Dispatcher**: opcode-keyed business handlers

pub mod dispatcher;
pub mod handshake;
pub mod opcode;
pub mod relay;
