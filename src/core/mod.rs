//! # Core Wire Components
//!
//! Low-level framing, the stream cipher and the message value type.
//!
//! ## Components
//! - **Rand32**: three-word Tausworthe generator behind the keystream
//! - **Cipher**: per-direction [`cipher::CipherState`] (header check, transform, advance)
//! - **Obfuscation**: pluggable, versioned secondary pass
//! - **Message**: opcode plus cursor-based little-endian payload
//! - **Codec**: tokio-util codecs for client frames and relay frames
//!
//! ## Client Wire Format
//! ```text
//! [Header(4)] [Opcode(2, LE) || Payload(N)]   body enciphered, N + 2 <= 65535
//! ```
//!
//! ## Relay Wire Format
//! ```text
//! [Length(4, BE)] [Opcode(2, LE)] [Payload(N)]
//! ```

pub mod cipher;
pub mod codec;
pub mod message;
pub mod obfuscation;
pub mod rand32;
