//! # Error Types
//!
//! Error handling for the session and relay core.
//!
//! Every failure a connection can hit is one of these variants. Fatal variants
//! are routed into the single idempotent close path of the owning session, so
//! teardown runs exactly once no matter which signal triggered it.
//!
//! ## Error Categories
//! - **Protocol violations**: bad header check, oversized or truncated frames
//! - **State violations**: a message kind that is illegal in the current session state
//! - **Identity errors**: forged or uncorroborated migration-in, denied authority
//! - **Directory misses**: migration target not registered (recoverable)
//! - **Timeouts and I/O**: idle/migration deadlines, transport failures
//!
//! ## Example Usage
//! ```rust
//! use session_relay::error::{ProtocolError, Result};
//!
//! fn check_len(len: usize) -> Result<()> {
//!     if len > u16::MAX as usize {
//!         return Err(ProtocolError::OversizedPacket(len));
//!     }
//!     Ok(())
//! }
//!
//! assert!(check_len(70_000).unwrap_err().is_fatal());
//! ```

use crate::protocol::relay::RoleId;
use crate::session::state::MigrateState;
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Dispatcher-related error messages
    pub const ERR_DISPATCHER_WRITE_LOCK: &str = "Failed to acquire write lock on dispatcher";
    pub const ERR_DISPATCHER_READ_LOCK: &str = "Failed to acquire read lock on dispatcher";

    /// Framing errors
    pub const ERR_INVALID_HEADER: &str = "Packet header failed the cipher check";
    pub const ERR_SHORT_BODY: &str = "Packet body shorter than its opcode";
    pub const ERR_SHORT_HANDSHAKE: &str = "Handshake shorter than its declared size";
    pub const ERR_HANDSHAKE_SIZE: &str = "Handshake declares an unexpected size";

    /// Connection errors
    pub const ERR_RELAY_LINK_DOWN: &str = "Relay hub link is down";
    pub const ERR_HUB_STOPPED: &str = "Relay hub event loop has stopped";

    /// Session errors
    pub const ERR_IDENTITY_CONFLICT: &str = "Session already holds a different identity";
    pub const ERR_MIGRATION_PENDING: &str = "A migration is already pending for this identity";
    pub const ERR_NO_IDENTITY: &str = "Session has no identity";
}

/// Primary error type for all session, codec and relay operations.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol violation: {0}")]
    ProtocolViolation(&'static str),

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Malformed payload: needed {needed} bytes, {remaining} remaining")]
    MalformedPayload { needed: usize, remaining: usize },

    #[error("Invalid string payload")]
    InvalidString,

    #[error("Opcode {opcode:#06x} is not allowed in state {state:?}")]
    StateViolation { state: MigrateState, opcode: u16 },

    #[error("Illegal state transition from {from:?} to {to:?}")]
    IllegalTransition { from: MigrateState, to: MigrateState },

    #[error("Migration-in identity {claimed} could not be corroborated")]
    IdentityMismatch { claimed: u32 },

    #[error("Relay hub denied authority for identity {0}")]
    AuthorityDenied(u32),

    #[error("Migration target {0} is not registered")]
    DirectoryMiss(RoleId),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Connection timed out (no activity)")]
    ConnectionTimeout,

    #[error("Unknown relay opcode {0:#06x}")]
    UnknownRelayOpcode(u16),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Whether this error must tear down the connection it occurred on.
    ///
    /// Only a directory miss leaves the session usable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ProtocolError::DirectoryMiss(_))
    }

    /// Whether this error should be reported as a security-relevant event.
    pub fn is_security_event(&self) -> bool {
        matches!(
            self,
            ProtocolError::IdentityMismatch { .. }
                | ProtocolError::AuthorityDenied(_)
                | ProtocolError::ProtocolViolation(_)
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
