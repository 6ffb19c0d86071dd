//! # Client Sessions
//!
//! The per-connection state machine and everything that drives it.
//!
//! ## Components
//! - **State**: [`MigrateState`], [`RoleKind`] and the gate table
//! - **Connection**: the shared [`Session`] object, its send guard and
//!   idempotent close
//! - **Pipeline**: codec, idle-timer and session stages for inbound traffic
//!
//! ## Lifecycle
//! ```text
//! Unidentified -> WaitHandoffIn -> WaitAuthorityConfirmed -> Active
//!     -> WaitAuthorityReleased -> WaitHandoffOut -> Terminal
//! ```
//! Any state may fall to `Terminal`. The only backwards step is the
//! directory-miss rollback `WaitAuthorityReleased -> Active`.

pub mod connection;
pub mod pipeline;
pub mod state;

pub use connection::{CloseReason, FrameSink, MemorySink, Session, SessionListener};
pub use pipeline::{AuthorityClaim, ExpectedArrivals, IdentityVerifier, Pipeline};
pub use state::{MigrateState, RoleKind};
