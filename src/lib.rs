//! # session-relay
//!
//! Session framing, stream cipher and cross-role migration core for game
//! backends split into login, channel and shop roles around a relay hub.
//!
//! ## Layers
//! - [`core`]: Rand32 keystream, per-direction cipher state, secondary
//!   obfuscation pass, message type and tokio-util codecs
//! - [`protocol`]: plaintext handshake, opcode tables, relay messages and
//!   the business dispatcher
//! - [`session`]: migration state machine, the shared [`session::Session`]
//!   and its inbound [`session::Pipeline`]
//! - [`directory`] and [`hub`]: the relay hub's registry and event loop
//! - [`migration`]: role-side hand-off coordination over the relay link
//! - [`transport`]: client-facing TCP listener
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use session_relay::config::NetworkConfig;
//! use session_relay::migration::{MigrationCoordinator, RelayLink};
//! use session_relay::protocol::relay::{Endpoint, RelayMessage, RoleId};
//! use session_relay::session::{ExpectedArrivals, RoleKind};
//! use session_relay::transport::{RoleContext, RoleServer};
//! use session_relay::utils::Metrics;
//!
//! # async fn run() -> session_relay::Result<()> {
//! let config = NetworkConfig::from_env()?;
//! let role = RoleId::Channel { world: 0, channel: 1 };
//! let metrics = Arc::new(Metrics::new());
//! let (coordinator, outbound) = MigrationCoordinator::new(role, &config.relay, metrics.clone());
//!
//! let registration = RelayMessage::RegisterChannel {
//!     world_id: 0,
//!     world_name: "Scania".into(),
//!     channel_id: 1,
//!     endpoint: Endpoint::parse(config.server.advertised_address())?,
//! };
//! RelayLink::spawn(&config.relay, vec![registration], coordinator.clone(), outbound).await?;
//!
//! let ctx = RoleContext::new(config, RoleKind::Channel, coordinator, Arc::new(ExpectedArrivals::new()))?
//!     .with_metrics(metrics);
//! RoleServer::bind(ctx).await?.run_until_ctrl_c().await
//! # }
//! ```

pub mod config;
pub mod core;
pub mod directory;
pub mod error;
pub mod hub;
pub mod migration;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod utils;

pub use error::{ProtocolError, Result};
