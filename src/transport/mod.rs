//! # Transport Layer
//!
//! Client-facing network listeners.
//!
//! ## Components
//! - **TCP**: [`tcp::RoleServer`], one listener per server role, with
//!   graceful shutdown and a per-connection writer task

pub mod tcp;

pub use tcp::{RoleContext, RoleServer};
