//! # Utility Modules
//!
//! Supporting utilities for logging and observability.
//!
//! ## Components
//! - **Logging**: tracing-subscriber setup from [`LoggingConfig`](crate::config::LoggingConfig)
//! - **Metrics**: Thread-safe session, frame and migration counters

pub mod logging;
pub mod metrics;

pub use metrics::{Metrics, MetricsSnapshot};
