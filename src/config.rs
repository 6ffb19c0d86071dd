//! # Configuration Management
//!
//! Centralized configuration for client-facing roles, their relay link and
//! the relay hub itself.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()` (`SESSION_RELAY_*`)
//!
//! ## Timing
//! Pre-identity connections get the short idle bound; sessions mid-migration
//! get the longer migration bound so a slow hop does not orphan the origin
//! side. All durations are serialized as milliseconds.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Client version announced in the handshake and used to key the ciphers.
pub const CLIENT_VERSION: u16 = 28;

/// Patch version announced in the handshake.
pub const CLIENT_PATCH: u16 = 1;

/// Handshake subtype byte.
pub const HANDSHAKE_SUBTYPE: u8 = 49;

/// Locale byte closing the handshake.
pub const GAME_LOCALE: u8 = 1;

/// Max relay frame size (1 MiB). Relay payloads are small control records.
pub const MAX_RELAY_FRAME_SIZE: usize = 1024 * 1024;

/// Idle bound for connections that have not proven an identity yet.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(20);

/// Bound for sessions waiting on a hand-off.
pub const DEFAULT_MIGRATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Keepalive interval for idle writers.
pub const DEFAULT_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Period of the per-session and hub timers.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// How long the hub keeps a pending hand-off before releasing ownership.
pub const DEFAULT_HANDOFF_TIMEOUT: Duration = Duration::from_secs(60);

/// Graceful shutdown bound.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Client-facing listener
    #[serde(default)]
    pub server: ServerConfig,

    /// Role-to-hub link
    #[serde(default)]
    pub relay: RelayConfig,

    /// Relay hub process
    #[serde(default)]
    pub hub: HubConfig,

    /// Session timers
    #[serde(default)]
    pub session: SessionConfig,

    /// Wire constants
    #[serde(default)]
    pub protocol: ProtocolSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables on top of defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("SESSION_RELAY_SERVER_ADDRESS") {
            config.server.address = addr;
        }

        if let Ok(addr) = std::env::var("SESSION_RELAY_HUB_ADDRESS") {
            config.relay.hub_address = addr.clone();
            config.hub.address = addr;
        }

        if let Ok(timeout) = std::env::var("SESSION_RELAY_IDLE_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.session.idle_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(timeout) = std::env::var("SESSION_RELAY_MIGRATION_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.session.migration_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(version) = std::env::var("SESSION_RELAY_CLIENT_VERSION") {
            if let Ok(val) = version.parse::<u16>() {
                config.protocol.version = val;
            }
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.relay.validate());
        errors.extend(self.hub.validate());
        errors.extend(self.session.validate());
        errors.extend(self.protocol.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn validate_address(kind: &str, address: &str, errors: &mut Vec<String>) {
    if address.is_empty() {
        errors.push(format!("{kind} address cannot be empty"));
    } else if address.parse::<std::net::SocketAddr>().is_err() {
        errors.push(format!(
            "Invalid {} address format: '{address}' (expected format: '0.0.0.0:8484')",
            kind.to_lowercase()
        ));
    }
}

/// Client-facing listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Listen address (e.g., "0.0.0.0:8484")
    pub address: String,

    /// Address published to the hub for redirects; defaults to `address`
    #[serde(default)]
    pub public_address: Option<String>,

    /// Maximum number of concurrent client connections
    pub max_connections: usize,

    /// Timeout for graceful server shutdown
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:8484"),
            public_address: None,
            max_connections: 1000,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// Address that clients should be redirected to.
    pub fn advertised_address(&self) -> &str {
        self.public_address.as_deref().unwrap_or(&self.address)
    }

    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        validate_address("Server", &self.address, &mut errors);
        if let Some(public) = &self.public_address {
            validate_address("Public", public, &mut errors);
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        if self.shutdown_timeout.as_secs() < 1 {
            errors.push("Shutdown timeout too short (minimum: 1s)".to_string());
        } else if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Role-to-hub link configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    /// Address of the relay hub
    pub hub_address: String,

    /// Maximum relay frame size in bytes
    pub max_frame_size: usize,

    /// Timeout for the initial hub connection
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// How long a migration request waits for the hub's answer
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            hub_address: String::from("127.0.0.1:8383"),
            max_frame_size: MAX_RELAY_FRAME_SIZE,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl RelayConfig {
    /// Validate relay link configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        validate_address("Hub", &self.hub_address, &mut errors);

        if self.max_frame_size < 64 {
            errors.push("Relay max frame size too small (minimum: 64 bytes)".to_string());
        } else if self.max_frame_size > 16 * 1024 * 1024 {
            errors.push(format!(
                "Relay max frame size too large: {} bytes (maximum: 16 MB)",
                self.max_frame_size
            ));
        }

        if self.connect_timeout.as_millis() < 100 {
            errors.push("Relay connect timeout too short (minimum: 100ms)".to_string());
        }

        if self.request_timeout.as_millis() < 100 {
            errors.push("Relay request timeout too short (minimum: 100ms)".to_string());
        }

        errors
    }
}

/// Relay hub process configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HubConfig {
    /// Hub listen address
    pub address: String,

    /// How long a granted-but-unclaimed hand-off keeps its ownership entry
    #[serde(with = "duration_serde")]
    pub handoff_timeout: Duration,

    /// Period of the hub's expiry sweep
    #[serde(with = "duration_serde")]
    pub tick_interval: Duration,

    /// Capacity of the hub command queue
    pub command_queue: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:8383"),
            handoff_timeout: DEFAULT_HANDOFF_TIMEOUT,
            tick_interval: DEFAULT_TICK_INTERVAL,
            command_queue: 1024,
        }
    }
}

impl HubConfig {
    /// Validate hub configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        validate_address("Hub", &self.address, &mut errors);

        if self.handoff_timeout < self.tick_interval {
            errors.push("Hand-off timeout must not be shorter than the hub tick".to_string());
        }

        if self.tick_interval.as_millis() < 10 {
            errors.push("Hub tick interval too short (minimum: 10ms)".to_string());
        }

        if self.command_queue == 0 {
            errors.push("Hub command queue must be greater than 0".to_string());
        }

        errors
    }
}

/// Session timer configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Idle bound outside of migration
    #[serde(with = "duration_serde")]
    pub idle_timeout: Duration,

    /// Bound while waiting on a hand-off
    #[serde(with = "duration_serde")]
    pub migration_timeout: Duration,

    /// Keepalive interval for idle writers
    #[serde(with = "duration_serde")]
    pub alive_interval: Duration,

    /// Timer tick period
    #[serde(with = "duration_serde")]
    pub tick_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            migration_timeout: DEFAULT_MIGRATION_TIMEOUT,
            alive_interval: DEFAULT_ALIVE_INTERVAL,
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}

impl SessionConfig {
    /// Validate session timer configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.idle_timeout.as_millis() < 100 {
            errors.push("Idle timeout too short (minimum: 100ms)".to_string());
        } else if self.idle_timeout.as_secs() > 600 {
            errors.push("Idle timeout too long (maximum: 600s)".to_string());
        }

        if self.migration_timeout < self.idle_timeout {
            errors.push("Migration timeout must not be shorter than the idle timeout".to_string());
        }

        if self.alive_interval >= self.idle_timeout {
            errors.push("Alive interval must be shorter than the idle timeout".to_string());
        }

        if self.tick_interval.as_millis() < 10 {
            errors.push("Tick interval too short (minimum: 10ms)".to_string());
        } else if self.tick_interval > self.idle_timeout {
            errors.push("Tick interval must not exceed the idle timeout".to_string());
        }

        errors
    }
}

/// Wire constants shared with the game client
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProtocolSettings {
    /// Client version; keys the receive cipher, its complement keys the send cipher
    pub version: u16,

    /// Patch version announced in the handshake
    pub patch: u16,

    /// Handshake subtype byte
    pub subtype: u8,

    /// Locale byte
    pub locale: u8,

    /// Secondary obfuscation pass version (0 = none, 1 = byte shuffle)
    pub obfuscation: u8,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            version: CLIENT_VERSION,
            patch: CLIENT_PATCH,
            subtype: HANDSHAKE_SUBTYPE,
            locale: GAME_LOCALE,
            obfuscation: 1,
        }
    }
}

impl ProtocolSettings {
    /// Validate wire constants
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.version == 0 || self.version == u16::MAX {
            errors.push(format!(
                "Client version {} would give both directions a degenerate key",
                self.version
            ));
        }

        if crate::core::obfuscation::by_version(self.obfuscation).is_none() {
            errors.push(format!(
                "Unknown obfuscation version: {} (supported: 0, 1)",
                self.obfuscation
            ));
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("session-relay"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        level.as_str().to_lowercase().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
