//! # Configuration Management
//!
//! Centralized configuration for the session core.
//!
//! ## Configuration Sources
//! - TOML files via [`NetworkConfig::from_file`]
//! - Direct instantiation with defaults
//! - Environment overrides via [`NetworkConfig::from_env`] (`TIERED_NETCORE_*`)
//!
//! ## Sections
//! - `tiers`: listen addresses and throttle rules for the lobby, login and world tiers
//! - `transport`: receive capacity, flush cadence, default cipher, redirect settings
//! - `heartbeat`: heartbeat, reaper and idle timings for game-tier sessions
//! - `logging`: subscriber output
//!
//! Durations are written as milliseconds.

use crate::core::codec::DEFAULT_CAPACITY;
use crate::core::packet::MAX_BODY_LEN;
use crate::error::{ProtocolError, Result};
use crate::protocol::throttle::{SquelchRule, ThrottleRule};
use crate::utils::crypto::SALT_SEEDS;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Prefix of every environment override.
pub const ENV_PREFIX: &str = "TIERED_NETCORE_";

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    #[serde(default)]
    pub tiers: TiersConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

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

    /// Defaults overridden by `TIERED_NETCORE_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|name| std::env::var(format!("{ENV_PREFIX}{name}")).ok())?;
        Ok(config)
    }

    fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("LOBBY_ADDRESS") {
            self.tiers.lobby.address = addr;
        }
        if let Some(addr) = lookup("LOGIN_ADDRESS") {
            self.tiers.login.address = addr;
        }
        if let Some(addr) = lookup("WORLD_ADDRESS") {
            self.tiers.world.address = addr;
        }

        if let Some(addr) = lookup("REDIRECT_ADDRESS") {
            self.transport.redirect_address = addr.parse().map_err(|_| {
                ProtocolError::ConfigError(format!("Invalid {ENV_PREFIX}REDIRECT_ADDRESS: {addr}"))
            })?;
        }

        if let Some(val) = lookup("FLUSH_INTERVAL_MS").and_then(|v| v.parse::<u64>().ok()) {
            self.transport.flush_interval = Duration::from_millis(val);
        }

        if let Some(val) = lookup("REAP_THRESHOLD_MS").and_then(|v| v.parse::<u64>().ok()) {
            self.heartbeat.reap_threshold = Duration::from_millis(val);
        }

        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.log_level = level.parse().map_err(|_| {
                ProtocolError::ConfigError(format!("Invalid {ENV_PREFIX}LOG_LEVEL: {level}"))
            })?;
        }

        Ok(())
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

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.tiers.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.heartbeat.validate());
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

/// Listen settings for the three protocol tiers
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TiersConfig {
    pub lobby: TierConfig,
    pub login: TierConfig,
    pub world: TierConfig,
}

impl Default for TiersConfig {
    fn default() -> Self {
        Self {
            lobby: TierConfig::new("0.0.0.0:2610"),
            login: TierConfig::new("0.0.0.0:2611"),
            world: TierConfig {
                throttles: default_world_throttles(),
                ..TierConfig::new("0.0.0.0:2612")
            },
        }
    }
}

impl TiersConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();

        for (name, tier) in [
            ("lobby", &self.lobby),
            ("login", &self.login),
            ("world", &self.world),
        ] {
            errors.extend(tier.validate(name));
            if !tier.enabled {
                continue;
            }
            // Port 0 asks the OS for an ephemeral port, so it never collides.
            if let Ok(addr) = tier.address.parse::<SocketAddr>() {
                if addr.port() != 0 && !seen.insert(addr) {
                    errors.push(format!("Tier '{name}' reuses listen address {addr}"));
                }
            }
        }

        errors
    }
}

/// One listening tier
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TierConfig {
    /// Listen address (e.g., "0.0.0.0:2610")
    pub address: String,

    /// Whether the tier accepts connections
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Per-opcode throttle rules applied to this tier's inbound frames
    #[serde(default)]
    pub throttles: Vec<ThrottleRule>,
}

fn default_true() -> bool {
    true
}

impl TierConfig {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            enabled: true,
            throttles: Vec::new(),
        }
    }

    pub fn validate(&self, name: &str) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push(format!("Tier '{name}' address cannot be empty"));
        } else if self.address.parse::<SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid tier '{name}' address format: '{}' (expected format: '0.0.0.0:2610')",
                self.address
            ));
        }

        let mut opcodes = HashSet::new();
        for rule in &self.throttles {
            if !opcodes.insert(rule.opcode) {
                errors.push(format!(
                    "Tier '{name}' has more than one throttle rule for opcode 0x{:02X}",
                    rule.opcode
                ));
            }
            errors.extend(
                rule.validate()
                    .into_iter()
                    .map(|e| format!("Tier '{name}': {e}")),
            );
        }

        errors
    }
}

/// Throttle rules for in-game opcodes
pub fn default_world_throttles() -> Vec<ThrottleRule> {
    vec![
        // walk
        ThrottleRule::new(0x06, Duration::from_millis(250), Duration::ZERO, 500),
        // dialog response
        ThrottleRule::new(0x3A, Duration::from_millis(100), Duration::from_millis(1000), 500),
        // refresh
        ThrottleRule::new(0x38, Duration::from_millis(600), Duration::ZERO, 500),
        // menu response
        ThrottleRule::new(0x39, Duration::from_millis(200), Duration::from_millis(1000), 500),
        // assail
        ThrottleRule::new(0x13, Duration::from_millis(800), Duration::ZERO, 0),
        // use skill
        ThrottleRule::new(0x3E, Duration::from_millis(500), Duration::ZERO, 0),
        // cast spell
        ThrottleRule::new(0x0F, Duration::from_millis(500), Duration::ZERO, 0),
        // use item
        ThrottleRule::new(0x1C, Duration::from_millis(50), Duration::ZERO, 0),
    ]
}

/// Transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Receive buffer capacity per connection; a buffer that would grow past
    /// this closes the connection
    pub receive_buffer_capacity: usize,

    /// Cadence of the per-tier flush scheduler
    #[serde(with = "duration_serde")]
    pub flush_interval: Duration,

    /// Salt table index handed to lobby sessions
    pub default_seed: u8,

    /// Static key handed to lobby sessions
    pub default_key: String,

    /// Address advertised to clients in redirect frames
    pub redirect_address: Ipv4Addr,

    /// Transmit delay applied to redirect frames
    #[serde(with = "duration_serde")]
    pub redirect_delay: Duration,

    /// Time allowed for sessions to drain on shutdown
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            receive_buffer_capacity: DEFAULT_CAPACITY,
            flush_interval: Duration::from_millis(50),
            default_seed: 0,
            default_key: String::from("UrkcnItnI"),
            redirect_address: Ipv4Addr::LOCALHOST,
            redirect_delay: Duration::from_millis(250),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.receive_buffer_capacity < 1024 {
            errors.push("Receive buffer capacity too small (minimum: 1 KB)".to_string());
        } else if self.receive_buffer_capacity > 16 * 1024 * 1024 {
            errors.push(format!(
                "Receive buffer capacity too large: {} bytes (maximum: 16 MB)",
                self.receive_buffer_capacity
            ));
        } else if self.receive_buffer_capacity < MAX_BODY_LEN + 3 {
            errors.push(format!(
                "WARNING: Receive buffer capacity {} is below the largest legal frame; large frames will disconnect",
                self.receive_buffer_capacity
            ));
        }

        if self.flush_interval.is_zero() {
            errors.push("Flush interval must be greater than 0".to_string());
        } else if self.flush_interval > Duration::from_secs(1) {
            errors.push("Flush interval too long (maximum: 1s)".to_string());
        }

        if self.default_seed >= SALT_SEEDS {
            errors.push(format!(
                "Invalid default seed: {} (valid range: 0-{})",
                self.default_seed,
                SALT_SEEDS - 1
            ));
        }

        if self.default_key.is_empty() {
            errors.push("Default key cannot be empty".to_string());
        } else if self.default_key.len() > u8::MAX as usize {
            errors.push("Default key too long (maximum: 255 bytes)".to_string());
        }

        if self.redirect_delay > Duration::from_secs(5) {
            errors.push("Redirect delay too long (maximum: 5s)".to_string());
        }

        if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Heartbeat, reaper and idle timings for game-tier sessions
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HeartbeatConfig {
    /// Interval between byte heartbeats (0x3B)
    #[serde(with = "duration_serde")]
    pub byte_interval: Duration,

    /// Interval between tick heartbeats (0x68)
    #[serde(with = "duration_serde")]
    pub tick_interval: Duration,

    /// No heartbeat is sent to a session younger than this
    #[serde(with = "duration_serde")]
    pub warmup: Duration,

    /// Sessions with no accepted heartbeat echo for longer than this are reaped
    #[serde(with = "duration_serde")]
    pub reap_threshold: Duration,

    #[serde(with = "duration_serde")]
    pub reap_check_interval: Duration,

    /// Time without inbound frames before the idle flag toggles
    #[serde(with = "duration_serde")]
    pub idle_threshold: Duration,

    #[serde(with = "duration_serde")]
    pub idle_check_interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            byte_interval: Duration::from_secs(60),
            tick_interval: Duration::from_secs(60),
            warmup: Duration::from_secs(60),
            reap_threshold: Duration::from_secs(180),
            reap_check_interval: Duration::from_secs(5),
            idle_threshold: Duration::from_secs(60),
            idle_check_interval: Duration::from_secs(30),
        }
    }
}

impl HeartbeatConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for (name, value) in [
            ("Byte heartbeat interval", self.byte_interval),
            ("Tick heartbeat interval", self.tick_interval),
            ("Reap check interval", self.reap_check_interval),
            ("Idle check interval", self.idle_check_interval),
        ] {
            if value.as_millis() < 100 {
                errors.push(format!("{name} too short (minimum: 100ms)"));
            } else if value.as_secs() > 3600 {
                errors.push(format!("{name} too long (maximum: 1 hour)"));
            }
        }

        let longest = self.byte_interval.max(self.tick_interval);
        if self.reap_threshold <= longest {
            errors.push(format!(
                "Reap threshold ({}ms) must exceed the longest heartbeat interval ({}ms)",
                self.reap_threshold.as_millis(),
                longest.as_millis()
            ));
        }

        if self.idle_threshold.is_zero() {
            errors.push("Idle threshold must be greater than 0".to_string());
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
            app_name: String::from("tiered-netcore"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
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

impl ThrottleRule {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.interval.is_zero() {
            errors.push(format!(
                "Throttle interval for opcode 0x{:02X} must be greater than 0",
                self.opcode
            ));
        }
        if let Some(SquelchRule { count, interval, .. }) = self.squelch {
            if count == 0 {
                errors.push(format!(
                    "Squelch count for opcode 0x{:02X} must be greater than 0",
                    self.opcode
                ));
            }
            if interval.is_zero() {
                errors.push(format!(
                    "Squelch interval for opcode 0x{:02X} must be greater than 0",
                    self.opcode
                ));
            }
        }
        errors
    }
}

/// Helper module for Duration serialization/deserialization
pub(crate) mod duration_serde {
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
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
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
