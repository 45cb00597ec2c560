//! Configuration management for a peer node.
//!
//! This module provides TOML-based configuration with support for multiple
//! configuration sources (defaults, file, environment variables) and
//! validation of configuration parameters.

use crate::transport::Timings;
use crate::utils::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "peer.toml";

/// Environment variable prefix for configuration
pub const ENV_PREFIX: &str = "PEER";

/// Complete configuration for a node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Local identity and initial peers
    pub node: IdentityConfig,
    /// Heartbeat and deadline tuning
    pub liveness: LivenessConfig,
    /// Discovery responder
    pub discovery: DiscoveryConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Local identity and bootstrap list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Display name announced to peers
    pub name: String,
    /// Host to listen on
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Addresses to dial at startup
    pub peers: Vec<String>,
}

/// Liveness timings, in seconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// Interval between heartbeats
    pub ping_interval_secs: u64,
    /// Write deadline; must exceed the ping interval
    pub ping_deadline_secs: u64,
    /// Idle time after which an inbound link is dropped
    pub read_deadline_secs: u64,
    /// Pause between dial attempts
    pub redial_backoff_secs: u64,
}

/// Discovery responder configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Run a discovery responder next to the node
    pub enabled: bool,
    /// Port of the discovery responder
    pub port: u16,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        let name = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .ok()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| "peer".to_string());

        Self {
            name,
            host: crate::defaults::DEFAULT_HOST.to_string(),
            port: crate::defaults::DEFAULT_PORT,
            peers: Vec::new(),
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: crate::defaults::PING_INTERVAL.as_secs(),
            ping_deadline_secs: crate::defaults::PING_DEADLINE.as_secs(),
            read_deadline_secs: crate::defaults::READ_DEADLINE.as_secs(),
            redial_backoff_secs: crate::defaults::REDIAL_BACKOFF.as_secs(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: crate::defaults::DEFAULT_DISCOVERY_PORT,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LivenessConfig {
    /// Runtime timings for connections
    pub fn timings(&self) -> Timings {
        Timings {
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            ping_deadline: Duration::from_secs(self.ping_deadline_secs),
            read_deadline: Duration::from_secs(self.read_deadline_secs),
            redial_backoff: Duration::from_secs(self.redial_backoff_secs),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed. Values are not
    /// validated; call [`NodeConfig::validate`] once all overrides are in.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(ConfigError::from)?;
        Ok(config)
    }

    /// Load configuration with multiple sources (default, file, environment)
    ///
    /// An explicit `config_file` that does not exist is an error; without
    /// one, `./peer.toml` and the user config directory are tried in order.
    /// The result is not validated, so command-line flags can still fix a
    /// bad value before [`NodeConfig::validate`] runs.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = config_file {
            config = config.merge(Self::from_file(path)?);
        } else {
            for location in Self::default_locations() {
                if location.exists() {
                    config = config.merge(Self::from_file(&location)?);
                    break;
                }
            }
        }

        config.merge_from_env()
    }

    /// Candidate paths for the configuration file, in lookup order
    pub fn default_locations() -> Vec<PathBuf> {
        vec![
            PathBuf::from(DEFAULT_CONFIG_FILE),
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("p2p-fileshare")
                .join(DEFAULT_CONFIG_FILE),
        ]
    }

    /// Save configuration to a TOML file, creating parent directories
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|_| ConfigError::DirectoryCreation {
                path: parent.display().to_string(),
            })?;
        }

        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Merge this configuration with another, preferring values from other
    pub fn merge(mut self, other: Self) -> Self {
        self.node = other.node;
        self.liveness = other.liveness;
        self.discovery = other.discovery;
        self.logging = other.logging;
        self
    }

    /// Apply `PEER_*` environment overrides
    fn merge_from_env(mut self) -> Result<Self> {
        if let Some(name) = env_var("NAME") {
            self.node.name = name;
        }

        if let Some(host) = env_var("HOST") {
            self.node.host = host;
        }

        if let Some(port) = env_var("PORT") {
            self.node.port = parse_env("PORT", port)?;
        }

        if let Some(peers) = env_var("PEERS") {
            self.node.peers = peers
                .split(',')
                .map(str::trim)
                .filter(|peer| !peer.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(port) = env_var("DISCOVERY_PORT") {
            self.discovery.port = parse_env("DISCOVERY_PORT", port)?;
            self.discovery.enabled = true;
        }

        if let Some(level) = env_var("LOG_LEVEL") {
            self.logging.level = level;
        }

        Ok(self)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        if self.node.name.trim().is_empty() {
            return Err(invalid("node.name", &self.node.name));
        }

        if self.node.host.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "node.host".to_string(),
            }
            .into());
        }

        if self.node.port == 0 {
            return Err(invalid("node.port", "0"));
        }

        if self.discovery.enabled && self.discovery.port == 0 {
            return Err(invalid("discovery.port", "0"));
        }

        let liveness = &self.liveness;
        for (field, value) in [
            ("liveness.ping_interval_secs", liveness.ping_interval_secs),
            ("liveness.ping_deadline_secs", liveness.ping_deadline_secs),
            ("liveness.read_deadline_secs", liveness.read_deadline_secs),
            ("liveness.redial_backoff_secs", liveness.redial_backoff_secs),
        ] {
            if value == 0 {
                return Err(invalid(field, "0"));
            }
        }

        // A deadline shorter than the interval would fire before the next ping.
        if liveness.ping_deadline_secs <= liveness.ping_interval_secs {
            return Err(invalid(
                "liveness.ping_deadline_secs",
                &liveness.ping_deadline_secs.to_string(),
            ));
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return Err(invalid("logging.level", &self.logging.level)),
        }

        Ok(())
    }

    /// Listen address as `host:port`
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.node.host, self.node.port)
    }

    /// Get the configuration as a pretty-printed TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            ConfigError::ParseError {
                reason: e.to_string(),
            }
            .into()
        })
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}_{key}")).ok()
}

fn parse_env<T: std::str::FromStr>(key: &str, value: String) -> Result<T> {
    value.parse().map_err(|_| {
        ConfigError::InvalidValue {
            field: format!("{ENV_PREFIX}_{key}"),
            value,
        }
        .into()
    })
}

fn invalid(field: &str, value: &str) -> crate::utils::OverlayError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    }
    .into()
}
