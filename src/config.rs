//! WolfElect Configuration
//!
//! This module provides configuration structures for an election
//! participant: its identity, the coordination service to reach, and the
//! election it joins.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::coordination::Acl;
use crate::election::sequence::{format_ticket, parse_sequence};
use crate::election::ElectionParams;

/// Main WolfElect configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfElectConfig {
    /// Node-specific configuration
    #[serde(default)]
    pub node: NodeConfig,

    /// Coordination service configuration
    pub coordination: CoordinationConfig,

    /// Election configuration
    #[serde(default)]
    pub election: ElectionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Identity stored in this node's ticket
    #[serde(default = "default_node_id")]
    pub id: String,
}

/// Coordination service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Server addresses (host:port)
    pub addresses: Vec<String>,

    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
}

/// Election configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Path under which tickets are registered
    #[serde(default = "default_election_path")]
    pub path: String,

    /// Ticket name prefix
    #[serde(default = "default_ticket_prefix")]
    pub ticket_prefix: String,

    /// Leadership poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_node_id() -> String {
    format!("node-{}", uuid::Uuid::new_v4())
}

fn default_session_timeout_ms() -> u64 {
    1000
}

fn default_election_path() -> String {
    "/ElectMaster".to_string()
}

fn default_ticket_prefix() -> String {
    "node-".to_string()
}

fn default_poll_interval_ms() -> u64 {
    333
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: default_node_id(),
        }
    }
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            path: default_election_path(),
            ticket_prefix: default_ticket_prefix(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WolfElectConfig {
    /// Build a configuration from the three essentials
    pub fn new(addresses: Vec<String>, session_timeout: Duration, path: impl Into<String>) -> Self {
        Self {
            node: NodeConfig::default(),
            coordination: CoordinationConfig {
                addresses,
                session_timeout_ms: session_timeout.as_millis() as u64,
            },
            election: ElectionConfig {
                path: path.into(),
                ..ElectionConfig::default()
            },
            logging: LoggingConfig::default(),
        }
    }

    /// Set the node identity
    pub fn with_node_id(mut self, id: impl Into<String>) -> Self {
        self.node.id = id.into();
        self
    }

    /// Set the leadership poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.election.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfElectConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.coordination.addresses.is_empty() {
            return Err(crate::Error::Config(
                "coordination.addresses cannot be empty".into(),
            ));
        }

        if self.coordination.session_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "coordination.session_timeout_ms must be positive".into(),
            ));
        }

        let path = &self.election.path;
        if !path.starts_with('/') || path == "/" || path.ends_with('/') || path.contains("//") {
            return Err(crate::Error::Config(format!(
                "election.path {:?} must be an absolute node path",
                path
            )));
        }

        if self.election.ticket_prefix.contains('/') {
            return Err(crate::Error::Config(
                "election.ticket_prefix cannot contain '/'".into(),
            ));
        }

        // Every ticket this node registers must parse back to its sequence
        let sample = format_ticket(&self.election.ticket_prefix, 0);
        if !matches!(parse_sequence(&sample), Ok(0)) {
            return Err(crate::Error::Config(format!(
                "election.ticket_prefix {:?} does not produce parseable tickets",
                self.election.ticket_prefix
            )));
        }

        if self.election.poll_interval_ms == 0 {
            return Err(crate::Error::Config(
                "election.poll_interval_ms must be positive".into(),
            ));
        }

        Ok(())
    }

    /// Get session timeout as Duration
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.coordination.session_timeout_ms)
    }

    /// Get leadership poll interval as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.election.poll_interval_ms)
    }

    /// Election parameters for a participant
    pub fn election_params(&self) -> ElectionParams {
        ElectionParams {
            node_id: self.node.id.clone(),
            path: self.election.path.clone(),
            ticket_prefix: self.election.ticket_prefix.clone(),
            poll_interval: self.poll_interval(),
            acl: Acl::open_unsafe(),
        }
    }
}
