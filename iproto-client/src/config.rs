//! Client configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via IPROTO_CONFIG)
//! 3. Environment variables

use iproto_protocol::{AuthMechanism, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default group tag used when a single address is configured.
pub const DEFAULT_TAG: &str = "default";

/// Declarative description of a homogeneous set of connections to one
/// address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConnectionGroup {
    /// Unique label of the group within a pool.
    pub tag: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub auth_mechanism: AuthMechanism,
    /// Number of connections in the group.
    pub size: usize,
}

impl Default for InstanceConnectionGroup {
    fn default() -> Self {
        Self {
            tag: DEFAULT_TAG.to_string(),
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            user: "guest".to_string(),
            password: String::new(),
            auth_mechanism: AuthMechanism::ChapSha1,
            size: 1,
        }
    }
}

impl InstanceConnectionGroup {
    pub fn new(tag: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            tag: tag.into(),
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    pub fn with_auth_mechanism(mut self, mechanism: AuthMechanism) -> Self {
        self.auth_mechanism = mechanism;
        self
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// `host:port` of the group.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Connection selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancerKind {
    /// Walk every connection of one tag before moving to the next tag.
    #[default]
    RoundRobin,
    /// Alternate tags on every call, with a separate cursor per tag.
    DistributingRoundRobin,
}

impl FromStr for BalancerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "round_robin" | "round-robin" | "rr" => Ok(BalancerKind::RoundRobin),
            "distributing_round_robin" | "distributing-round-robin" | "drr" => {
                Ok(BalancerKind::DistributingRoundRobin)
            }
            other => Err(ConfigError::Validation(format!("unknown balancer: {other}"))),
        }
    }
}

/// Heartbeat configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Interval between pings in milliseconds; also the ping timeout.
    pub ping_interval_ms: u64,
    /// Number of most recent pings considered.
    pub window_size: usize,
    /// Failed pings within the window that mark a connection unhealthy.
    pub invalidation_threshold: usize,
    /// Consecutive unhealthy windows after which the connection is
    /// closed and re-established.
    pub death_threshold: usize,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: 3000,
            window_size: 4,
            invalidation_threshold: 2,
            death_threshold: 4,
        }
    }
}

impl HeartbeatConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.ping_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "heartbeat.ping_interval_ms must be positive".into(),
            ));
        }
        if self.window_size == 0 || self.invalidation_threshold == 0 {
            return Err(ConfigError::Validation(
                "heartbeat window and invalidation threshold must be positive".into(),
            ));
        }
        if self.invalidation_threshold > self.window_size {
            return Err(ConfigError::Validation(
                "heartbeat.invalidation_threshold exceeds window_size".into(),
            ));
        }
        if self.death_threshold == 0 {
            return Err(ConfigError::Validation(
                "heartbeat.death_threshold must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Connection groups making up the pool.
    pub groups: Vec<InstanceConnectionGroup>,
    /// Selection policy.
    pub balancer: BalancerKind,
    /// TCP connect plus greeting timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Default per-request timeout in milliseconds.
    pub request_timeout_ms: u64,
    /// Socket read buffer size.
    pub read_buffer_size: usize,
    /// Heartbeat settings; disabled when absent.
    pub heartbeat: Option<HeartbeatConfig>,
    /// Keep a schema cache and refresh it on version changes.
    pub fetch_schema: bool,
    /// Pass responses with an older schema version through instead of failing.
    pub ignore_stale_schema: bool,
    /// Time allowed for in-flight requests to drain on close.
    pub graceful_close_timeout_ms: u64,
    /// Send an ID request after the greeting to negotiate features.
    pub identify: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            groups: vec![InstanceConnectionGroup::default()],
            balancer: BalancerKind::RoundRobin,
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            read_buffer_size: crate::connection::DEFAULT_READ_BUFFER_SIZE,
            heartbeat: None,
            fetch_schema: true,
            ignore_stale_schema: false,
            graceful_close_timeout_ms: 5_000,
            identify: true,
        }
    }
}

impl ClientConfig {
    /// Single-group configuration for one address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            groups: vec![InstanceConnectionGroup::new(DEFAULT_TAG, host, port)],
            ..Default::default()
        }
    }

    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("IPROTO_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: ClientConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Ok(())
    }

    /// Applies environment variable overrides. Address and credential
    /// overrides apply to the first group.
    pub fn apply_env_overrides(&mut self) {
        if self.groups.is_empty() {
            self.groups.push(InstanceConnectionGroup::default());
        }
        let group = &mut self.groups[0];

        if let Ok(host) = std::env::var("IPROTO_HOST") {
            group.host = host;
        }
        if let Ok(port) = std::env::var("IPROTO_PORT") {
            if let Ok(p) = port.parse() {
                group.port = p;
            }
        }
        if let Ok(user) = std::env::var("IPROTO_USER") {
            group.user = user;
        }
        if let Ok(password) = std::env::var("IPROTO_PASSWORD") {
            group.password = password;
        }
        if let Ok(size) = std::env::var("IPROTO_POOL_SIZE") {
            if let Ok(n) = size.parse() {
                group.size = n;
            }
        }

        if let Ok(balancer) = std::env::var("IPROTO_BALANCER") {
            if let Ok(kind) = balancer.parse() {
                self.balancer = kind;
            }
        }
        if let Ok(timeout) = std::env::var("IPROTO_CONNECT_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.connect_timeout_ms = ms;
            }
        }
        if let Ok(timeout) = std::env::var("IPROTO_REQUEST_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.request_timeout_ms = ms;
            }
        }
    }

    /// Rejects configurations that cannot produce a working pool.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_groups(&self.groups)?;
        if self.connect_timeout_ms == 0 || self.request_timeout_ms == 0 {
            return Err(ConfigError::Validation("timeouts must be positive".into()));
        }
        if let Some(ref heartbeat) = self.heartbeat {
            heartbeat.validate()?;
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn graceful_close_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_close_timeout_ms)
    }
}

/// Checks tags are non-empty and unique and sizes are positive.
pub fn validate_groups(groups: &[InstanceConnectionGroup]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for group in groups {
        if group.tag.is_empty() {
            return Err(ConfigError::Validation("group tag must not be empty".into()));
        }
        if !seen.insert(group.tag.as_str()) {
            return Err(ConfigError::Validation(format!(
                "duplicate group tag: {}",
                group.tag
            )));
        }
        if group.size == 0 {
            return Err(ConfigError::Validation(format!(
                "group {} must have at least one connection",
                group.tag
            )));
        }
    }
    Ok(())
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {1}", .0.display())]
    Io(PathBuf, std::io::Error),

    #[error("failed to parse config file '{}': {1}", .0.display())]
    Parse(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.groups.len(), 1);
        assert_eq!(config.groups[0].port, DEFAULT_PORT);
        assert_eq!(config.groups[0].tag, DEFAULT_TAG);
        assert_eq!(config.balancer, BalancerKind::RoundRobin);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let mut config = ClientConfig::new("10.0.0.1", 3302);
        config.balancer = BalancerKind::DistributingRoundRobin;
        config.heartbeat = Some(HeartbeatConfig::default());
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: ClientConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
groups:
  - tag: node-1
    host: db1
    size: 3
    user: admin
    password: secret
    auth_mechanism: pap-sha256
  - tag: node-2
    host: db2
balancer: distributing_round_robin
"#;
        let config: ClientConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.groups.len(), 2);
        assert_eq!(config.groups[0].size, 3);
        assert_eq!(config.groups[0].auth_mechanism, AuthMechanism::PapSha256);
        assert_eq!(config.groups[1].port, DEFAULT_PORT);
        assert_eq!(config.groups[1].size, 1);
        assert_eq!(config.balancer, BalancerKind::DistributingRoundRobin);
        assert!(config.fetch_schema);
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("client.yaml");
        let config = ClientConfig::new("db", 3301);
        config.save(&path).unwrap();
        let loaded = ClientConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file() {
        let result = ClientConfig::from_file("/nonexistent/client.yaml");
        assert!(matches!(result, Err(ConfigError::Io(..))));
    }

    #[test]
    fn test_validation() {
        let mut config = ClientConfig::default();
        config.groups.push(InstanceConnectionGroup::default());
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        let mut config = ClientConfig::default();
        config.groups[0].size = 0;
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.request_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.heartbeat = Some(HeartbeatConfig {
            window_size: 2,
            invalidation_threshold: 3,
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_balancer_parse() {
        assert_eq!("rr".parse::<BalancerKind>().unwrap(), BalancerKind::RoundRobin);
        assert_eq!(
            "distributing_round_robin".parse::<BalancerKind>().unwrap(),
            BalancerKind::DistributingRoundRobin
        );
        assert!("random".parse::<BalancerKind>().is_err());
    }
}
