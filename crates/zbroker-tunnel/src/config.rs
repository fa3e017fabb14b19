//! Configuration types for tunnel server and client

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::{ConnectionRole, CAPABILITY_POST_STREAMS};

// =============================================================================
// Default value functions for serde
// =============================================================================

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8001))
}

const fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(30)
}

const fn default_heartbeat_timeout() -> Duration {
    Duration::from_secs(40)
}

const fn default_identify_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_min_client_version() -> String {
    "4.100.0".to_string()
}

fn default_recommended_client_version() -> String {
    "4.182.0".to_string()
}

const fn default_cache_expiry() -> Duration {
    Duration::from_secs(3600)
}

const fn default_cache_check_period() -> Duration {
    Duration::from_secs(60)
}

const fn default_reconnect_interval() -> Duration {
    Duration::from_secs(5)
}

const fn default_max_reconnect_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_capabilities() -> Vec<String> {
    vec![CAPABILITY_POST_STREAMS.to_string()]
}

// =============================================================================
// Server Configuration
// =============================================================================

/// Server-side tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelServerConfig {
    /// Address the tunnel WebSocket listener binds to
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Heartbeat send interval
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Heartbeat timeout (no response = dead)
    #[serde(default = "default_heartbeat_timeout", with = "humantime_serde")]
    pub heartbeat_timeout: Duration,

    /// How long a new connection may take to send `identify`
    #[serde(default = "default_identify_timeout", with = "humantime_serde")]
    pub identify_timeout: Duration,

    /// Clients older than this are rejected
    #[serde(default = "default_min_client_version")]
    pub min_client_version: String,

    /// Clients older than this are told to upgrade
    #[serde(default = "default_recommended_client_version")]
    pub recommended_client_version: String,

    /// Streamed responses not finished within this window are evicted
    #[serde(default = "default_cache_expiry", with = "humantime_serde")]
    pub cache_expiry: Duration,

    /// How often the streaming table is swept
    #[serde(default = "default_cache_check_period", with = "humantime_serde")]
    pub cache_check_period: Duration,
}

impl Default for TunnelServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            heartbeat_interval: default_heartbeat_interval(),
            heartbeat_timeout: default_heartbeat_timeout(),
            identify_timeout: default_identify_timeout(),
            min_client_version: default_min_client_version(),
            recommended_client_version: default_recommended_client_version(),
            cache_expiry: default_cache_expiry(),
            cache_check_period: default_cache_check_period(),
        }
    }
}

impl TunnelServerConfig {
    /// Create a new server config with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error string if:
    /// - `heartbeat_timeout` <= `heartbeat_interval`
    /// - `identify_timeout`, `cache_expiry` or `cache_check_period` is zero
    /// - a client version is not valid semver
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(format!(
                "heartbeat_timeout ({:?}) must be > heartbeat_interval ({:?})",
                self.heartbeat_timeout, self.heartbeat_interval
            ));
        }

        if self.identify_timeout.is_zero() {
            return Err("identify_timeout must be > 0".to_string());
        }

        if self.cache_expiry.is_zero() || self.cache_check_period.is_zero() {
            return Err("cache_expiry and cache_check_period must be > 0".to_string());
        }

        for (field, version) in [
            ("min_client_version", &self.min_client_version),
            ("recommended_client_version", &self.recommended_client_version),
        ] {
            semver::Version::parse(version)
                .map_err(|e| format!("{field} ({version}) is not a valid version: {e}"))?;
        }

        Ok(())
    }
}

// =============================================================================
// Client Configuration
// =============================================================================

/// Client-side tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelClientConfig {
    /// Server tunnel URL (e.g., `wss://broker.example.com:8001`)
    pub server_url: String,

    /// Broker token
    pub token: String,

    /// Stable id of this client process
    #[serde(default)]
    pub client_id: String,

    /// HA role announced at identify
    #[serde(default)]
    pub role: ConnectionRole,

    /// Connection type selecting a per-type ruleset on both legs
    #[serde(default)]
    pub connection_type: Option<String>,

    /// Capabilities announced at identify
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<String>,

    /// Initial reconnect interval
    #[serde(default = "default_reconnect_interval", with = "humantime_serde")]
    pub reconnect_interval: Duration,

    /// Maximum reconnect interval (exponential backoff cap)
    #[serde(default = "default_max_reconnect_interval", with = "humantime_serde")]
    pub max_reconnect_interval: Duration,
}

impl TunnelClientConfig {
    /// Create a new client config
    #[must_use]
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            token: token.into(),
            client_id: uuid::Uuid::new_v4().to_string(),
            role: ConnectionRole::Primary,
            connection_type: None,
            capabilities: default_capabilities(),
            reconnect_interval: default_reconnect_interval(),
            max_reconnect_interval: default_max_reconnect_interval(),
        }
    }

    /// Set the HA role (builder pattern)
    #[must_use]
    pub fn with_role(mut self, role: ConnectionRole) -> Self {
        self.role = role;
        self
    }

    /// Set the connection type (builder pattern)
    #[must_use]
    pub fn with_connection_type(mut self, connection_type: impl Into<String>) -> Self {
        self.connection_type = Some(connection_type.into());
        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error string if:
    /// - `server_url` is empty or doesn't start with `ws://` or `wss://`
    /// - `token` is empty
    /// - `max_reconnect_interval` < `reconnect_interval`
    pub fn validate(&self) -> Result<(), String> {
        if self.server_url.is_empty() {
            return Err("server_url cannot be empty".to_string());
        }

        if !self.server_url.starts_with("ws://") && !self.server_url.starts_with("wss://") {
            return Err("server_url must start with ws:// or wss://".to_string());
        }

        if self.token.trim().is_empty() {
            return Err("token cannot be empty".to_string());
        }

        if self.max_reconnect_interval < self.reconnect_interval {
            return Err(format!(
                "max_reconnect_interval ({:?}) must be >= reconnect_interval ({:?})",
                self.max_reconnect_interval, self.reconnect_interval
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_defaults() {
        let config = TunnelServerConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(40));
        assert_eq!(config.cache_expiry, Duration::from_secs(3600));
        assert_eq!(config.cache_check_period, Duration::from_secs(60));
        assert_eq!(config.min_client_version, "4.100.0");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_server_validate_heartbeat() {
        let config = TunnelServerConfig {
            heartbeat_timeout: Duration::from_secs(30),
            ..TunnelServerConfig::default()
        };
        assert!(config.validate().unwrap_err().contains("heartbeat_timeout"));
    }

    #[test]
    fn test_server_validate_version() {
        let config = TunnelServerConfig {
            min_client_version: "four".to_string(),
            ..TunnelServerConfig::default()
        };
        assert!(config.validate().unwrap_err().contains("min_client_version"));
    }

    #[test]
    fn test_server_humantime_yaml() {
        let config: TunnelServerConfig =
            serde_yaml::from_str("bind: 127.0.0.1:9000\ncache_expiry: 2h\nheartbeat_interval: 10s\n")
                .unwrap();
        assert_eq!(config.bind.port(), 9000);
        assert_eq!(config.cache_expiry, Duration::from_secs(7200));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(40));
    }

    #[test]
    fn test_client_config() {
        let config = TunnelClientConfig::new("wss://broker.example.com", "tok")
            .with_role(ConnectionRole::Secondary)
            .with_connection_type("github");
        assert_eq!(config.role, ConnectionRole::Secondary);
        assert_eq!(config.connection_type.as_deref(), Some("github"));
        assert_eq!(config.capabilities, vec!["post-streams".to_string()]);
        assert!(!config.client_id.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_client_validate() {
        let config = TunnelClientConfig::new("http://broker.example.com", "tok");
        assert!(config.validate().unwrap_err().contains("ws://"));

        let config = TunnelClientConfig::new("ws://broker", " ");
        assert!(config.validate().unwrap_err().contains("token"));

        let mut config = TunnelClientConfig::new("ws://broker", "tok");
        config.max_reconnect_interval = Duration::from_secs(1);
        assert!(config.validate().unwrap_err().contains("max_reconnect_interval"));
    }

    #[test]
    fn test_client_yaml_defaults() {
        let config: TunnelClientConfig =
            serde_yaml::from_str("server_url: ws://broker:8001\ntoken: abc\nrole: secondary\n")
                .unwrap();
        assert_eq!(config.role, ConnectionRole::Secondary);
        assert_eq!(config.reconnect_interval, Duration::from_secs(5));
        assert_eq!(config.max_reconnect_interval, Duration::from_secs(60));
        assert!(config.client_id.is_empty());
    }
}
