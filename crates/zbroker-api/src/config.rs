//! API configuration

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use zbroker_relay::RelayConfig;
use zbroker_tunnel::TunnelServerConfig;

/// Public HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Largest request body accepted on `/broker/{token}/...`
    #[serde(default = "default_request_body_limit")]
    pub request_body_limit: usize,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8000))
}

const fn default_request_body_limit() -> usize {
    20 * 1024 * 1024
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            request_body_limit: default_request_body_limit(),
        }
    }
}

impl ApiConfig {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error string if `request_body_limit` is zero.
    pub fn validate(&self) -> Result<(), String> {
        if self.request_body_limit == 0 {
            return Err("request_body_limit must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Everything the server leg needs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Public HTTP listener
    #[serde(default)]
    pub api: ApiConfig,

    /// Tunnel listener, heartbeats and stream expiry
    #[serde(default)]
    pub tunnel: TunnelServerConfig,

    /// Relay timeouts and limits
    #[serde(default)]
    pub relay: RelayConfig,
}

impl ServerConfig {
    /// Validate every section
    ///
    /// # Errors
    ///
    /// Returns the first section error, prefixed with the section name.
    pub fn validate(&self) -> Result<(), String> {
        self.api.validate().map_err(|e| format!("api: {e}"))?;
        self.tunnel.validate().map_err(|e| format!("tunnel: {e}"))?;
        self.relay.validate().map_err(|e| format!("relay: {e}"))?;
        if self.api.bind == self.tunnel.bind {
            return Err(format!(
                "api and tunnel listeners cannot share {}",
                self.api.bind
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ApiConfig::default();
        assert_eq!(config.bind, "0.0.0.0:8000".parse().unwrap());
        assert_eq!(config.request_body_limit, 20_971_520);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_overrides() {
        let config: ApiConfig = serde_yaml::from_str("bind: 127.0.0.1:9000\n").unwrap();
        assert_eq!(config.bind, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.request_body_limit, 20_971_520);

        let config = ApiConfig {
            request_body_limit: 0,
            ..ApiConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_config_sections() {
        let yaml = r"
api:
  bind: 127.0.0.1:7000
tunnel:
  bind: 127.0.0.1:7001
  cache_expiry: 10m
relay:
  socket_max_response_length: 1024
";
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.tunnel.cache_expiry, std::time::Duration::from_secs(600));
        assert_eq!(config.relay.socket_max_response_length, 1024);
        assert!(config.validate().is_ok());

        let mut clash = config.clone();
        clash.tunnel.bind = clash.api.bind;
        assert!(clash.validate().unwrap_err().contains("cannot share"));
    }
}
