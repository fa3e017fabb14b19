//! Relay configuration shared by the forwarder and the dispatcher

use std::time::Duration;

use serde::{Deserialize, Serialize};

const fn default_socket_max_response_length() -> u64 {
    20_971_520
}

const fn default_downstream_timeout() -> Duration {
    Duration::from_secs(60)
}

const fn default_post_stream_timeout() -> Duration {
    Duration::from_millis(1_200_000)
}

const fn default_inline_response_timeout() -> Duration {
    Duration::from_secs(60)
}

/// Relay behaviour on both legs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Largest body returned inline over the tunnel
    #[serde(default = "default_socket_max_response_length")]
    pub socket_max_response_length: u64,

    /// Skip `BROKER_VAR_SUB` substitution in JSON bodies
    #[serde(default)]
    pub disable_body_vars_substitution: bool,

    /// Skip `x-broker-var-sub` substitution in headers
    #[serde(default)]
    pub disable_header_vars_substitution: bool,

    /// Drop every `x-forwarded-*` and `forwarded` header before calling out
    #[serde(default)]
    pub remove_x_forwarded_headers: bool,

    /// Timeout for buffered outbound calls
    #[serde(default = "default_downstream_timeout", with = "humantime_serde")]
    pub downstream_timeout: Duration,

    /// Timeout for a streamed outbound call and its response-data upload
    #[serde(default = "default_post_stream_timeout", with = "humantime_serde")]
    pub post_stream_timeout: Duration,

    /// How long the forwarder waits for an inline response or stream head
    #[serde(default = "default_inline_response_timeout", with = "humantime_serde")]
    pub inline_response_timeout: Duration,

    /// HTTP base URL of the broker server (client leg only)
    #[serde(default)]
    pub broker_server_url: Option<String>,

    /// Server instance id appended to response-data uploads
    #[serde(default)]
    pub server_id: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            socket_max_response_length: default_socket_max_response_length(),
            disable_body_vars_substitution: false,
            disable_header_vars_substitution: false,
            remove_x_forwarded_headers: false,
            downstream_timeout: default_downstream_timeout(),
            post_stream_timeout: default_post_stream_timeout(),
            inline_response_timeout: default_inline_response_timeout(),
            broker_server_url: None,
            server_id: None,
        }
    }
}

impl RelayConfig {
    /// Set the broker server URL
    #[must_use]
    pub fn with_broker_server_url(mut self, url: impl Into<String>) -> Self {
        self.broker_server_url = Some(url.into());
        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error string if:
    /// - `socket_max_response_length` is zero
    /// - a timeout is zero
    /// - `broker_server_url` is set but is not an http(s) URL
    pub fn validate(&self) -> Result<(), String> {
        if self.socket_max_response_length == 0 {
            return Err("socket_max_response_length must be > 0".to_string());
        }

        if self.downstream_timeout.is_zero()
            || self.post_stream_timeout.is_zero()
            || self.inline_response_timeout.is_zero()
        {
            return Err("relay timeouts must be > 0".to_string());
        }

        if let Some(server_url) = &self.broker_server_url {
            match url::Url::parse(server_url) {
                Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
                Ok(_) => {
                    return Err(format!(
                        "broker_server_url must use http:// or https://, got {server_url}"
                    ));
                }
                Err(e) => return Err(format!("invalid broker_server_url: {e}")),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.socket_max_response_length, 20_971_520);
        assert_eq!(config.post_stream_timeout, Duration::from_secs(1200));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_overrides() {
        let yaml = r"
socket_max_response_length: 1024
remove_x_forwarded_headers: true
downstream_timeout: 5s
broker_server_url: https://broker.example.com
";
        let config: RelayConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.socket_max_response_length, 1024);
        assert!(config.remove_x_forwarded_headers);
        assert_eq!(config.downstream_timeout, Duration::from_secs(5));
        assert_eq!(config.inline_response_timeout, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_server_url() {
        let config = RelayConfig::default().with_broker_server_url("ws://broker.example.com");
        assert!(config.validate().unwrap_err().contains("http://"));

        let config = RelayConfig {
            socket_max_response_length: 0,
            ..RelayConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
