//! Configuration file loading

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use zbroker_api::ServerConfig;
use zbroker_filter::{RuleSet, Variables};
use zbroker_observability::ObservabilityConfig;
use zbroker_relay::RelayConfig;
use zbroker_tunnel::ConnectionRole;

/// Default port of the server's tunnel listener
pub(crate) const DEFAULT_TUNNEL_PORT: u16 = 8001;

/// Top level of the YAML configuration file
#[derive(Debug, Default, Deserialize)]
pub(crate) struct FileConfig {
    #[serde(default)]
    pub(crate) observability: ObservabilityConfig,

    /// Substitution variables, layered over the process environment
    #[serde(default)]
    pub(crate) variables: HashMap<String, String>,

    #[serde(default)]
    pub(crate) server: ServerSection,

    #[serde(default)]
    pub(crate) client: ClientSection,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ServerSection {
    #[serde(flatten)]
    pub(crate) config: ServerConfig,

    /// Accept rules file
    #[serde(default)]
    pub(crate) accept: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ClientSection {
    #[serde(default)]
    pub(crate) token: Option<String>,

    #[serde(default)]
    pub(crate) server_url: Option<String>,

    #[serde(default)]
    pub(crate) tunnel_url: Option<String>,

    #[serde(default)]
    pub(crate) accept: Option<PathBuf>,

    #[serde(default)]
    pub(crate) connection_type: Option<String>,

    #[serde(default)]
    pub(crate) role: ConnectionRole,

    #[serde(default)]
    pub(crate) relay: RelayConfig,
}

impl FileConfig {
    /// Load from `path`, or defaults when no file was given
    pub(crate) fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Environment variables with the file's `variables` on top
    pub(crate) fn variables(&self) -> Variables {
        Variables::from_env().merged(self.variables.clone())
    }
}

/// Read an accept rules file, keeping the raw JSON for `/connection-status`
pub(crate) fn load_rules(path: &Path) -> Result<(RuleSet, serde_json::Value)> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read accept rules {}", path.display()))?;
    let rules = RuleSet::from_json(&raw)
        .with_context(|| format!("Invalid accept rules in {}", path.display()))?;
    let value = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid JSON in {}", path.display()))?;
    Ok((rules, value))
}

/// Tunnel URL for a server HTTP URL: same host, `ws`/`wss`, tunnel port
pub(crate) fn derive_tunnel_url(server_url: &str) -> Result<String> {
    let mut url = url::Url::parse(server_url)
        .with_context(|| format!("Invalid server URL {server_url}"))?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => anyhow::bail!("Unsupported server URL scheme {other}"),
    };
    url.set_scheme(scheme)
        .map_err(|()| anyhow::anyhow!("Cannot derive tunnel URL from {server_url}"))?;
    url.set_port(Some(DEFAULT_TUNNEL_PORT))
        .map_err(|()| anyhow::anyhow!("Cannot derive tunnel URL from {server_url}"))?;
    url.set_path("");
    Ok(url.to_string().trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_file() {
        let yaml = r#"
observability:
  logging:
    level: debug
variables:
  GITHUB_TOKEN: ghp_x
server:
  api:
    bind: 0.0.0.0:9000
  accept: server-accept.json
client:
  token: tok
  server_url: https://broker.example.com
  role: secondary
  relay:
    remove_x_forwarded_headers: true
"#;
        let config: FileConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.config.api.bind.port(), 9000);
        assert_eq!(config.server.accept, Some(PathBuf::from("server-accept.json")));
        assert_eq!(config.client.role, ConnectionRole::Secondary);
        assert!(config.client.relay.remove_x_forwarded_headers);
        assert_eq!(config.variables().get("GITHUB_TOKEN"), Some("ghp_x"));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = FileConfig::load(Some(Path::new("/nonexistent/zbroker.yaml"))).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to read config file"));
        assert!(FileConfig::load(None).is_ok());
    }

    #[test]
    fn test_derive_tunnel_url() {
        assert_eq!(
            derive_tunnel_url("https://broker.example.com").unwrap(),
            "wss://broker.example.com:8001"
        );
        assert_eq!(
            derive_tunnel_url("http://localhost:8000/").unwrap(),
            "ws://localhost:8001"
        );
        assert!(derive_tunnel_url("ftp://x").is_err());
    }
}
