//! `zbroker client`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use zbroker_filter::CompiledRuleSet;
use zbroker_relay::{Dispatcher, PluginRegistry};
use zbroker_tunnel::{mask_token, ConnectionRole, TunnelAgent, TunnelClientConfig};

use super::shutdown_signal;
use crate::config::{derive_tunnel_url, load_rules, FileConfig};

pub(crate) struct ClientArgs {
    pub(crate) token: Option<String>,
    pub(crate) server_url: Option<String>,
    pub(crate) tunnel_url: Option<String>,
    pub(crate) accept: Option<PathBuf>,
    pub(crate) connection_type: Option<String>,
    pub(crate) role: Option<ConnectionRole>,
}

pub(crate) async fn run_client(args: ClientArgs, file: FileConfig) -> Result<()> {
    let vars = Arc::new(file.variables());
    let section = file.client;

    let token = args
        .token
        .or(section.token)
        .context("A broker token is required (--token or BROKER_TOKEN)")?;
    let server_url = args
        .server_url
        .or(section.server_url)
        .context("A server URL is required (--server-url or BROKER_SERVER_URL)")?;
    let tunnel_url = match args.tunnel_url.or(section.tunnel_url) {
        Some(url) => url,
        None => derive_tunnel_url(&server_url)?,
    };
    let connection_type = args.connection_type.or(section.connection_type);
    let role = args.role.unwrap_or(section.role);

    let accept = args
        .accept
        .or(section.accept)
        .context("The client needs accept rules (--accept or client.accept)")?;
    let (rules, filters) = load_rules(&accept)?;
    let rules = CompiledRuleSet::compile(&rules, Arc::clone(&vars))
        .with_context(|| format!("Failed to compile accept rules {}", accept.display()))?;

    let relay = section.relay.with_broker_server_url(server_url.clone());
    let mut dispatcher = Dispatcher::new(Arc::new(rules), vars, relay, token.clone())
        .context("Invalid relay configuration")?
        .with_plugins(PluginRegistry::new());
    let mut tunnel_config = TunnelClientConfig::new(tunnel_url.clone(), token.clone()).with_role(role);
    if let Some(connection_type) = connection_type {
        dispatcher = dispatcher.with_connection_type(connection_type.clone());
        tunnel_config = tunnel_config.with_connection_type(connection_type);
    }
    tunnel_config
        .validate()
        .map_err(|e| anyhow::anyhow!(e))
        .context("Invalid tunnel configuration")?;
    dispatcher.startup().await.context("Plugin startup failed")?;

    info!(
        token = %mask_token(&token),
        server = %server_url,
        tunnel = %tunnel_url,
        role = %role,
        "Starting broker client"
    );

    let agent = TunnelAgent::new(tunnel_config, Arc::new(dispatcher)).with_filters(filters);
    let running = agent.clone();
    let mut task = tokio::spawn(async move { running.run().await });

    tokio::select! {
        result = &mut task => {
            return result.context("tunnel agent panicked")?.context("tunnel agent failed");
        }
        () = shutdown_signal() => {
            agent.disconnect();
        }
    }

    task.await
        .context("tunnel agent panicked")?
        .context("tunnel agent failed")
}
