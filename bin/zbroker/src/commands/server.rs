//! `zbroker server`

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use zbroker_api::ApiServer;
use zbroker_filter::CompiledRuleSet;

use super::shutdown_signal;
use crate::config::{load_rules, FileConfig};

pub(crate) struct ServerArgs {
    pub(crate) bind: Option<SocketAddr>,
    pub(crate) tunnel_bind: Option<SocketAddr>,
    pub(crate) accept: Option<PathBuf>,
}

pub(crate) async fn serve(args: ServerArgs, file: FileConfig) -> Result<()> {
    let vars = Arc::new(file.variables());
    let mut config = file.server.config;
    if let Some(bind) = args.bind {
        config.api.bind = bind;
    }
    if let Some(bind) = args.tunnel_bind {
        config.tunnel.bind = bind;
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!(e))
        .context("Invalid server configuration")?;

    let accept = args
        .accept
        .or(file.server.accept)
        .context("The server needs accept rules (--accept or server.accept)")?;
    let (rules, _) = load_rules(&accept)?;
    let rules = CompiledRuleSet::compile(&rules, vars)
        .with_context(|| format!("Failed to compile accept rules {}", accept.display()))?;

    info!(
        accept = %accept.display(),
        bind = %config.api.bind,
        tunnel = %config.tunnel.bind,
        "Loaded server configuration"
    );

    ApiServer::new(config, Arc::new(rules))
        .run_with_shutdown(shutdown_signal())
        .await
}
