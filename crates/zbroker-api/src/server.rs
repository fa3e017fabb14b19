//! Server runtime
//!
//! Runs the public HTTP listener, the tunnel listener and the stream
//! sweeper side by side until shutdown.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use zbroker_filter::CompiledRuleSet;
use zbroker_relay::Forwarder;
use zbroker_tunnel::{ConnectionRegistry, ControlHandler, StreamingTable};

use crate::config::ServerConfig;
use crate::router::build_router;
use crate::state::BrokerState;

/// Broker server
pub struct ApiServer {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    streams: Arc<StreamingTable>,
    forwarder: Arc<Forwarder>,
}

impl ApiServer {
    /// Create a new server filtering public requests with `rules`
    #[must_use]
    pub fn new(config: ServerConfig, rules: Arc<CompiledRuleSet>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let streams = Arc::new(StreamingTable::new(config.tunnel.cache_expiry));
        let forwarder = Arc::new(Forwarder::new(
            Arc::clone(&registry),
            Arc::clone(&streams),
            rules,
            config.relay.clone(),
        ));
        Self {
            config,
            registry,
            streams,
            forwarder,
        }
    }

    /// Get the HTTP bind address
    #[must_use]
    pub fn bind_addr(&self) -> SocketAddr {
        self.config.api.bind
    }

    /// Get the tunnel bind address
    #[must_use]
    pub fn tunnel_addr(&self) -> SocketAddr {
        self.config.tunnel.bind
    }

    /// Live connection registry
    #[must_use]
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// State handed to the HTTP handlers
    #[must_use]
    pub fn state(&self) -> BrokerState {
        BrokerState::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.streams),
            Arc::clone(&self.forwarder),
        )
    }

    /// Run the server
    ///
    /// # Errors
    ///
    /// Returns an error if a listener cannot be bound or fails.
    pub async fn run(self) -> anyhow::Result<()> {
        self.run_with_shutdown(std::future::pending()).await
    }

    /// Run the server with graceful shutdown
    ///
    /// # Errors
    ///
    /// Returns an error if a listener cannot be bound or fails.
    pub async fn run_with_shutdown(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let http = TcpListener::bind(self.config.api.bind)
            .await
            .with_context(|| format!("failed to bind HTTP listener on {}", self.config.api.bind))?;
        let tunnel = TcpListener::bind(self.config.tunnel.bind)
            .await
            .with_context(|| {
                format!("failed to bind tunnel listener on {}", self.config.tunnel.bind)
            })?;
        self.serve(http, tunnel, shutdown).await
    }

    /// Serve on already bound listeners
    ///
    /// # Errors
    ///
    /// Returns an error if either listener fails.
    pub async fn serve(
        self,
        http: TcpListener,
        tunnel: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let router = build_router(&self.config.api, self.state());
        let (stop_tx, stop_rx) = watch::channel(false);

        let sweeper = self
            .streams
            .spawn_sweeper(self.config.tunnel.cache_check_period);
        let control = Arc::new(ControlHandler::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.streams),
            self.config.tunnel.clone(),
        ));
        let tunnel_task = tokio::spawn(control.serve(tunnel, stop_rx));

        info!(
            bind = %http.local_addr()?,
            tunnel = %self.config.tunnel.bind,
            stream_ttl = ?self.config.tunnel.cache_expiry,
            "Starting broker server"
        );

        axum::serve(http, router)
            .with_graceful_shutdown(async move {
                shutdown.await;
                let _ = stop_tx.send(true);
            })
            .await
            .context("HTTP listener failed")?;

        tunnel_task.await.context("tunnel listener panicked")??;
        sweeper.abort();

        info!("Broker server shut down");
        Ok(())
    }
}
