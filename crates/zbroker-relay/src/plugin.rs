//! Client-side plugins that adjust outbound requests
//!
//! Plugins are registered explicitly at startup. A plugin applies to the
//! connection types it names and can be switched off with a
//! `DISABLE_<CODE>_PLUGIN` variable.

use std::sync::Arc;

use async_trait::async_trait;
use zbroker_filter::Variables;

use crate::prepare::PreparedRequest;
use crate::Result;

/// A hook into request preparation on the client leg
#[async_trait]
pub trait BrokerPlugin: Send + Sync {
    /// Short unique code (`GHSA`)
    fn code(&self) -> &str;

    /// Human readable name
    fn name(&self) -> &str;

    /// Connection types this plugin applies to
    fn applicable_types(&self) -> &[String];

    /// Whether the plugin should run with these variables
    fn is_active(&self, vars: &Variables) -> bool {
        !vars.is_set(&disable_key(self.code()))
    }

    /// One-time initialisation for a connection
    async fn startup(&self, vars: &Variables) -> Result<()>;

    /// Adjust a prepared request before it is sent
    async fn pre_request(&self, vars: &Variables, request: &mut PreparedRequest) -> Result<()>;
}

/// Variable that disables the plugin with `code`
#[must_use]
pub fn disable_key(code: &str) -> String {
    format!("DISABLE_{}_PLUGIN", code.to_ascii_uppercase())
}

/// Plugins known to this process
#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn BrokerPlugin>>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.plugins.iter().map(|p| p.code()))
            .finish()
    }
}

impl PluginRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plugin
    #[must_use]
    pub fn with_plugin(mut self, plugin: Arc<dyn BrokerPlugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Number of registered plugins
    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Whether no plugins are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Active plugins for a connection type, in registration order
    #[must_use]
    pub fn active_for(&self, connection_type: &str, vars: &Variables) -> Vec<Arc<dyn BrokerPlugin>> {
        self.plugins
            .iter()
            .filter(|p| p.applicable_types().iter().any(|t| t == connection_type))
            .filter(|p| {
                let active = p.is_active(vars);
                if !active {
                    tracing::debug!(plugin = p.code(), "plugin disabled");
                }
                active
            })
            .cloned()
            .collect()
    }

    /// Run `startup` for every active plugin of a connection type
    ///
    /// # Errors
    ///
    /// Returns the first plugin failure.
    pub async fn startup(&self, connection_type: &str, vars: &Variables) -> Result<()> {
        for plugin in self.active_for(connection_type, vars) {
            tracing::info!(plugin = plugin.code(), name = plugin.name(), connection_type, "starting plugin");
            plugin.startup(vars).await?;
        }
        Ok(())
    }

    /// Run `pre_request` for every active plugin of a connection type
    ///
    /// # Errors
    ///
    /// Returns the first plugin failure.
    pub async fn pre_request(
        &self,
        connection_type: &str,
        vars: &Variables,
        request: &mut PreparedRequest,
    ) -> Result<()> {
        for plugin in self.active_for(connection_type, vars) {
            plugin.pre_request(vars, request).await?;
        }
        Ok(())
    }
}
