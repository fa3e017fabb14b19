//! `ZBroker` API - the public face of the broker server
//!
//! Provides:
//! - `/broker/{token}/...` relay into the tunnel
//! - `/response-data/{token}/{streaming_id}` streamed response uploads
//! - Connection status and summaries
//! - Health check and Prometheus metrics
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use zbroker_api::{ApiServer, ServerConfig};
//! use zbroker_filter::{CompiledRuleSet, RuleSet, Variables};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let vars = Arc::new(Variables::from_env());
//!     let rules = RuleSet::from_file("accept.json")?;
//!     let rules = Arc::new(CompiledRuleSet::compile(&rules, vars)?);
//!     ApiServer::new(ServerConfig::default(), rules).run().await
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod handlers;
pub mod router;
pub mod server;
pub mod state;

pub use config::{ApiConfig, ServerConfig};
pub use error::{ApiError, ErrorResponse, Result};
pub use router::build_router;
pub use server::ApiServer;
pub use state::BrokerState;
