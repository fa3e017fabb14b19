//! `ZBroker` Filter - accept rules for both legs of the broker
//!
//! Every request that crosses the tunnel is checked twice, once on each side,
//! against an ordered allow-list of rules. A rule names a method, a path
//! template, the origin the request is resolved against and optional
//! constraints on the body, query string and headers.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use zbroker_filter::{FilterRequest, Rule, RuleEngine, Variables};
//!
//! let rules = vec![Rule::new("GET", "/repos/:owner/:repo").with_origin("https://${API_HOST}")];
//! let vars = Arc::new(Variables::new().with("API_HOST", "api.example.com"));
//! let engine = RuleEngine::new(&rules, vars).unwrap();
//!
//! let headers = http::HeaderMap::new();
//! let result = engine
//!     .evaluate(&FilterRequest::new("GET", "/repos/foo/bar", &headers))
//!     .unwrap();
//! assert_eq!(result.url, "https://api.example.com/repos/foo/bar");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod engine;
pub mod error;
pub mod matcher;
pub mod path;
pub mod rule;
pub mod vars;

pub use engine::{
    normalize, CompiledRuleSet, FilterRequest, FilterResult, RuleEngine, BLOCKED_HTTP_REASON,
    BLOCKED_TUNNEL_REASON,
};
pub use error::{FilterError, Result};
pub use path::{PathKey, PathPattern};
pub use rule::{AuthScheme, AuthSpec, Rule, RuleSet, ValidEntry};
pub use vars::Variables;
