//! Declarative accept-rule data model
//!
//! Rules are loaded from JSON. A rule file is either a flat array of rules or
//! an object mapping a connection type (`github`, `gitlab`, ...) to its own
//! array of rules:
//!
//! ```json
//! [
//!   { "method": "GET", "path": "/repos/:owner/:repo", "origin": "https://${GITHUB_API}" }
//! ]
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{FilterError, Result};

fn default_method() -> String {
    "get".to_string()
}

// =============================================================================
// Rule
// =============================================================================

/// A single allow-list entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// HTTP method, case-insensitive; `any` matches every method
    #[serde(default = "default_method")]
    pub method: String,

    /// Path template (`/repos/:owner/:repo`, `/files/*`, `/${ORG}/list`)
    #[serde(default)]
    pub path: Option<String>,

    /// Origin template prepended to the matched path (`https://${API_HOST}`)
    #[serde(default)]
    pub origin: Option<String>,

    /// Body, query and header constraints
    #[serde(default)]
    pub valid: Vec<ValidEntry>,

    /// Authorization to attach to the outbound call
    #[serde(default)]
    pub auth: Option<AuthSpec>,

    /// Hint that responses for this rule should be streamed
    #[serde(default)]
    pub stream: bool,

    /// Capabilities the peer must advertise for this rule to apply
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_capabilities: Vec<String>,
}

impl Rule {
    /// Create a rule for `method` on `path` with no origin or constraints
    #[must_use]
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: Some(path.into()),
            origin: None,
            valid: Vec::new(),
            auth: None,
            stream: false,
            required_capabilities: Vec::new(),
        }
    }

    /// Set the origin template
    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Add a validity constraint
    #[must_use]
    pub fn with_valid(mut self, entry: ValidEntry) -> Self {
        self.valid.push(entry);
        self
    }

    /// Set the auth block
    #[must_use]
    pub fn with_auth(mut self, auth: AuthSpec) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Mark the rule as a streaming rule
    #[must_use]
    pub fn streamed(mut self) -> Self {
        self.stream = true;
        self
    }
}

// =============================================================================
// Validity constraints
// =============================================================================

/// One entry of a rule's `valid` list
///
/// The populated fields decide which constraint class the entry belongs to:
/// `path` alone is an exact body match, `path` + `regex` a body regex,
/// `queryParam` + `values` a query glob list and `header` + `values` a header
/// allow-list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidEntry {
    /// Dotted JSON path into the request body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Expected value at `path`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,

    /// Regular expression the value at `path` must match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,

    /// Query parameter name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_param: Option<String>,

    /// Header name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,

    /// Allowed values (globs for query params, exact strings for headers)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl ValidEntry {
    /// Body constraint: value at `path` must equal `value`
    #[must_use]
    pub fn body(path: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            path: Some(path.into()),
            value: Some(value.into()),
            ..Self::default()
        }
    }

    /// Body constraint: value at `path` must match `regex`
    #[must_use]
    pub fn body_regex(path: impl Into<String>, regex: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            regex: Some(regex.into()),
            ..Self::default()
        }
    }

    /// Query constraint: `param` must match one of `values`
    #[must_use]
    pub fn query<I, S>(param: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            query_param: Some(param.into()),
            values: values.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Header constraint: `name` must be present with one of `values`
    #[must_use]
    pub fn header<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            header: Some(name.into()),
            values: values.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

// =============================================================================
// Auth
// =============================================================================

/// Authorization scheme of a rule's auth block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthScheme {
    /// `Token <value>`
    Token,
    /// `Bearer <value>`
    Bearer,
    /// `Basic <base64(user:pass)>` or `Basic <base64(token)>`
    Basic,
    /// The value verbatim
    Raw,
}

/// Auth block of a rule; every field is a template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSpec {
    /// Header scheme
    pub scheme: AuthScheme,
    /// Basic-auth username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Basic-auth password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Token value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl AuthSpec {
    /// Auth block carrying a single token template
    #[must_use]
    pub fn token(scheme: AuthScheme, token: impl Into<String>) -> Self {
        Self {
            scheme,
            username: None,
            password: None,
            token: Some(token.into()),
        }
    }

    /// Basic auth from username and password templates
    #[must_use]
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            scheme: AuthScheme::Basic,
            username: Some(username.into()),
            password: Some(password.into()),
            token: None,
        }
    }
}

// =============================================================================
// RuleSet
// =============================================================================

/// Rules as loaded from a rule source
///
/// A flat list applies to every connection; a per-type map is resolved by the
/// connection type of the tunnel endpoint handling the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleSet {
    /// One ordered list for all connections
    Flat(Vec<Rule>),
    /// Ordered lists keyed by connection type
    PerType(BTreeMap<String, Vec<Rule>>),
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::Flat(Vec::new())
    }
}

impl RuleSet {
    /// Parse a rule source from JSON text
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not JSON, or is neither an array of
    /// rules nor an object of arrays of rules.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        match value {
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                Ok(serde_json::from_value(value)?)
            }
            other => Err(FilterError::source(format!(
                "expected an array of rules or a map of rule arrays, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Load a rule source from a JSON file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }

    /// Total number of rules across all types
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Flat(rules) => rules.len(),
            Self::PerType(map) => map.values().map(Vec::len).sum(),
        }
    }

    /// Whether the set holds no rules at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}
