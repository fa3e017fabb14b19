//! Rule compilation and request evaluation
//!
//! A [`RuleEngine`] holds an ordered list of compiled rules. Evaluation walks
//! the list and returns the resolution of the first rule that accepts the
//! request; anything that cannot be evaluated is treated as blocked.

use std::cell::OnceCell;
use std::collections::HashMap;
use std::sync::Arc;

use http::HeaderMap;
use regex::Regex;
use serde_json::Value;

use crate::matcher::{self, QueryPattern};
use crate::path::PathPattern;
use crate::rule::{AuthSpec, Rule, RuleSet};
use crate::vars::Variables;
use crate::{FilterError, Result};

/// Reason attached to requests blocked on the public leg
pub const BLOCKED_HTTP_REASON: &str =
    "Request does not match any accept rule, blocking HTTP request";

/// Reason attached to requests blocked on the private leg
pub const BLOCKED_TUNNEL_REASON: &str =
    "Response does not match any accept rule, blocking websocket request";

/// A request as seen by the filter
#[derive(Debug, Clone, Copy)]
pub struct FilterRequest<'a> {
    /// HTTP method, any case
    pub method: &'a str,
    /// Path plus optional query and fragment (`/repos/a/b?ref=main`)
    pub url: &'a str,
    /// Request headers
    pub headers: &'a HeaderMap,
    /// Raw request body
    pub body: Option<&'a [u8]>,
    /// Capabilities advertised by the tunnel peer
    pub capabilities: &'a [String],
}

impl<'a> FilterRequest<'a> {
    /// Create a request with no body and no capabilities
    #[must_use]
    pub fn new(method: &'a str, url: &'a str, headers: &'a HeaderMap) -> Self {
        Self {
            method,
            url,
            headers,
            body: None,
            capabilities: &[],
        }
    }

    /// Attach a body
    #[must_use]
    pub fn with_body(mut self, body: &'a [u8]) -> Self {
        self.body = Some(body);
        self
    }

    /// Attach the peer's capabilities
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: &'a [String]) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// The resolved target of an accepted request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterResult {
    /// Absolute URL: resolved origin, rewritten path, original query
    pub url: String,
    /// Rendered `authorization` header value, when the rule declares auth
    pub auth: Option<String>,
    /// Whether the rule asks for a streamed response
    pub stream: bool,
}

enum Outcome {
    Skip,
    Accept(FilterResult),
    Halt,
}

struct CompiledRule {
    index: usize,
    method: String,
    path: PathPattern,
    origin: String,
    body_exact: Vec<(String, Value)>,
    body_regex: Vec<(String, Option<Regex>)>,
    query: Vec<(String, Vec<QueryPattern>)>,
    headers: Vec<(String, Vec<String>)>,
    auth: Option<AuthSpec>,
    stream: bool,
    required_capabilities: Vec<String>,
}

impl CompiledRule {
    fn compile(index: usize, rule: &Rule) -> Result<Self> {
        let path = PathPattern::compile(rule.path.as_deref().unwrap_or_default())
            .map_err(|e| FilterError::rule(index, e))?;

        let mut body_exact = Vec::new();
        let mut body_regex = Vec::new();
        let mut query = Vec::new();
        let mut headers = Vec::new();

        for entry in &rule.valid {
            match (&entry.path, &entry.regex, &entry.query_param, &entry.header) {
                (Some(p), Some(re), _, _) => {
                    let compiled = Regex::new(re)
                        .inspect_err(|e| {
                            tracing::error!(rule = index, path = %p, regex = %re, error = %e, "failed to compile body regex");
                        })
                        .ok();
                    body_regex.push((p.clone(), compiled));
                }
                (Some(p), None, _, _) => {
                    body_exact.push((p.clone(), entry.value.clone().unwrap_or(Value::Null)));
                }
                (None, _, Some(param), _) => {
                    let patterns = entry.values.iter().map(|v| QueryPattern::compile(v)).collect();
                    query.push((param.clone(), patterns));
                }
                (None, _, None, Some(name)) => headers.push((name.clone(), entry.values.clone())),
                (None, _, None, None) => {
                    return Err(FilterError::rule(
                        index,
                        "validity entry needs one of path, queryParam or header",
                    ));
                }
            }
        }

        tracing::debug!(rule = index, method = %rule.method, path = path.template(), "compiled accept rule");

        Ok(Self {
            index,
            method: rule.method.to_ascii_lowercase(),
            path,
            origin: rule.origin.clone().unwrap_or_default(),
            body_exact,
            body_regex,
            query,
            headers,
            auth: rule.auth.clone(),
            stream: rule.stream,
            required_capabilities: rule.required_capabilities.clone(),
        })
    }

    fn test(&self, req: &FilterRequest<'_>, vars: &Variables) -> Outcome {
        if self.method != "any" && !req.method.eq_ignore_ascii_case(&self.method) {
            return Outcome::Skip;
        }

        // Fragment content never takes part in matching
        let main = req.url.split('#').next().unwrap_or_default();
        if normalize(main) != main {
            return Outcome::Skip;
        }

        let (path, querystring) = main.split_once('?').unwrap_or((main, ""));

        let Some(captures) = self.path.captures(path) else {
            return Outcome::Skip;
        };

        let mut url = path.to_string();
        for (key, captured) in self.path.keys().iter().zip(captures) {
            if !key.from_config {
                continue;
            }
            if let (Some(captured), Some(value)) = (captured, vars.get(&key.name)) {
                if !value.is_empty() && !captured.is_empty() {
                    url = url.replacen(captured, value, 1);
                }
            }
        }

        if !self.validity_satisfied(req, querystring) {
            return Outcome::Skip;
        }

        if !self
            .headers
            .iter()
            .all(|(name, allowed)| matcher::header_allowed(req.headers, name, allowed))
        {
            return Outcome::Skip;
        }

        if let Some(missing) = self
            .required_capabilities
            .iter()
            .find(|cap| !req.capabilities.contains(cap))
        {
            tracing::warn!(rule = self.index, capability = %missing, "matched rule requires a capability the peer lacks");
            return Outcome::Halt;
        }

        let origin = vars.substitute(&self.origin);
        tracing::debug!(rule = self.index, path = self.path.template(), origin = %self.origin, "rule matched");

        let querystring = if querystring.is_empty() {
            String::new()
        } else {
            format!("?{querystring}")
        };

        Outcome::Accept(FilterResult {
            url: format!("{origin}{url}{querystring}"),
            auth: self.auth.as_ref().map(|a| a.header_value(vars)),
            stream: self.stream,
        })
    }

    /// At least one present body/query class must validate
    fn validity_satisfied(&self, req: &FilterRequest<'_>, querystring: &str) -> bool {
        if self.body_exact.is_empty() && self.body_regex.is_empty() && self.query.is_empty() {
            return true;
        }

        let body = OnceCell::new();
        let parsed = || body.get_or_init(|| matcher::parse_body(req.body));

        if self
            .body_exact
            .iter()
            .any(|(path, expected)| matcher::body_equals(parsed(), path, expected))
        {
            return true;
        }

        if self.body_regex.iter().any(|(path, re)| {
            re.as_ref()
                .is_some_and(|re| matcher::body_matches(parsed(), path, re))
        }) {
            return true;
        }

        !self.query.is_empty()
            && self.query.iter().all(|(param, patterns)| {
                let value = matcher::query_value(querystring, param);
                patterns.iter().any(|p| p.matches(&value))
            })
    }
}

/// Normalize a path the way POSIX path normalization does
///
/// Collapses repeated slashes, drops `.` segments and resolves `..`, keeping a
/// trailing slash. A path is accepted only if it is already normalized.
#[must_use]
pub fn normalize(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }

    let absolute = path.starts_with('/');
    let trailing = path.ends_with('/');
    let mut segments: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.last().is_some_and(|s| *s != "..") {
                    segments.pop();
                } else if !absolute {
                    segments.push("..");
                }
            }
            s => segments.push(s),
        }
    }

    let mut out = segments.join("/");
    if out.is_empty() && !absolute {
        out.push('.');
    }
    if trailing && !out.is_empty() {
        out.push('/');
    }
    if absolute {
        out.insert(0, '/');
    }
    out
}

// =============================================================================
// RuleEngine
// =============================================================================

/// An ordered, compiled list of accept rules
pub struct RuleEngine {
    rules: Vec<CompiledRule>,
    vars: Arc<Variables>,
}

impl std::fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleEngine")
            .field("rules", &self.rules.len())
            .field("variables", &self.vars.len())
            .finish()
    }
}

impl RuleEngine {
    /// Compile `rules` against the substitution source `vars`
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Rule`] for the first rule whose path template or
    /// validity block cannot be compiled.
    pub fn new(rules: &[Rule], vars: Arc<Variables>) -> Result<Self> {
        let rules = rules
            .iter()
            .enumerate()
            .map(|(i, rule)| CompiledRule::compile(i, rule))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(rules = rules.len(), "loaded accept rules");
        Ok(Self { rules, vars })
    }

    /// Number of compiled rules
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the engine has no rules (and so blocks everything)
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The substitution source used for origins and auth
    #[must_use]
    pub fn variables(&self) -> &Arc<Variables> {
        &self.vars
    }

    /// Evaluate `req`; `None` means blocked
    #[must_use]
    pub fn evaluate(&self, req: &FilterRequest<'_>) -> Option<FilterResult> {
        tracing::debug!(rules = self.rules.len(), "looking for a rule match");

        for rule in &self.rules {
            match rule.test(req, &self.vars) {
                Outcome::Skip => {}
                Outcome::Accept(result) => return Some(result),
                Outcome::Halt => return None,
            }
        }
        None
    }
}

// =============================================================================
// CompiledRuleSet
// =============================================================================

/// A [`RuleSet`] compiled once at load time
#[derive(Debug)]
pub enum CompiledRuleSet {
    /// One engine for every connection
    Flat(RuleEngine),
    /// One engine per connection type
    PerType(HashMap<String, RuleEngine>),
}

impl CompiledRuleSet {
    /// Compile every list in `set`
    ///
    /// # Errors
    ///
    /// Returns the first compilation error.
    pub fn compile(set: &RuleSet, vars: Arc<Variables>) -> Result<Self> {
        match set {
            RuleSet::Flat(rules) => Ok(Self::Flat(RuleEngine::new(rules, vars)?)),
            RuleSet::PerType(map) => {
                let mut engines = HashMap::with_capacity(map.len());
                for (connection_type, rules) in map {
                    tracing::info!(connection_type = %connection_type, rules = rules.len(), "loading ruleset");
                    engines.insert(connection_type.clone(), RuleEngine::new(rules, Arc::clone(&vars))?);
                }
                Ok(Self::PerType(engines))
            }
        }
    }

    /// Engine to use for a connection of `connection_type`
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::UnknownType`] for a per-type set when the type is
    /// missing or has no rules.
    pub fn engine(&self, connection_type: Option<&str>) -> Result<&RuleEngine> {
        match self {
            Self::Flat(engine) => Ok(engine),
            Self::PerType(map) => {
                let connection_type = connection_type.unwrap_or_default();
                map.get(connection_type).ok_or_else(|| FilterError::UnknownType {
                    connection_type: connection_type.to_string(),
                })
            }
        }
    }

    /// Evaluate `req` against the engine for `connection_type`, blocking on unknown types
    #[must_use]
    pub fn evaluate(
        &self,
        connection_type: Option<&str>,
        req: &FilterRequest<'_>,
    ) -> Option<FilterResult> {
        match self.engine(connection_type) {
            Ok(engine) => engine.evaluate(req),
            Err(e) => {
                tracing::warn!(error = %e, "no ruleset for request; blocking");
                None
            }
        }
    }
}
