//! Turning an accepted request descriptor into an outbound HTTP request

use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use http::{HeaderMap, HeaderValue, Method};
use serde_json::Value;
use url::Url;
use zbroker_filter::{FilterResult, Variables};
use zbroker_tunnel::mask_token;

use crate::context::CorrelationContext;
use crate::varsub::{substitute_body, substitute_headers};
use crate::{RelayConfig, RelayError, Result};

/// User agent set when the caller sent none
pub const DEFAULT_USER_AGENT: &str = concat!("zbroker/", env!("CARGO_PKG_VERSION"));

/// Header asking for the JSON body to be re-encoded
pub const BROKER_CONTENT_TYPE_HEADER: &str = "x-broker-content-type";

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Headers that corrupt an outbound call when relayed verbatim
const HOP_HEADERS: [&str; 8] = [
    "x-forwarded-for",
    "x-forwarded-proto",
    "x-forwarded-host",
    "x-forwarded-port",
    "content-length",
    "host",
    "accept-encoding",
    "content-encoding",
];

/// An outbound request ready to send
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    /// HTTP method
    pub method: Method,
    /// Absolute target URL
    pub url: Url,
    /// Headers to send
    pub headers: HeaderMap,
    /// Body to send
    pub body: Bytes,
}

/// Applies auth precedence, header hygiene and variable substitution
#[derive(Debug, Clone, Copy)]
pub struct RequestPreparer<'a> {
    config: &'a RelayConfig,
    vars: &'a Variables,
    server_token: Option<&'a str>,
}

impl<'a> RequestPreparer<'a> {
    /// Create a preparer for the client leg
    #[must_use]
    pub fn new(config: &'a RelayConfig, vars: &'a Variables) -> Self {
        Self {
            config,
            vars,
            server_token: None,
        }
    }

    /// Prepare requests on the server leg, tagging them with the broker token
    #[must_use]
    pub fn server_facing(mut self, token: &'a str) -> Self {
        self.server_token = Some(token);
        self
    }

    /// Build the outbound request for an accepted descriptor
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidRequest`] if the method, resolved URL or
    /// auth header is invalid.
    pub fn prepare(
        &self,
        result: &FilterResult,
        method: &str,
        mut headers: HeaderMap,
        mut body: Bytes,
    ) -> Result<PreparedRequest> {
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|e| RelayError::invalid_request(format!("invalid method {method}: {e}")))?;

        let mut url = parse_target(&result.url)?;

        if !headers.contains_key(USER_AGENT) {
            headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
        }

        apply_auth(result.auth.as_deref(), &mut url, &mut headers)?;

        if !self.config.disable_body_vars_substitution && !body.is_empty() {
            if let Some(substituted) = substitute_body(&body, self.vars) {
                body = substituted;
            }
        }

        if !self.config.disable_header_vars_substitution {
            substitute_headers(&mut headers, self.vars);
        }

        for name in HOP_HEADERS {
            headers.remove(name);
        }

        if self.config.remove_x_forwarded_headers {
            let forwarded: Vec<_> = headers
                .keys()
                .filter(|k| k.as_str().starts_with("x-forwarded-"))
                .cloned()
                .collect();
            for name in forwarded {
                headers.remove(name);
            }
            headers.remove("forwarded");
        }

        CorrelationContext::strip_acting_headers(&mut headers);

        if let Some(content_type) = headers.remove(BROKER_CONTENT_TYPE_HEADER) {
            if content_type == FORM_CONTENT_TYPE {
                if let Some(form) = json_to_form(&body) {
                    body = Bytes::from(form);
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static(FORM_CONTENT_TYPE));
                }
            }
        }

        if let Some(token) = self.server_token {
            if let Ok(value) = HeaderValue::from_str(token) {
                headers.insert("x-broker-token", value);
            }
            if let Ok(value) = HeaderValue::from_str(&mask_token(token)) {
                headers.insert("x-snyk-broker", value);
            }
        }

        Ok(PreparedRequest {
            method,
            url,
            headers,
            body,
        })
    }
}

/// Strip a leading `/ctx/<uuid>` context segment from a request path
#[must_use]
pub fn strip_context_prefix(url: &str) -> &str {
    const PREFIX: &str = "/ctx/";
    const UUID_LEN: usize = 36;

    let Some(rest) = url.strip_prefix(PREFIX) else {
        return url;
    };
    let Some(candidate) = rest.get(..UUID_LEN) else {
        return url;
    };
    let lowercase_hex = candidate
        .chars()
        .all(|c| c == '-' || c.is_ascii_digit() || ('a'..='f').contains(&c));
    if lowercase_hex && uuid::Uuid::try_parse(candidate).is_ok() {
        &rest[UUID_LEN..]
    } else {
        url
    }
}

fn parse_target(raw: &str) -> Result<Url> {
    let absolute = if !raw.contains("localhost") && !raw.starts_with("http") {
        format!("https://{raw}")
    } else {
        raw.to_string()
    };
    Url::parse(&absolute)
        .map_err(|e| RelayError::invalid_request(format!("invalid target url: {e}")))
}

/// Rule auth wins; otherwise URL credentials decide the authorization header
fn apply_auth(rule_auth: Option<&str>, url: &mut Url, headers: &mut HeaderMap) -> Result<()> {
    if let Some(auth) = rule_auth {
        let value = HeaderValue::from_str(auth)
            .map_err(|_| RelayError::invalid_request("rule auth is not a valid header value"))?;
        headers.insert(AUTHORIZATION, value);
        return Ok(());
    }

    if url.username().is_empty() {
        return Ok(());
    }

    if url.password().is_some() {
        // Basic credentials stay on the URL
        headers.remove(AUTHORIZATION);
        return Ok(());
    }

    let value = HeaderValue::from_str(&format!("token {}", url.username()))
        .map_err(|_| RelayError::invalid_request("url token is not a valid header value"))?;
    headers.insert(AUTHORIZATION, value);
    url.set_username("")
        .map_err(|()| RelayError::invalid_request("cannot strip token from url"))?;
    Ok(())
}

fn json_to_form(body: &[u8]) -> Option<String> {
    let Value::Object(map) = serde_json::from_slice::<Value>(body).ok()? else {
        return None;
    };
    let mut form = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in &map {
        match value {
            Value::String(s) => form.append_pair(key, s),
            other => form.append_pair(key, &other.to_string()),
        };
    }
    Some(form.finish())
}
