//! `${NAME}` substitution inside outbound bodies and headers
//!
//! Requests opt in: a JSON body lists dotted paths in a top-level
//! `BROKER_VAR_SUB` array, and headers are named in a comma-separated
//! `x-broker-var-sub` header.

use bytes::Bytes;
use http::{HeaderMap, HeaderValue};
use serde_json::Value;
use zbroker_filter::Variables;

/// Body field listing the paths to substitute
pub const BODY_VAR_SUB_KEY: &str = "BROKER_VAR_SUB";

/// Header listing the header names to substitute
pub const HEADER_VAR_SUB: &str = "x-broker-var-sub";

/// Substitute variables at the paths a JSON body names in `BROKER_VAR_SUB`
///
/// Returns the re-encoded body with the marker removed, or `None` when the
/// body is not JSON or carries no marker.
#[must_use]
pub fn substitute_body(body: &[u8], vars: &Variables) -> Option<Bytes> {
    let mut parsed: Value = serde_json::from_slice(body).ok()?;
    let paths: Vec<String> = parsed
        .get(BODY_VAR_SUB_KEY)?
        .as_array()?
        .iter()
        .filter_map(|p| p.as_str().map(str::to_string))
        .collect();

    for path in &paths {
        match lookup_mut(&mut parsed, path) {
            Some(Value::String(source)) => *source = vars.substitute(source),
            Some(_) => tracing::debug!(path = %path, "var-sub path is not a string"),
            None => tracing::debug!(path = %path, "var-sub path not found"),
        }
    }

    if let Value::Object(map) = &mut parsed {
        map.remove(BODY_VAR_SUB_KEY);
    }
    tracing::debug!(paths = ?paths, "substituted body variables");

    serde_json::to_vec(&parsed).ok().map(Bytes::from)
}

/// Substitute variables in the headers named by `x-broker-var-sub`
///
/// Returns how many header values were rewritten.
pub fn substitute_headers(headers: &mut HeaderMap, vars: &Variables) -> usize {
    let Some(names) = headers
        .get(HEADER_VAR_SUB)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        return 0;
    };

    let mut rewritten = 0;
    for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        let name = name.to_ascii_lowercase();
        let Some(source) = headers.get(&name).and_then(|v| v.to_str().ok()) else {
            continue;
        };
        match HeaderValue::from_str(&vars.substitute(source)) {
            Ok(value) => {
                if let Ok(header) = http::HeaderName::from_bytes(name.as_bytes()) {
                    headers.insert(header, value);
                    rewritten += 1;
                }
            }
            Err(_) => tracing::warn!(header = %name, "substituted header value is invalid"),
        }
    }
    rewritten
}

fn lookup_mut<'v>(root: &'v mut Value, path: &str) -> Option<&'v mut Value> {
    path.split('.').try_fold(root, |node, segment| match node {
        Value::Object(map) => map.get_mut(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
        _ => None,
    })
}
