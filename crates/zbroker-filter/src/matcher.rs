//! Constraint matchers for the `valid` block of a rule

use globset::{GlobBuilder, GlobMatcher};
use http::HeaderMap;
use regex::Regex;
use serde_json::Value;

// =============================================================================
// Body
// =============================================================================

/// Parse a request body as JSON, treating anything unparseable as an empty object
#[must_use]
pub fn parse_body(body: Option<&[u8]>) -> Value {
    body.filter(|b| !b.is_empty())
        .and_then(|b| serde_json::from_slice::<Value>(b).ok())
        .filter(Value::is_object)
        .unwrap_or_else(|| Value::Object(serde_json::Map::new()))
}

/// Collect the values at a dotted `path`; a `*` segment fans out over every
/// element of an array or object
#[must_use]
pub fn lookup<'v>(root: &'v Value, path: &str) -> Vec<&'v Value> {
    let mut current = vec![root];
    for segment in path.split('.') {
        let mut next = Vec::new();
        for value in current {
            match (segment, value) {
                ("*", Value::Array(items)) => next.extend(items.iter()),
                ("*", Value::Object(map)) => next.extend(map.values()),
                (key, Value::Object(map)) => next.extend(map.get(key)),
                (key, Value::Array(items)) => {
                    next.extend(key.parse::<usize>().ok().and_then(|i| items.get(i)));
                }
                _ => {}
            }
        }
        if next.is_empty() {
            return next;
        }
        current = next;
    }
    current
}

/// Exact body constraint: some value at `path` equals `expected`
///
/// A string expectation also matches a scalar whose text form is equal, so
/// `"value": "42"` accepts both `42` and `"42"` in the body.
#[must_use]
pub fn body_equals(body: &Value, path: &str, expected: &Value) -> bool {
    lookup(body, path).into_iter().any(|found| {
        found == expected
            || match (expected, scalar_text(found)) {
                (Value::String(want), Some(have)) => *want == have,
                _ => false,
            }
    })
}

/// Regex body constraint: some scalar value at `path` matches `regex`
#[must_use]
pub fn body_matches(body: &Value, path: &str, regex: &Regex) -> bool {
    lookup(body, path)
        .into_iter()
        .filter_map(scalar_text)
        .any(|text| regex.is_match(&text))
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// =============================================================================
// Query
// =============================================================================

/// One allowed value of a query constraint
#[derive(Debug, Clone)]
pub enum QueryPattern {
    /// Plain value, compared for equality
    Exact(String),
    /// Glob pattern; a leading `!` negates it
    Glob {
        /// Compiled glob
        matcher: GlobMatcher,
        /// Whether the pattern was negated
        negated: bool,
    },
    /// A pattern that failed to compile; never matches
    Never,
}

impl QueryPattern {
    /// Compile an allowed value
    ///
    /// Values without `*`, `?` or `!` are exact matches.
    #[must_use]
    pub fn compile(pattern: &str) -> Self {
        if !pattern.contains(['*', '?', '!']) {
            return Self::Exact(pattern.to_string());
        }

        let (negated, glob) = match pattern.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, pattern),
        };

        match GlobBuilder::new(glob).literal_separator(true).build() {
            Ok(g) => Self::Glob {
                matcher: g.compile_matcher(),
                negated,
            },
            Err(e) => {
                tracing::error!(pattern, error = %e, "failed to compile query glob; treating as non-match");
                Self::Never
            }
        }
    }

    /// Whether `value` is allowed by this pattern
    #[must_use]
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Self::Exact(expected) => expected == value,
            Self::Glob { matcher, negated } => matcher.is_match(value) != *negated,
            Self::Never => false,
        }
    }
}

/// Value of `param` in a raw query string
///
/// Repeated parameters and `param[]` arrays yield their first value; a missing
/// parameter yields the empty string.
#[must_use]
pub fn query_value(querystring: &str, param: &str) -> String {
    let array_key = format!("{param}[]");
    url::form_urlencoded::parse(querystring.as_bytes())
        .find(|(k, _)| k == param || *k == array_key)
        .map(|(_, v)| v.into_owned())
        .unwrap_or_default()
}

// =============================================================================
// Headers
// =============================================================================

/// Header constraint: `name` is present and its value is one of `allowed`
#[must_use]
pub fn header_allowed(headers: &HeaderMap, name: &str, allowed: &[String]) -> bool {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .is_some_and(|v| allowed.iter().any(|a| a == v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_body_fallbacks() {
        assert_eq!(parse_body(None), json!({}));
        assert_eq!(parse_body(Some(b"not json")), json!({}));
        assert_eq!(parse_body(Some(b"[1,2]")), json!({}));
        assert_eq!(parse_body(Some(br#"{"a":1}"#)), json!({"a": 1}));
    }

    #[test]
    fn test_lookup_paths() {
        let body = json!({
            "commits": [{"message": "one"}, {"message": "two"}],
            "meta": {"kind": "push"}
        });

        assert_eq!(lookup(&body, "meta.kind"), vec![&json!("push")]);
        assert_eq!(lookup(&body, "commits.1.message"), vec![&json!("two")]);
        assert_eq!(lookup(&body, "commits.*.message").len(), 2);
        assert!(lookup(&body, "meta.missing").is_empty());
    }

    #[test]
    fn test_body_equals() {
        let body = json!({"action": "opened", "count": 42});
        assert!(body_equals(&body, "action", &json!("opened")));
        assert!(!body_equals(&body, "action", &json!("closed")));
        assert!(body_equals(&body, "count", &json!("42")));
        assert!(!body_equals(&body, "missing", &json!("x")));
    }

    #[test]
    fn test_body_matches() {
        let body = json!({"ref": "refs/heads/main"});
        let re = Regex::new("^refs/heads/").unwrap();
        assert!(body_matches(&body, "ref", &re));
        assert!(!body_matches(&body, "nope", &re));
    }

    #[test]
    fn test_query_patterns() {
        assert!(QueryPattern::compile("main").matches("main"));
        assert!(!QueryPattern::compile("main").matches("mainline"));

        let glob = QueryPattern::compile("release/*");
        assert!(glob.matches("release/1.0"));
        assert!(!glob.matches("release/1.0/hotfix"));

        assert!(QueryPattern::compile("*.json").matches(".hidden.json"));
        assert!(QueryPattern::compile("v?").matches("v1"));

        let negated = QueryPattern::compile("!secret*");
        assert!(negated.matches("public"));
        assert!(!negated.matches("secret-file"));
    }

    #[test]
    fn test_query_value() {
        assert_eq!(query_value("a=1&b=2", "b"), "2");
        assert_eq!(query_value("a=1&a=2", "a"), "1");
        assert_eq!(query_value("a[]=x&a[]=y", "a"), "x");
        assert_eq!(query_value("path=docs%2Freadme.md", "path"), "docs/readme.md");
        assert_eq!(query_value("a=1", "missing"), "");
    }

    #[test]
    fn test_header_allowed() {
        let mut headers = HeaderMap::new();
        headers.insert("accept", "application/json".parse().unwrap());

        let allowed = vec!["application/json".to_string()];
        assert!(header_allowed(&headers, "Accept", &allowed));
        assert!(!header_allowed(&headers, "x-missing", &allowed));
        assert!(!header_allowed(
            &headers,
            "accept",
            &["text/html".to_string()]
        ));
    }
}
