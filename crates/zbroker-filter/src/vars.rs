//! `${NAME}` template substitution with round-robin credential pools
//!
//! A placeholder `${NAME}` resolves to the variable `NAME`. When a pool
//! variable `NAME_POOL` (or `NAMEPool`) holds a comma-separated list, each
//! substitution hands out the next element instead, wrapping around at the end.

use std::collections::HashMap;

use parking_lot::Mutex;

/// Substitution source for origin, path, auth and body templates
///
/// Values are immutable after construction; only the pool cursors advance.
#[derive(Debug, Default)]
pub struct Variables {
    values: HashMap<String, String>,
    /// Next pool index keyed by the pool's index name (`NAME_POOL_IDX`)
    cursors: Mutex<HashMap<String, usize>>,
}

impl Clone for Variables {
    fn clone(&self) -> Self {
        Self {
            values: self.values.clone(),
            cursors: Mutex::new(self.cursors.lock().clone()),
        }
    }
}

impl Variables {
    /// Create an empty variable source
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a variable source from the process environment
    #[must_use]
    pub fn from_env() -> Self {
        std::env::vars().collect()
    }

    /// Set a variable (builder pattern)
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Overlay `other` on top of these variables
    #[must_use]
    pub fn merged(mut self, other: impl IntoIterator<Item = (String, String)>) -> Self {
        self.values.extend(other);
        self
    }

    /// Look up a raw variable
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Whether a variable is set to a truthy value (anything but empty, `0` or `false`)
    #[must_use]
    pub fn is_set(&self, key: &str) -> bool {
        self.get(key)
            .is_some_and(|v| !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false"))
    }

    /// Number of variables
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no variables are defined
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Replace every `${NAME}` in `input`
    ///
    /// Unknown names resolve to the empty string.
    #[must_use]
    pub fn substitute(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        while let Some((before, key, after)) = split_placeholder(rest) {
            out.push_str(before);
            out.push_str(&self.resolve(key));
            rest = after;
        }
        out.push_str(rest);
        out
    }

    /// Resolve a single placeholder name, advancing its pool if it has one
    #[must_use]
    pub fn resolve(&self, key: &str) -> String {
        let pooled = [
            (format!("{key}_POOL"), format!("{key}_POOL_IDX")),
            (format!("{key}Pool"), format!("{key}PoolIdx")),
        ]
        .into_iter()
        .find_map(|(pool, idx)| {
            self.values
                .get(&pool)
                .filter(|p| !p.is_empty())
                .map(|p| (p, idx))
        });

        let Some((pool, idx_key)) = pooled else {
            return self.values.get(key).cloned().unwrap_or_default();
        };

        let members: Vec<&str> = pool.split(',').map(str::trim).collect();
        let mut cursors = self.cursors.lock();
        let cursor = cursors.entry(idx_key).or_insert(0);
        if *cursor >= members.len() {
            *cursor = 0;
        }
        let picked = members[*cursor].to_string();
        *cursor += 1;
        picked
    }

    /// Names of all placeholders in `input`, in order of appearance
    #[must_use]
    pub fn placeholders(input: &str) -> Vec<String> {
        let mut names = Vec::new();
        let mut rest = input;
        while let Some((_, key, after)) = split_placeholder(rest) {
            names.push(key.to_string());
            rest = after;
        }
        names
    }
}

/// Split `input` around its first `${...}`: text before, the name, text after
fn split_placeholder(input: &str) -> Option<(&str, &str, &str)> {
    let start = input.find("${")?;
    let end = input[start + 2..].find('}')? + start + 2;
    Some((&input[..start], &input[start + 2..end], &input[end + 1..]))
}

impl FromIterator<(String, String)> for Variables {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().collect(),
            cursors: Mutex::new(HashMap::new()),
        }
    }
}
