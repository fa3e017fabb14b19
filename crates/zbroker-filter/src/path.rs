//! Path template compilation
//!
//! Supports the Express-style template syntax used by accept rules:
//!
//! - `:name` matches one segment, `:name?` makes it optional,
//!   `:name*` / `:name+` match zero-or-more / one-or-more segments
//! - `:name(\d+)` and bare `(pattern)` groups use a custom pattern
//! - `*` matches anything, including `/`
//! - `${NAME}` behaves like `:NAME` but its captured segment is replaced by the
//!   configured value of `NAME` when the URL is reconstructed
//!
//! Matching is case-insensitive, anchored at both ends and tolerates one
//! trailing slash.

use regex::{Regex, RegexBuilder};

/// A parameter slot in a compiled path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathKey {
    /// Parameter name; positional groups are numbered from 0
    pub name: String,
    /// Whether the value comes from configuration (`${NAME}`)
    pub from_config: bool,
}

/// A compiled path template
#[derive(Debug, Clone)]
pub struct PathPattern {
    template: String,
    regex: Regex,
    keys: Vec<PathKey>,
}

#[derive(Debug)]
enum Token {
    Literal(String),
    Param {
        key: PathKey,
        prefix: Option<char>,
        pattern: String,
        modifier: Option<char>,
    },
}

impl PathPattern {
    /// Compile a path template
    ///
    /// A missing leading `/` is added.
    ///
    /// # Errors
    ///
    /// Returns a message if a group is unterminated, a parameter has no name,
    /// or the resulting regular expression does not compile.
    pub fn compile(template: &str) -> Result<Self, String> {
        let template = if template.starts_with('/') {
            template.to_string()
        } else {
            format!("/{template}")
        };

        let tokens = tokenize(&template)?;
        let mut source = String::from("^");
        let mut keys = Vec::new();

        for token in tokens {
            match token {
                Token::Literal(text) => source.push_str(&regex::escape(&text)),
                Token::Param {
                    key,
                    prefix,
                    pattern,
                    modifier,
                } => {
                    let prefix = prefix.map(|c| regex::escape(&c.to_string())).unwrap_or_default();
                    let repeat = matches!(modifier, Some('*' | '+'));
                    let optional = matches!(modifier, Some('?' | '*'));

                    let mut capture = format!("(?:{pattern})");
                    if repeat {
                        capture = format!("{capture}(?:{prefix}{capture})*");
                    }
                    if optional {
                        source.push_str(&format!("(?:{prefix}({capture}))?"));
                    } else {
                        source.push_str(&format!("{prefix}({capture})"));
                    }
                    keys.push(key);
                }
            }
        }

        if source.ends_with('/') && !source.ends_with("\\/") {
            source.pop();
        }
        source.push_str("/?$");

        let regex = RegexBuilder::new(&source)
            .case_insensitive(true)
            .build()
            .map_err(|e| format!("path '{template}' does not compile: {e}"))?;

        Ok(Self {
            template,
            regex,
            keys,
        })
    }

    /// The template as written (with leading slash)
    #[must_use]
    pub fn template(&self) -> &str {
        &self.template
    }

    /// Parameter slots in capture order
    #[must_use]
    pub fn keys(&self) -> &[PathKey] {
        &self.keys
    }

    /// Match `path`, returning each slot's captured text (`None` for an absent optional)
    #[must_use]
    pub fn captures<'p>(&self, path: &'p str) -> Option<Vec<Option<&'p str>>> {
        let caps = self.regex.captures(path)?;
        Some(
            (1..=self.keys.len())
                .map(|i| caps.get(i).map(|m| m.as_str()))
                .collect(),
        )
    }

    /// Whether `path` matches
    #[must_use]
    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }
}

fn tokenize(template: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = template.chars().collect();
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut positional = 0usize;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\\' if i + 1 < chars.len() => {
                literal.push(chars[i + 1]);
                i += 2;
            }
            '$' if chars.get(i + 1) == Some(&'{') => {
                let close = chars[i + 2..]
                    .iter()
                    .position(|&c| c == '}')
                    .ok_or_else(|| format!("unterminated '${{' in '{template}'"))?;
                let name: String = chars[i + 2..i + 2 + close].iter().collect();
                i += close + 3;
                push_param(
                    &mut tokens,
                    &mut literal,
                    PathKey {
                        name,
                        from_config: true,
                    },
                    None,
                    None,
                );
            }
            ':' if chars.get(i + 1).is_some_and(|c| is_name_char(*c)) => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && is_name_char(chars[end]) {
                    end += 1;
                }
                let name: String = chars[start..end].iter().collect();
                i = end;

                let pattern = if chars.get(i) == Some(&'(') {
                    let (pattern, next) = read_group(&chars, i, template)?;
                    i = next;
                    Some(pattern)
                } else {
                    None
                };
                let modifier = take_modifier(&chars, &mut i);
                push_param(
                    &mut tokens,
                    &mut literal,
                    PathKey {
                        name,
                        from_config: false,
                    },
                    pattern,
                    modifier,
                );
            }
            '(' => {
                let (pattern, next) = read_group(&chars, i, template)?;
                i = next;
                let modifier = take_modifier(&chars, &mut i);
                push_param(
                    &mut tokens,
                    &mut literal,
                    PathKey {
                        name: positional.to_string(),
                        from_config: false,
                    },
                    Some(pattern),
                    modifier,
                );
                positional += 1;
            }
            '*' => {
                i += 1;
                push_param(
                    &mut tokens,
                    &mut literal,
                    PathKey {
                        name: positional.to_string(),
                        from_config: false,
                    },
                    Some(".*".to_string()),
                    None,
                );
                positional += 1;
            }
            _ => {
                literal.push(c);
                i += 1;
            }
        }
    }

    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }
    Ok(tokens)
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn take_modifier(chars: &[char], i: &mut usize) -> Option<char> {
    match chars.get(*i) {
        Some(&m @ ('?' | '*' | '+')) => {
            *i += 1;
            Some(m)
        }
        _ => None,
    }
}

/// Read a balanced `( ... )` group starting at `open`; returns its contents and the index after `)`
fn read_group(chars: &[char], open: usize, template: &str) -> Result<(String, usize), String> {
    let mut depth = 0usize;
    let mut i = open;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 1,
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    let inner: String = chars[open + 1..i].iter().collect();
                    if inner.is_empty() {
                        return Err(format!("empty group in '{template}'"));
                    }
                    return Ok((inner, i + 1));
                }
            }
            _ => {}
        }
        i += 1;
    }
    Err(format!("unterminated group in '{template}'"))
}

fn push_param(
    tokens: &mut Vec<Token>,
    literal: &mut String,
    key: PathKey,
    pattern: Option<String>,
    modifier: Option<char>,
) {
    let prefix = match literal.chars().last() {
        Some(c @ ('/' | '.')) => {
            literal.pop();
            Some(c)
        }
        _ => None,
    };
    if !literal.is_empty() {
        tokens.push(Token::Literal(std::mem::take(literal)));
    }

    let delimiter = prefix.unwrap_or('/');
    let pattern = pattern.unwrap_or_else(|| format!("[^{}]+?", regex::escape(&delimiter.to_string())));
    tokens.push(Token::Param {
        key,
        prefix,
        pattern,
        modifier,
    });
}
