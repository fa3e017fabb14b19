//! Error types for rule loading and compilation

use thiserror::Error;

/// Errors that can occur while loading or compiling accept rules
///
/// Evaluation itself never returns these: a request that cannot be evaluated
/// is simply blocked.
#[derive(Debug, Error)]
pub enum FilterError {
    /// The rule source could not be parsed
    #[error("Rule source error: {message}")]
    Source {
        /// Description of what was wrong with the source
        message: String,
    },

    /// A single rule is malformed (bad path template, bad auth block)
    #[error("Invalid rule #{index}: {message}")]
    Rule {
        /// Position of the rule in its list
        index: usize,
        /// What was wrong with it
        message: String,
    },

    /// No ruleset exists for the requested connection type
    #[error("No rules loaded for connection type '{connection_type}'")]
    UnknownType {
        /// The connection type that was asked for
        connection_type: String,
    },

    /// JSON decoding failed
    #[error("JSON error: {source}")]
    Json {
        /// Underlying serde error
        #[from]
        source: serde_json::Error,
    },

    /// Reading a rule file failed
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl FilterError {
    /// Create a new rule source error
    #[must_use]
    pub fn source(message: impl Into<String>) -> Self {
        Self::Source {
            message: message.into(),
        }
    }

    /// Create a new invalid-rule error
    #[must_use]
    pub fn rule(index: usize, message: impl Into<String>) -> Self {
        Self::Rule {
            index,
            message: message.into(),
        }
    }
}

/// Result type alias for filter operations
pub type Result<T> = std::result::Result<T, FilterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FilterError::source("expected an array of rules");
        assert_eq!(
            err.to_string(),
            "Rule source error: expected an array of rules"
        );

        let err = FilterError::rule(3, "unterminated group");
        assert_eq!(err.to_string(), "Invalid rule #3: unterminated group");

        let err = FilterError::UnknownType {
            connection_type: "gitlab".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "No rules loaded for connection type 'gitlab'"
        );
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: FilterError = json_err.into();
        assert!(matches!(err, FilterError::Json { .. }));
    }
}
