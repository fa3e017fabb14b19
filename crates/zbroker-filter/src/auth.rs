//! Authorization header resolution for matched rules

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::rule::{AuthScheme, AuthSpec};
use crate::vars::Variables;

impl AuthSpec {
    /// Render the `authorization` header value, substituting templates from `vars`
    #[must_use]
    pub fn header_value(&self, vars: &Variables) -> String {
        let render = |field: &Option<String>| vars.substitute(field.as_deref().unwrap_or_default());

        match self.scheme {
            AuthScheme::Token => format!("Token {}", render(&self.token)),
            AuthScheme::Bearer => format!("Bearer {}", render(&self.token)),
            AuthScheme::Raw => render(&self.token),
            AuthScheme::Basic => {
                let credentials = if self.token.as_deref().is_some_and(|t| !t.is_empty()) {
                    render(&self.token)
                } else {
                    format!("{}:{}", render(&self.username), render(&self.password))
                };
                format!("Basic {}", STANDARD.encode(credentials))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> Variables {
        Variables::new()
            .with("TOKEN", "s3cr3t")
            .with("USER", "bob")
            .with("PASS", "hunter2")
    }

    #[test]
    fn test_token_and_bearer() {
        let vars = vars();
        assert_eq!(
            AuthSpec::token(AuthScheme::Token, "${TOKEN}").header_value(&vars),
            "Token s3cr3t"
        );
        assert_eq!(
            AuthSpec::token(AuthScheme::Bearer, "${TOKEN}").header_value(&vars),
            "Bearer s3cr3t"
        );
    }

    #[test]
    fn test_raw() {
        let vars = vars();
        assert_eq!(
            AuthSpec::token(AuthScheme::Raw, "PRIVATE-TOKEN ${TOKEN}").header_value(&vars),
            "PRIVATE-TOKEN s3cr3t"
        );
    }

    #[test]
    fn test_basic_user_pass() {
        let vars = vars();
        // base64("bob:hunter2")
        assert_eq!(
            AuthSpec::basic("${USER}", "${PASS}").header_value(&vars),
            "Basic Ym9iOmh1bnRlcjI="
        );
    }

    #[test]
    fn test_basic_token() {
        let vars = vars();
        let spec = AuthSpec::token(AuthScheme::Basic, ":${TOKEN}");
        // base64(":s3cr3t")
        assert_eq!(spec.header_value(&vars), "Basic OnMzY3IzdA==");
    }

    #[test]
    fn test_pooled_token() {
        let vars = Variables::new().with("TOKEN_POOL", "one,two");
        let spec = AuthSpec::token(AuthScheme::Bearer, "${TOKEN}");
        assert_eq!(spec.header_value(&vars), "Bearer one");
        assert_eq!(spec.header_value(&vars), "Bearer two");
    }
}
