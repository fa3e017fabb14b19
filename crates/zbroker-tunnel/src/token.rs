//! Broker token helpers
//!
//! Raw tokens are credentials and never appear in logs or summaries; use the
//! masked or hashed forms instead.

use sha2::{Digest, Sha256};

/// Canonical registry key for a token (tokens are case-insensitive)
#[must_use]
pub fn normalize_token(token: &str) -> String {
    token.trim().to_ascii_lowercase()
}

/// Hash a token (SHA256, hex encoded)
///
/// ```rust
/// use zbroker_tunnel::hash_token;
///
/// assert_eq!(hash_token("my-secret-token").len(), 64);
/// ```
#[must_use]
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Mask a token as `first4-...-last4`
///
/// Tokens of eight characters or fewer are fully masked.
#[must_use]
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    match chars.len() {
        0 => String::new(),
        n if n <= 8 => "****".to_string(),
        n => {
            let head: String = chars[..4].iter().collect();
            let tail: String = chars[n - 4..].iter().collect();
            format!("{head}-...-{tail}")
        }
    }
}
