//! Caller authentication.
//!
//! Session issuance lives outside the gateway. The HTTP layer only needs to
//! turn a request credential into a user id, which is what [`Authenticator`]
//! abstracts. [`StaticTokenAuth`] maps configured bearer tokens to users.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::config::ApiToken;

/// The authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub id: String,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Resolve a bearer token. `None` means unauthenticated.
    async fn authenticate(&self, token: &str) -> Option<AuthUser>;
}

/// Fixed token → user table.
pub struct StaticTokenAuth {
    tokens: Vec<ApiToken>,
}

impl StaticTokenAuth {
    pub fn new(tokens: Vec<ApiToken>) -> Self {
        if tokens.is_empty() {
            tracing::warn!("No API tokens configured; every authenticated route will return 401");
        }
        Self { tokens }
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuth {
    async fn authenticate(&self, token: &str) -> Option<AuthUser> {
        self.tokens
            .iter()
            .find(|t| secret_eq(&t.token, token))
            .map(|t| AuthUser {
                id: t.user_id.clone(),
            })
    }
}

/// Constant-time comparison of a configured secret with a presented value.
pub fn secret_eq(secret: &SecretString, presented: &str) -> bool {
    let expected = secret.expose_secret().as_bytes();
    let presented = presented.as_bytes();
    if expected.len() != presented.len() {
        return false;
    }
    expected
        .iter()
        .zip(presented)
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> StaticTokenAuth {
        StaticTokenAuth::new(vec![
            ApiToken {
                token: SecretString::from("tok-alice"),
                user_id: "alice".into(),
            },
            ApiToken {
                token: SecretString::from("tok-bob"),
                user_id: "bob".into(),
            },
        ])
    }

    #[tokio::test]
    async fn known_token_resolves_user() {
        let user = auth().authenticate("tok-bob").await.unwrap();
        assert_eq!(user.id, "bob");
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        assert!(auth().authenticate("tok-eve").await.is_none());
        assert!(auth().authenticate("").await.is_none());
    }

    #[test]
    fn secret_comparison() {
        let secret = SecretString::from("abc");
        assert!(secret_eq(&secret, "abc"));
        assert!(!secret_eq(&secret, "abd"));
        assert!(!secret_eq(&secret, "abcd"));
        assert!(!secret_eq(&secret, ""));
    }
}
