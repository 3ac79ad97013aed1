//! Auth token collaborator used by the sync workers.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::util::unix_millis_now;

/// Tokens this close to expiry are treated as expired (ms)
const EXPIRY_SKEW_MILLIS: i64 = 30_000;

#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub value: String,
    /// Unix ms; `None` for tokens without a known lifetime
    pub expires_at: Option<i64>,
}

impl AuthToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            expires_at: None,
        }
    }

    #[must_use]
    pub const fn expiring_at(mut self, expires_at: i64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(unix_millis_now())
    }

    #[must_use]
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at
            .is_some_and(|expires_at| expires_at <= now.saturating_add(EXPIRY_SKEW_MILLIS))
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AuthToken")
            .field("value", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Auth token expired")]
    Expired,
    #[error("Token refresh failed: {0}")]
    Refresh(String),
    #[error("No auth token configured")]
    NotConfigured,
}

/// Source of bearer tokens for the remote API
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Current token, or `AuthError::Expired` if it needs a refresh
    async fn token(&self) -> Result<AuthToken, AuthError>;

    /// Obtain a fresh token
    async fn refresh(&self) -> Result<AuthToken, AuthError>;
}

/// Fixed token, e.g. a service credential or a test fixture
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: Option<AuthToken>,
}

impl StaticTokenProvider {
    pub const fn new(token: AuthToken) -> Self {
        Self { token: Some(token) }
    }

    /// Provider that reports `NotConfigured`
    pub const fn unconfigured() -> Self {
        Self { token: None }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self) -> Result<AuthToken, AuthError> {
        match &self.token {
            Some(token) if token.is_expired() => Err(AuthError::Expired),
            Some(token) => Ok(token.clone()),
            None => Err(AuthError::NotConfigured),
        }
    }

    async fn refresh(&self) -> Result<AuthToken, AuthError> {
        match &self.token {
            Some(_) => Err(AuthError::Refresh(
                "static tokens cannot be refreshed".to_string(),
            )),
            None => Err(AuthError::NotConfigured),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_token_debug_redacts_value() {
        let token = AuthToken::new("secret").expiring_at(123);
        let debug = format!("{token:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("[REDACTED]"));
        assert!(debug.contains("123"));
    }

    #[test]
    fn expiry_includes_skew() {
        let token = AuthToken::new("t").expiring_at(100_000);
        assert!(!token.is_expired_at(0));
        assert!(token.is_expired_at(70_000));
        assert!(token.is_expired_at(100_000));
        assert!(!AuthToken::new("t").is_expired_at(i64::MAX));
    }

    #[tokio::test]
    async fn static_provider_reports_state() {
        let provider = StaticTokenProvider::new(AuthToken::new("abc"));
        assert_eq!(provider.token().await.unwrap().value, "abc");
        assert!(matches!(
            provider.refresh().await,
            Err(AuthError::Refresh(_))
        ));

        let expired = StaticTokenProvider::new(AuthToken::new("abc").expiring_at(0));
        assert_eq!(expired.token().await, Err(AuthError::Expired));

        let missing = StaticTokenProvider::unconfigured();
        assert_eq!(missing.token().await, Err(AuthError::NotConfigured));
    }
}
