//! Credential collaborator used by the remote gateway.
//!
//! Session issuance lives outside this crate; the sync engine only needs a
//! bearer token and a way to ask for a fresh one after a 401.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;

use crate::util::normalize_text_option;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("No API credential is configured. Run `keepsake auth login` first.")]
    NotConfigured,
    #[error("Invalid credential: {0}")]
    InvalidCredential(&'static str),
    #[error("Credential refresh failed: {0}")]
    Refresh(String),
    #[error("Secure storage error: {0}")]
    SecureStorage(String),
}

pub type AuthResult<T> = Result<T, AuthError>;

/// Source of the bearer credential attached to every remote request.
pub trait CredentialProvider: Send + Sync + 'static {
    /// Current bearer token.
    fn bearer_token(&self) -> impl Future<Output = AuthResult<String>> + Send;

    /// Try to obtain a new credential after the remote rejected the current one.
    fn refresh(&self) -> impl Future<Output = AuthResult<()>> + Send;
}

impl<P: CredentialProvider> CredentialProvider for Arc<P> {
    fn bearer_token(&self) -> impl Future<Output = AuthResult<String>> + Send {
        P::bearer_token(self)
    }

    fn refresh(&self) -> impl Future<Output = AuthResult<()>> + Send {
        P::refresh(self)
    }
}

/// Fixed token with no refresh capability.
#[derive(Clone, Default)]
pub struct StaticCredentials {
    token: Option<String>,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> AuthResult<Self> {
        let token = normalize_text_option(Some(token.into()))
            .ok_or(AuthError::InvalidCredential("token must not be empty"))?;
        Ok(Self { token: Some(token) })
    }

    /// Provider that never has a token; every request fails with `NotConfigured`.
    #[must_use]
    pub const fn anonymous() -> Self {
        Self { token: None }
    }
}

impl fmt::Debug for StaticCredentials {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("StaticCredentials")
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl CredentialProvider for StaticCredentials {
    async fn bearer_token(&self) -> AuthResult<String> {
        self.token.clone().ok_or(AuthError::NotConfigured)
    }

    async fn refresh(&self) -> AuthResult<()> {
        Err(AuthError::Refresh(
            "static credentials cannot be refreshed".to_string(),
        ))
    }
}
