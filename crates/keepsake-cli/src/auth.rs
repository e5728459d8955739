//! API token persistence in the OS keychain.

#[cfg(test)]
use std::collections::HashMap;
use std::sync::Mutex;
#[cfg(test)]
use std::sync::OnceLock;

#[cfg(not(test))]
use keyring::Entry;

use keepsake_core::auth::{AuthError, AuthResult, CredentialProvider};
use keepsake_core::util::normalize_text_option;

/// Environment variable that overrides the stored token.
pub const TOKEN_ENV_VAR: &str = "KEEPSAKE_API_TOKEN";

#[cfg(not(test))]
const KEYRING_SERVICE_NAME: &str = "keepsake-cli";
const KEYRING_USERNAME: &str = "api_token";

/// Where the active credential came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    Environment,
    Keychain,
}

impl TokenSource {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Environment => TOKEN_ENV_VAR,
            Self::Keychain => "OS keychain",
        }
    }
}

#[derive(Clone)]
pub struct TokenStore {
    username: String,
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new(KEYRING_USERNAME)
    }
}

impl TokenStore {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }

    #[cfg(test)]
    fn test_store() -> &'static Mutex<HashMap<String, String>> {
        static STORE: OnceLock<Mutex<HashMap<String, String>>> = OnceLock::new();
        STORE.get_or_init(|| Mutex::new(HashMap::new()))
    }

    #[cfg(not(test))]
    fn entry(&self) -> AuthResult<Entry> {
        Entry::new(KEYRING_SERVICE_NAME, &self.username)
            .map_err(|error| AuthError::SecureStorage(error.to_string()))
    }

    #[cfg(not(test))]
    pub fn load(&self) -> AuthResult<Option<String>> {
        match self.entry()?.get_password() {
            Ok(token) => Ok(normalize_text_option(Some(token))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(error) => Err(AuthError::SecureStorage(error.to_string())),
        }
    }

    #[cfg(test)]
    pub fn load(&self) -> AuthResult<Option<String>> {
        let guard = Self::test_store()
            .lock()
            .map_err(|error| AuthError::SecureStorage(error.to_string()))?;
        Ok(guard.get(&self.username).cloned())
    }

    #[cfg(not(test))]
    pub fn save(&self, token: &str) -> AuthResult<()> {
        let token = validate_token(token)?;
        self.entry()?
            .set_password(&token)
            .map_err(|error| AuthError::SecureStorage(error.to_string()))
    }

    #[cfg(test)]
    pub fn save(&self, token: &str) -> AuthResult<()> {
        let token = validate_token(token)?;
        let mut guard = Self::test_store()
            .lock()
            .map_err(|error| AuthError::SecureStorage(error.to_string()))?;
        guard.insert(self.username.clone(), token);
        Ok(())
    }

    #[cfg(not(test))]
    pub fn clear(&self) -> AuthResult<()> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(error) => Err(AuthError::SecureStorage(error.to_string())),
        }
    }

    #[cfg(test)]
    pub fn clear(&self) -> AuthResult<()> {
        let mut guard = Self::test_store()
            .lock()
            .map_err(|error| AuthError::SecureStorage(error.to_string()))?;
        guard.remove(&self.username);
        Ok(())
    }
}

fn validate_token(token: &str) -> AuthResult<String> {
    normalize_text_option(Some(token.to_string()))
        .ok_or(AuthError::InvalidCredential("token must not be empty"))
}

/// Resolve the active token: the environment wins over the keychain.
pub fn resolve_token<F>(store: &TokenStore, env: F) -> AuthResult<Option<(String, TokenSource)>>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(token) = normalize_text_option(env(TOKEN_ENV_VAR)) {
        return Ok(Some((token, TokenSource::Environment)));
    }
    Ok(store.load()?.map(|token| (token, TokenSource::Keychain)))
}

/// Credential provider backed by [`TokenStore`].
///
/// A refresh succeeds only when the stored token changed since it was last
/// handed out, e.g. after `keepsake auth login` from another shell.
pub struct KeyringCredentials {
    store: TokenStore,
    last_token: Mutex<Option<String>>,
}

impl KeyringCredentials {
    pub const fn new(store: TokenStore) -> Self {
        Self {
            store,
            last_token: Mutex::new(None),
        }
    }

    fn current(&self) -> AuthResult<String> {
        let (token, _) = resolve_token(&self.store, |key| std::env::var(key).ok())?
            .ok_or(AuthError::NotConfigured)?;
        Ok(token)
    }

    fn remember(&self, token: &str) -> AuthResult<()> {
        let mut guard = self
            .last_token
            .lock()
            .map_err(|error| AuthError::SecureStorage(error.to_string()))?;
        *guard = Some(token.to_string());
        Ok(())
    }

    fn last(&self) -> AuthResult<Option<String>> {
        let guard = self
            .last_token
            .lock()
            .map_err(|error| AuthError::SecureStorage(error.to_string()))?;
        Ok(guard.clone())
    }
}

impl CredentialProvider for KeyringCredentials {
    async fn bearer_token(&self) -> AuthResult<String> {
        let token = self.current()?;
        self.remember(&token)?;
        Ok(token)
    }

    async fn refresh(&self) -> AuthResult<()> {
        let token = self.current()?;
        if self.last()?.as_deref() == Some(token.as_str()) {
            return Err(AuthError::Refresh(
                "the API token was rejected; run `keepsake auth login` with a new token"
                    .to_string(),
            ));
        }
        tracing::info!("Picked up a new API token");
        self.remember(&token)
    }
}
