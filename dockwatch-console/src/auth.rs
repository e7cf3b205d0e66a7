//! Bearer token access and secure storage
//!
//! The session components never cache the credential: they read it
//! through a [`TokenSource`] at request/connection time, so a token
//! refreshed elsewhere takes effect on the next request without a
//! session restart.

use keyring::Entry;
use thiserror::Error;
use tracing::warn;

const KEYRING_SERVICE: &str = "dockwatch";
const KEYRING_USER: &str = "api-token";

#[derive(Debug, Error)]
pub enum TokenStoreError {
    #[error("keyring unavailable: {0}")]
    Keyring(#[from] keyring::Error),
}

/// Supplies the current bearer token on demand. `None` means the
/// operator is unauthenticated, which callers treat as a terminal
/// precondition failure rather than something to retry.
pub trait TokenSource: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

/// Token storage backed by the OS keyring. Each read opens the entry
/// fresh so external updates are picked up immediately.
#[derive(Debug, Clone, Default)]
pub struct KeyringTokenStore;

impl KeyringTokenStore {
    pub fn new() -> Self {
        Self
    }

    fn entry() -> Result<Entry, TokenStoreError> {
        Entry::new(KEYRING_SERVICE, KEYRING_USER).map_err(Into::into)
    }

    pub fn store(&self, token: &str) -> Result<(), TokenStoreError> {
        Self::entry()?.set_password(token).map_err(Into::into)
    }

    pub fn clear(&self) -> Result<(), TokenStoreError> {
        Self::entry()?.delete_credential().map_err(Into::into)
    }
}

impl TokenSource for KeyringTokenStore {
    fn bearer_token(&self) -> Option<String> {
        match Self::entry().and_then(|e| e.get_password().map_err(Into::into)) {
            Ok(token) => Some(token),
            Err(TokenStoreError::Keyring(keyring::Error::NoEntry)) => None,
            Err(e) => {
                warn!("failed to read token from keyring: {}", e);
                None
            }
        }
    }
}

/// Fixed token, used by tests and the devkit stub flows.
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

impl TokenSource for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}
