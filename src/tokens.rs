//! Gateway tokens and the store that maps users onto them.
//!
//! A user without a configured token is simply not tracked; the tracker
//! treats a `None` from [`TokenStore::token_for`] as a deliberate skip, not
//! an error.

use std::collections::HashMap;

use thiserror::Error;
use veil::Redact;

use crate::media::UserId;

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("gateway token invalid: {0}")]
    Invalid(String),
}

/// A secret authorizing one gateway connection.
///
/// Write-once; the secret is only reachable through [`expose`](Self::expose)
/// and never appears in debug output.
#[derive(Clone, Eq, PartialEq, Redact)]
pub struct UserToken {
    #[redact]
    token: String,
}

impl UserToken {
    pub fn new(token: &str) -> Result<Self, TokenError> {
        if token.is_empty() || token.contains(char::is_whitespace) {
            return Err(TokenError::Invalid(
                "token must be non-empty without whitespace".to_string(),
            ));
        }

        Ok(Self {
            token: token.to_owned(),
        })
    }

    /// The secret itself, for building wire payloads.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.token
    }
}

/// Maps a user identity to zero-or-one gateway token.
pub trait TokenStore: Send + Sync {
    /// `None` means "do not track this user".
    fn token_for(&self, user_id: &UserId) -> Option<UserToken>;
}

/// Token store backed by the configuration's user table.
#[derive(Clone, Debug, Default)]
pub struct ConfigTokenStore {
    tokens: HashMap<UserId, UserToken>,
}

impl ConfigTokenStore {
    #[must_use]
    pub fn new(tokens: HashMap<UserId, UserToken>) -> Self {
        Self { tokens }
    }
}

impl TokenStore for ConfigTokenStore {
    fn token_for(&self, user_id: &UserId) -> Option<UserToken> {
        self.tokens.get(user_id).cloned()
    }
}
