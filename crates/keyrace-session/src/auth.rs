//! Authentication hook for resolving a join credential to an account.
//!
//! Keyrace doesn't implement authentication itself. A client may present
//! a token when joining a room; the [`Authenticator`] turns it into a
//! [`UserId`] or rejects it. Rejection never blocks the join: the
//! connection simply races as a guest, and guests' results aren't stored.

use std::collections::HashMap;

use keyrace_protocol::UserId;

use crate::SessionError;

/// Validates a client's credential and returns their account identity.
///
/// # Example
///
/// ```rust
/// use keyrace_protocol::UserId;
/// use keyrace_session::{Authenticator, SessionError};
///
/// /// Treats `user:<name>` tokens as valid. Development only.
/// struct DevAuthenticator;
///
/// impl Authenticator for DevAuthenticator {
///     async fn authenticate(&self, token: &str) -> Result<UserId, SessionError> {
///         token
///             .strip_prefix("user:")
///             .map(|name| UserId(name.to_string()))
///             .ok_or_else(|| SessionError::AuthFailed("unknown token".into()))
///     }
/// }
/// ```
pub trait Authenticator: Send + Sync + 'static {
    /// Validates the given token.
    ///
    /// # Returns
    /// - `Ok(UserId)` — the token belongs to this account
    /// - `Err(SessionError::AuthFailed)` — invalid, expired, or unknown
    fn authenticate(
        &self,
        token: &str,
    ) -> impl std::future::Future<Output = Result<UserId, SessionError>> + Send;
}

/// Rejects every token: everybody races as a guest.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuestOnly;

impl Authenticator for GuestOnly {
    async fn authenticate(&self, _token: &str) -> Result<UserId, SessionError> {
        Err(SessionError::AuthFailed("authentication disabled".into()))
    }
}

/// Accepts a fixed table of tokens. Useful for tests and local setups.
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, UserId>,
}

impl StaticTokens {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a token for `user`.
    pub fn with(mut self, token: impl Into<String>, user: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), UserId(user.into()));
        self
    }
}

impl Authenticator for StaticTokens {
    async fn authenticate(&self, token: &str) -> Result<UserId, SessionError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| SessionError::AuthFailed("unknown token".into()))
    }
}
