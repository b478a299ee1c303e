//! Authentication types for the connection handshake.
//!
//! Protocol flow:
//!   1. Client connects to ws://host:port/ws
//!   2. Client sends: { type: "auth", data: { token, userId?, sessionId? } }
//!   3. Server replies `auth_success` or `auth_error`
//!   4. Any other kind sent before step 3 succeeds is answered with an
//!      `error` envelope carrying `auth_required` and is dropped

/// Authentication state for a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Pending,
    Authenticated,
}

/// Authentication configuration for the server.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Shared secret. `None` accepts any token (development mode).
    pub token: Option<String>,
    /// User id assigned when the auth message does not carry one.
    pub default_user_id: String,
}

impl AuthConfig {
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Self::default()
        }
    }

    /// Check a presented token against the configured secret.
    pub fn verify(&self, presented: &str) -> bool {
        match &self.token {
            Some(expected) => expected == presented,
            None => true,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token: None,
            default_user_id: "anonymous".into(),
        }
    }
}
