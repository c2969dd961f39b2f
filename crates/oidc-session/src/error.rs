//! Error types for session operations

/// Errors from session operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Callback state (or ID token nonce) does not match a live pending
    /// request. The flow must be restarted.
    #[error("state mismatch: {0}")]
    StateMismatch(String),

    /// No usable authenticated session. The user must log in again.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error(transparent)]
    Auth(#[from] oidc_auth::Error),
}

impl Error {
    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Auth(e) if e.is_retryable())
    }
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;
