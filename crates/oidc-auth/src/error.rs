//! Error types for OIDC client operations

/// Errors from the client side of the authorization code flow.
///
/// Only `Network` is safe to retry. Grant rejections from the identity
/// provider are terminal: authorization codes are single-use and a revoked
/// refresh token never becomes valid again.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    Input(String),

    #[error("token exchange failed ({status}): {body}")]
    TokenExchangeFailed { status: u16, body: String },

    #[error("token refresh failed ({status}): {body}")]
    RefreshFailed { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid token response: {0}")]
    InvalidResponse(String),
}

impl Error {
    /// Whether the caller may retry the operation with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_))
    }
}

/// Result alias for OIDC client operations.
pub type Result<T> = std::result::Result<T, Error>;
