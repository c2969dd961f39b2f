//! Error types for bearer verification

/// Why a presented credential was not accepted.
///
/// Everything but `KeySetUnavailable` is a final rejection of the token.
/// `KeySetUnavailable` means the decision could not be made because the
/// provider's key set could not be fetched.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("missing bearer credential: {0}")]
    MissingCredential(String),

    #[error("unknown signing key: {0}")]
    UnknownSigningKey(String),

    #[error("invalid token: {reason}")]
    InvalidToken { reason: String },

    #[error("signing keys unavailable: {0}")]
    KeySetUnavailable(String),
}

impl Error {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Error::InvalidToken {
            reason: reason.into(),
        }
    }

    /// Whether the same token may verify once the key set is reachable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::KeySetUnavailable(_))
    }

    /// Outcome label for logging and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Error::MissingCredential(_) => "missing_credential",
            Error::UnknownSigningKey(_) => "unknown_key",
            Error::InvalidToken { .. } => "invalid_token",
            Error::KeySetUnavailable(_) => "keys_unavailable",
        }
    }
}

/// Result alias for bearer verification.
pub type Result<T> = std::result::Result<T, Error>;
