//! HTTP mapping for failures on either listener

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::{error, warn};

/// Every failure a handler can return.
///
/// Rendered as `{"error":{"type","message","request_id"}}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] oidc_auth::Error),

    #[error(transparent)]
    Session(#[from] oidc_session::Error),

    #[error(transparent)]
    Bearer(#[from] bearer_verifier::Error),

    /// Cookie session layer failure.
    #[error("session backend error: {0}")]
    Internal(String),
}

impl From<tower_sessions::session::Error> for ApiError {
    fn from(e: tower_sessions::session::Error) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Auth(e) => auth_status(e),
            ApiError::Session(oidc_session::Error::StateMismatch(_)) => StatusCode::BAD_REQUEST,
            ApiError::Session(oidc_session::Error::Unauthenticated(_)) => StatusCode::UNAUTHORIZED,
            ApiError::Session(oidc_session::Error::Auth(e)) => auth_status(e),
            ApiError::Bearer(bearer_verifier::Error::KeySetUnavailable(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Bearer(_) => StatusCode::UNAUTHORIZED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            ApiError::Auth(e) | ApiError::Session(oidc_session::Error::Auth(e)) => auth_type(e),
            ApiError::Session(oidc_session::Error::StateMismatch(_)) => "state_mismatch",
            ApiError::Session(oidc_session::Error::Unauthenticated(_)) => "unauthenticated",
            ApiError::Bearer(e) => e.label(),
            ApiError::Internal(_) => "internal_error",
        }
    }

    /// `WWW-Authenticate` challenge for rejected bearer credentials.
    fn challenge(&self) -> Option<&'static str> {
        match self {
            ApiError::Bearer(bearer_verifier::Error::MissingCredential(_)) => Some("Bearer"),
            ApiError::Bearer(
                bearer_verifier::Error::UnknownSigningKey(_)
                | bearer_verifier::Error::InvalidToken { .. },
            ) => Some("Bearer error=\"invalid_token\""),
            _ => None,
        }
    }
}

fn auth_status(e: &oidc_auth::Error) -> StatusCode {
    match e {
        oidc_auth::Error::Input(_) => StatusCode::BAD_REQUEST,
        oidc_auth::Error::TokenExchangeFailed { .. } | oidc_auth::Error::RefreshFailed { .. } => {
            StatusCode::UNAUTHORIZED
        }
        oidc_auth::Error::Network(_) | oidc_auth::Error::InvalidResponse(_) => {
            StatusCode::BAD_GATEWAY
        }
    }
}

fn auth_type(e: &oidc_auth::Error) -> &'static str {
    match e {
        oidc_auth::Error::Input(_) => "invalid_request",
        oidc_auth::Error::TokenExchangeFailed { .. } => "token_exchange_failed",
        oidc_auth::Error::RefreshFailed { .. } => "refresh_failed",
        oidc_auth::Error::Network(_) => "network_error",
        oidc_auth::Error::InvalidResponse(_) => "invalid_response",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
        let status = self.status();
        let error_type = self.error_type();

        if status.is_server_error() {
            error!(%request_id, error_type, status = status.as_u16(), error = %self, "request failed");
        } else {
            warn!(%request_id, error_type, status = status.as_u16(), error = %self, "request rejected");
        }

        let body = serde_json::json!({
            "error": {
                "type": error_type,
                "message": self.to_string(),
                "request_id": request_id,
            }
        });
        let mut response = (
            status,
            [(header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response();
        if let Some(challenge) = self.challenge() {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static(challenge));
        }
        response
    }
}
