//! Authorization request context and URL
//!
//! One `AuthRequestContext` exists per authorization attempt. Its `state`
//! binds the callback to the browser session that started the flow, its
//! `nonce` binds the returned ID token to this attempt, and its
//! `code_verifier` proves possession at token exchange.

use std::fmt;
use std::time::{Duration, Instant};

use url::Url;

use crate::endpoints::{CODE_CHALLENGE_METHOD, ClientSettings, ProviderEndpoints};
use crate::error::{Error, Result};
use crate::pkce::{PkcePair, compute_challenge, random_urlsafe};

/// Random bytes behind `state` and `nonce`.
const STATE_BYTES: usize = 16;

/// Pending authorization attempt for one browser session.
#[derive(Clone)]
pub struct AuthRequestContext {
    pub state: String,
    pub nonce: String,
    pub code_verifier: String,
    created_at: Instant,
}

impl AuthRequestContext {
    /// Fresh state, nonce and PKCE verifier.
    pub fn generate() -> Self {
        let pkce = PkcePair::generate();
        Self {
            state: random_urlsafe::<STATE_BYTES>(),
            nonce: random_urlsafe::<STATE_BYTES>(),
            code_verifier: pkce.verifier,
            created_at: Instant::now(),
        }
    }

    /// S256 challenge for this context's verifier.
    pub fn code_challenge(&self) -> String {
        compute_challenge(&self.code_verifier)
    }

    /// Time since the context was generated.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

// The verifier is a secret until it is spent; keep it out of logs.
impl fmt::Debug for AuthRequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthRequestContext")
            .field("state", &self.state)
            .field("nonce", &self.nonce)
            .field("code_verifier", &"[REDACTED]")
            .field("age", &self.age())
            .finish()
    }
}

/// Build the authorization endpoint URL for a pending context.
pub fn build_authorization_url(
    endpoints: &ProviderEndpoints,
    client: &ClientSettings,
    context: &AuthRequestContext,
) -> Result<String> {
    let challenge = context.code_challenge();
    let url = Url::parse_with_params(
        &endpoints.authorization,
        &[
            ("client_id", client.client_id.as_str()),
            ("response_type", "code"),
            ("redirect_uri", client.redirect_uri.as_str()),
            ("scope", client.scopes.as_str()),
            ("state", context.state.as_str()),
            ("nonce", context.nonce.as_str()),
            ("code_challenge", challenge.as_str()),
            ("code_challenge_method", CODE_CHALLENGE_METHOD),
        ],
    )
    .map_err(|e| Error::Input(format!("invalid authorization endpoint: {e}")))?;
    Ok(url.into())
}
