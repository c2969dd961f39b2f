//! Token endpoint exchange and refresh
//!
//! Handles the two token endpoint interactions:
//! 1. Authorization code exchange (completing a login)
//! 2. Refresh token grant (renewing the access token on demand)
//!
//! Both POST form-encoded grants to the provider's token endpoint. Grant
//! rejections come back as `TokenExchangeFailed`/`RefreshFailed` carrying the
//! provider's status and body; transport failures come back as `Network`.

use std::fmt;
use std::time::Duration;

use common::Secret;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::endpoints::DEFAULT_TIMEOUT;
use crate::error::{Error, Result};

/// Response body from the token endpoint for both grants.
///
/// `expires_in` is a delta in seconds. The access token's own `exp` claim is
/// what the refresh policy reads, so this field is informational.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// Tokens held for one authenticated session.
///
/// Replaced as a whole. The one exception is a refresh response that omits
/// `refresh_token` or `id_token`; see [`TokenSet::retain_missing_from`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
}

impl TokenSet {
    /// Keep `previous`'s refresh and ID tokens where this set has none.
    pub fn retain_missing_from(mut self, previous: &TokenSet) -> Self {
        if self.refresh_token.is_none() {
            self.refresh_token = previous.refresh_token.clone();
        }
        if self.id_token.is_none() {
            self.id_token = previous.id_token.clone();
        }
        self
    }
}

impl From<TokenResponse> for TokenSet {
    fn from(response: TokenResponse) -> Self {
        Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            id_token: response.id_token,
        }
    }
}

impl fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("id_token", &self.id_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Which grant a request carried, for error mapping.
#[derive(Clone, Copy)]
enum Grant {
    AuthorizationCode,
    RefreshToken,
}

/// Client for one provider token endpoint.
#[derive(Debug, Clone)]
pub struct TokenClient {
    http: reqwest::Client,
    token_endpoint: String,
    client_id: String,
    client_secret: Option<Secret<String>>,
    timeout: Duration,
}

impl TokenClient {
    pub fn new(
        http: reqwest::Client,
        token_endpoint: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            http,
            token_endpoint: token_endpoint.into(),
            client_id: client_id.into(),
            client_secret: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Authenticate as a confidential client.
    pub fn with_client_secret(mut self, secret: Option<Secret<String>>) -> Self {
        self.client_secret = secret;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Exchange an authorization code for tokens.
    ///
    /// Never retried: the provider consumes the code on the first attempt
    /// whatever the outcome.
    #[instrument(skip_all, fields(endpoint = %self.token_endpoint))]
    pub async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
    ) -> Result<TokenSet> {
        if code.is_empty() {
            return Err(Error::Input("authorization code is empty".into()));
        }
        let form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("code_verifier", code_verifier),
        ];
        let response = self.post(form, Grant::AuthorizationCode).await?;
        debug!("authorization code exchanged");
        Ok(response.into())
    }

    /// Redeem a refresh token.
    ///
    /// The returned set carries only what the provider sent back; merge it
    /// with the stored set via [`TokenSet::retain_missing_from`].
    #[instrument(skip_all, fields(endpoint = %self.token_endpoint))]
    pub async fn exchange_refresh(&self, refresh_token: &str) -> Result<TokenSet> {
        if refresh_token.is_empty() {
            return Err(Error::Input("refresh token is empty".into()));
        }
        let form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        let response = self.post(form, Grant::RefreshToken).await?;
        debug!("refresh token redeemed");
        Ok(response.into())
    }

    async fn post(&self, mut form: Vec<(&str, &str)>, grant: Grant) -> Result<TokenResponse> {
        form.push(("client_id", &self.client_id));
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.expose()));
        }

        let response = self
            .http
            .post(&self.token_endpoint)
            .timeout(self.timeout)
            .form(&form)
            .send()
            .await
            .map_err(|e| network_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            warn!(status = status.as_u16(), "token endpoint rejected grant");
            let status = status.as_u16();
            return Err(match grant {
                Grant::AuthorizationCode => Error::TokenExchangeFailed { status, body },
                Grant::RefreshToken => Error::RefreshFailed { status, body },
            });
        }

        let bytes = response.bytes().await.map_err(|e| network_error(&e))?;
        serde_json::from_slice::<TokenResponse>(&bytes)
            .map_err(|e| Error::InvalidResponse(e.to_string()))
    }
}

fn network_error(e: &reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Network(format!("token endpoint timed out: {e}"))
    } else {
        Error::Network(format!("token endpoint unreachable: {e}"))
    }
}
