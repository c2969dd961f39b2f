//! Demand-driven access token refresh
//!
//! `ensure_fresh` runs on every authenticated request. It reads the access
//! token's `exp` without verifying the signature (the token came straight
//! from the provider's token endpoint) and redeems the refresh token when
//! the access token is within the leeway of expiring.
//!
//! The session's lock is held across the whole check-and-refresh, so two
//! requests racing on one session produce a single refresh: the second
//! caller wakes up to the tokens the first one stored.

use std::sync::Arc;
use std::time::Duration;

use oidc_auth::claims::unix_now;
use oidc_auth::{TokenClient, TokenSet, UnverifiedClaims};
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::store::{SessionKey, SessionState, SessionStore};

/// Refresh this long before the access token's `exp`.
pub const DEFAULT_LEEWAY: Duration = Duration::from_secs(30);

/// Whether an access token needs refreshing at `now` (unix seconds).
///
/// Opaque tokens and tokens without a usable `exp` always do.
pub fn needs_refresh(access_token: &str, now: i64, leeway: Duration) -> bool {
    match UnverifiedClaims::decode(access_token) {
        Ok(claims) => claims.is_expiring(now, leeway.as_secs() as i64),
        Err(_) => true,
    }
}

/// Keeps a session's access token valid, refreshing on demand.
pub struct RefreshPolicy {
    store: Arc<SessionStore>,
    client: TokenClient,
    leeway: Duration,
}

impl RefreshPolicy {
    pub fn new(store: Arc<SessionStore>, client: TokenClient) -> Self {
        Self {
            store,
            client,
            leeway: DEFAULT_LEEWAY,
        }
    }

    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway;
        self
    }

    /// Tokens for the session, refreshed first if the access token is
    /// expiring.
    ///
    /// - not authenticated → `Unauthenticated`
    /// - expiring without a refresh token → `Unauthenticated`, session cleared
    /// - refresh rejected by the provider → `RefreshFailed`, session cleared
    /// - provider unreachable → `Network`, session kept for a later retry
    #[instrument(skip_all, fields(session = %key))]
    pub async fn ensure_fresh(&self, key: &SessionKey) -> Result<TokenSet> {
        let Some(mut state) = self.store.lock_existing(key).await else {
            return Err(Error::Unauthenticated("no session".into()));
        };

        let (identity, current) = match &*state {
            SessionState::Authenticated { identity, tokens } => (identity.clone(), tokens.clone()),
            other => {
                return Err(Error::Unauthenticated(format!(
                    "session is {}",
                    other.label()
                )));
            }
        };

        if !needs_refresh(&current.access_token, unix_now(), self.leeway) {
            return Ok(current);
        }

        let Some(refresh_token) = current.refresh_token.as_deref() else {
            warn!("access token expiring and no refresh token held, clearing session");
            self.store.discard(key, &mut state).await;
            record_refresh("no_refresh_token");
            return Err(Error::Unauthenticated(
                "access token expired and no refresh token".into(),
            ));
        };

        debug!("access token expiring, refreshing");
        match self.client.exchange_refresh(refresh_token).await {
            Ok(fresh) => {
                let merged = fresh.retain_missing_from(&current);
                *state = SessionState::Authenticated {
                    identity,
                    tokens: merged.clone(),
                };
                record_refresh("success");
                info!("access token refreshed");
                Ok(merged)
            }
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "token refresh failed (transient), session kept");
                record_refresh("network_error");
                Err(e.into())
            }
            Err(e) => {
                warn!(error = %e, "token refresh rejected, clearing session");
                self.store.discard(key, &mut state).await;
                record_refresh("rejected");
                Err(e.into())
            }
        }
    }
}

fn record_refresh(outcome: &'static str) {
    metrics::counter!("oidc_token_refresh_total", "outcome" => outcome).increment(1);
}
