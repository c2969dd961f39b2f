//! CSRF state guard for the authorization callback
//!
//! `begin` parks a fresh `AuthRequestContext` in the session; `validate`
//! takes it back out when the provider redirects to the callback. A context
//! can be taken at most once, and only by a callback carrying its `state`
//! within the pending-flow lifetime.

use std::sync::Arc;
use std::time::{Duration, Instant};

use oidc_auth::{AuthRequestContext, TokenSet, UnverifiedClaims};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::store::{SessionKey, SessionState, SessionStore};

/// How long a started login may wait for its callback.
pub const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(600);

/// Upper bound between sweeps of abandoned logins.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Issues and redeems pending authorization contexts.
pub struct StateGuard {
    store: Arc<SessionStore>,
    ttl: Duration,
    last_sweep: Mutex<Option<Instant>>,
}

impl StateGuard {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self {
            store,
            ttl: DEFAULT_PENDING_TTL,
            last_sweep: Mutex::new(None),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Start an authorization attempt for the session.
    ///
    /// Replaces whatever the session held, including an authenticated login.
    /// Also drops pending logins of other sessions that were never completed.
    pub async fn begin(&self, key: &SessionKey) -> AuthRequestContext {
        self.sweep().await;
        let context = AuthRequestContext::generate();
        let mut state = self.store.lock(key).await;
        if let SessionState::Authenticated { .. } = &*state {
            info!(session = %key, "new login replaces authenticated session");
        }
        *state = SessionState::PendingAuth(context.clone());
        debug!(session = %key, "authorization request issued");
        context
    }

    /// Redeem the pending context whose `state` matches the callback.
    ///
    /// Fails with `StateMismatch` when the session has no pending context,
    /// the state differs, or the context outlived the pending-flow lifetime.
    /// A differing state leaves the pending context in place. An expired or
    /// redeemed context leaves the session `Anonymous`, which drops its entry.
    pub async fn validate(
        &self,
        key: &SessionKey,
        received_state: &str,
    ) -> Result<AuthRequestContext> {
        let Some(mut state) = self.store.lock_existing(key).await else {
            warn!(session = %key, "callback without a session");
            return Err(Error::StateMismatch("no pending authorization request".into()));
        };

        let context = match std::mem::take(&mut *state) {
            SessionState::PendingAuth(context) => context,
            other => {
                warn!(session = %key, state = other.label(), "callback without a pending request");
                *state = other;
                return Err(Error::StateMismatch("no pending authorization request".into()));
            }
        };

        if context.age() >= self.ttl {
            warn!(session = %key, age_secs = context.age().as_secs(), "pending authorization request expired");
            self.store.discard(key, &mut state).await;
            return Err(Error::StateMismatch("authorization request expired".into()));
        }

        if !constant_time_eq(context.state.as_bytes(), received_state.as_bytes()) {
            warn!(session = %key, "callback state does not match pending request");
            *state = SessionState::PendingAuth(context);
            return Err(Error::StateMismatch("state does not match".into()));
        }

        self.store.discard(key, &mut state).await;
        debug!(session = %key, "authorization request redeemed");
        Ok(context)
    }

    async fn sweep(&self) {
        {
            let mut last_sweep = self.last_sweep.lock().await;
            let interval = self.ttl.min(SWEEP_INTERVAL);
            if last_sweep.is_some_and(|at| at.elapsed() < interval) {
                return;
            }
            *last_sweep = Some(Instant::now());
        }
        let purged = self.store.purge_expired(self.ttl).await;
        if purged > 0 {
            debug!(purged, "expired authorization requests purged");
        }
    }
}

/// Check the ID token (when the provider sent one) was issued for this
/// authorization attempt.
pub fn check_nonce(context: &AuthRequestContext, tokens: &TokenSet) -> Result<()> {
    let Some(id_token) = tokens.id_token.as_deref() else {
        return Ok(());
    };
    let claims = UnverifiedClaims::decode(id_token)
        .map_err(|e| oidc_auth::Error::InvalidResponse(format!("id token: {e}")))?;
    match claims.get_str("nonce") {
        Some(nonce) if constant_time_eq(nonce.as_bytes(), context.nonce.as_bytes()) => Ok(()),
        Some(_) => Err(Error::StateMismatch("id token nonce does not match".into())),
        None => Err(Error::StateMismatch("id token carries no nonce".into())),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
