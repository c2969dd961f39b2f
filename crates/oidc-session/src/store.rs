//! Session state machine and per-session token storage
//!
//! The store maps an opaque session key (carried in the browser's cookie) to
//! that session's `SessionState`. Each entry sits behind its own async mutex,
//! so operations on one session are atomic without blocking other sessions.
//! The outer map lock is only held long enough to find or create an entry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use oidc_auth::{AuthRequestContext, SessionIdentity, TokenSet};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info};

/// Opaque identifier binding a browser to its server-side session.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionKey(String);

impl SessionKey {
    /// Fresh random key for a new browser session.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// Keys are bearer secrets for the session; only a prefix goes to logs.
impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey({})", self)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.0.chars().take(8).collect();
        write!(f, "{prefix}…")
    }
}

/// Where one browser session is in the login lifecycle.
///
/// Transitions:
/// - Anonymous → PendingAuth (login started)
/// - PendingAuth → PendingAuth (login restarted, context overwritten)
/// - PendingAuth → Anonymous (callback consumed or expired the context)
/// - Anonymous → Authenticated (code exchanged)
/// - Authenticated → Authenticated (tokens refreshed)
/// - Authenticated → PendingAuth (new login discards the old one)
/// - Authenticated → Anonymous (logout, terminal refresh failure)
///
/// `Anonymous` is never stored: a session entering it loses its entry.
#[derive(Debug, Clone, Default)]
pub enum SessionState {
    #[default]
    Anonymous,
    PendingAuth(AuthRequestContext),
    Authenticated {
        identity: SessionIdentity,
        tokens: TokenSet,
    },
}

impl SessionState {
    /// State label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Anonymous => "anonymous",
            SessionState::PendingAuth(_) => "pending_auth",
            SessionState::Authenticated { .. } => "authenticated",
        }
    }
}

type Slot = Arc<Mutex<SessionState>>;

/// Server-side session state, keyed by `SessionKey`.
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionKey, Slot>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed login, replacing whatever the session held.
    pub async fn put(&self, key: &SessionKey, tokens: TokenSet, identity: SessionIdentity) {
        let mut state = self.lock(key).await;
        *state = SessionState::Authenticated { identity, tokens };
        info!(session = %key, "session authenticated");
    }

    /// Tokens of an authenticated session.
    pub async fn get(&self, key: &SessionKey) -> Option<TokenSet> {
        let state = self.lock_existing(key).await?;
        match &*state {
            SessionState::Authenticated { tokens, .. } => Some(tokens.clone()),
            _ => None,
        }
    }

    /// Identity of an authenticated session.
    pub async fn identity(&self, key: &SessionKey) -> Option<SessionIdentity> {
        let state = self.lock_existing(key).await?;
        match &*state {
            SessionState::Authenticated { identity, .. } => Some(identity.clone()),
            _ => None,
        }
    }

    /// Snapshot of the session's state. Unknown keys are `Anonymous`.
    pub async fn state(&self, key: &SessionKey) -> SessionState {
        match self.lock_existing(key).await {
            Some(state) => state.clone(),
            None => SessionState::Anonymous,
        }
    }

    /// Drop the session and return what it held.
    ///
    /// Waits for any in-flight operation on the session (such as a refresh)
    /// to finish. Callers queued behind it land on a fresh entry.
    pub async fn clear(&self, key: &SessionKey) -> SessionState {
        let Some(mut state) = self.lock_existing(key).await else {
            return SessionState::Anonymous;
        };
        let previous = std::mem::take(&mut *state);
        self.discard(key, &mut state).await;
        debug!(session = %key, previous = previous.label(), "session cleared");
        previous
    }

    /// Number of sessions with an entry.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Lock the session's entry, creating an `Anonymous` one if needed.
    ///
    /// The guard is owned so callers can hold it across awaits (a refresh
    /// round-trip) without borrowing the store. Callers that leave the
    /// session `Anonymous` must `discard` it before releasing the guard.
    pub(crate) async fn lock(&self, key: &SessionKey) -> OwnedMutexGuard<SessionState> {
        loop {
            let slot = match self.existing(key).await {
                Some(slot) => slot,
                None => self
                    .sessions
                    .write()
                    .await
                    .entry(key.clone())
                    .or_default()
                    .clone(),
            };
            let state = slot.clone().lock_owned().await;
            if self.is_current(key, &slot).await {
                return state;
            }
        }
    }

    /// Lock the session's entry without creating one.
    pub(crate) async fn lock_existing(
        &self,
        key: &SessionKey,
    ) -> Option<OwnedMutexGuard<SessionState>> {
        loop {
            let slot = self.existing(key).await?;
            let state = slot.clone().lock_owned().await;
            if self.is_current(key, &slot).await {
                return Some(state);
            }
        }
    }

    /// Reset the locked session to `Anonymous` and remove its entry.
    ///
    /// Anyone waiting on the removed entry retries against the map once the
    /// guard is released.
    pub(crate) async fn discard(
        &self,
        key: &SessionKey,
        state: &mut OwnedMutexGuard<SessionState>,
    ) {
        **state = SessionState::Anonymous;
        let slot = OwnedMutexGuard::mutex(state);
        let mut sessions = self.sessions.write().await;
        if sessions.get(key).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            sessions.remove(key);
        }
    }

    /// Remove pending logins that outlived `ttl`. Entries busy with another
    /// operation are left for the next sweep.
    pub(crate) async fn purge_expired(&self, ttl: Duration) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, slot| match slot.try_lock() {
            Ok(state) => !matches!(
                &*state,
                SessionState::PendingAuth(context) if context.age() >= ttl
            ),
            Err(_) => true,
        });
        before - sessions.len()
    }

    async fn existing(&self, key: &SessionKey) -> Option<Slot> {
        self.sessions.read().await.get(key).cloned()
    }

    async fn is_current(&self, key: &SessionKey, slot: &Slot) -> bool {
        self.sessions
            .read()
            .await
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(access: &str) -> TokenSet {
        TokenSet {
            access_token: access.into(),
            refresh_token: Some(format!("rt_{access}")),
            id_token: Some(format!("id_{access}")),
        }
    }

    fn alice() -> SessionIdentity {
        SessionIdentity {
            sub: Some("sub-alice".into()),
            preferred_username: Some("alice".into()),
            email: None,
        }
    }

    #[test]
    fn session_keys_are_unique_and_display_truncated() {
        let a = SessionKey::generate();
        let b = SessionKey::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        let shown = a.to_string();
        assert!(!shown.contains(a.as_str()));
        assert!(shown.starts_with(&a.as_str()[..8]));
    }

    #[tokio::test]
    async fn unknown_session_is_anonymous_and_not_created() {
        let store = SessionStore::new();
        let key = SessionKey::generate();
        assert!(store.get(&key).await.is_none());
        assert!(store.identity(&key).await.is_none());
        assert!(matches!(store.state(&key).await, SessionState::Anonymous));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn put_then_get_returns_tokens_and_identity() {
        let store = SessionStore::new();
        let key = SessionKey::generate();
        store.put(&key, tokens("at1"), alice()).await;

        assert_eq!(store.get(&key).await, Some(tokens("at1")));
        assert_eq!(store.identity(&key).await, Some(alice()));
        assert_eq!(store.state(&key).await.label(), "authenticated");
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn put_replaces_whole_token_set() {
        let store = SessionStore::new();
        let key = SessionKey::generate();
        store.put(&key, tokens("at1"), alice()).await;
        store
            .put(
                &key,
                TokenSet {
                    access_token: "at2".into(),
                    refresh_token: None,
                    id_token: None,
                },
                SessionIdentity::default(),
            )
            .await;

        let current = store.get(&key).await.unwrap();
        assert_eq!(current.access_token, "at2");
        assert!(current.refresh_token.is_none());
        assert_eq!(store.identity(&key).await, Some(SessionIdentity::default()));
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let store = SessionStore::new();
        let a = SessionKey::generate();
        let b = SessionKey::generate();
        store.put(&a, tokens("at_a"), alice()).await;
        assert!(store.get(&b).await.is_none());
        store.clear(&b).await;
        assert!(store.get(&a).await.is_some());
    }

    #[tokio::test]
    async fn clear_returns_previous_state_and_removes_entry() {
        let store = SessionStore::new();
        let key = SessionKey::generate();
        store.put(&key, tokens("at1"), alice()).await;

        let previous = store.clear(&key).await;
        match previous {
            SessionState::Authenticated { tokens: t, .. } => {
                assert_eq!(t.id_token.as_deref(), Some("id_at1"));
            }
            other => panic!("expected Authenticated, got {}", other.label()),
        }
        assert!(store.get(&key).await.is_none());
        assert!(store.is_empty().await);
        assert!(matches!(store.clear(&key).await, SessionState::Anonymous));
    }

    #[tokio::test]
    async fn clear_waits_for_holder_of_session_lock() {
        let store = Arc::new(SessionStore::new());
        let key = SessionKey::generate();
        store.put(&key, tokens("at1"), alice()).await;

        let guard = store.lock(&key).await;
        let clearing = {
            let store = store.clone();
            let key = key.clone();
            tokio::spawn(async move { store.clear(&key).await })
        };
        tokio::task::yield_now().await;
        assert!(!clearing.is_finished());

        drop(guard);
        let previous = clearing.await.unwrap();
        assert_eq!(previous.label(), "authenticated");
        assert!(store.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn write_queued_behind_clear_lands_on_fresh_entry() {
        let store = Arc::new(SessionStore::new());
        let key = SessionKey::generate();
        store.put(&key, tokens("at1"), alice()).await;

        let held = store.lock(&key).await;
        let clearing = {
            let store = store.clone();
            let key = key.clone();
            tokio::spawn(async move { store.clear(&key).await })
        };
        tokio::task::yield_now().await;
        let relogin = {
            let store = store.clone();
            let key = key.clone();
            tokio::spawn(async move { store.put(&key, tokens("at2"), alice()).await })
        };
        tokio::task::yield_now().await;

        drop(held);
        assert_eq!(clearing.await.unwrap().label(), "authenticated");
        relogin.await.unwrap();

        assert_eq!(store.get(&key).await.map(|t| t.access_token), Some("at2".into()));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn purge_removes_only_expired_pending_logins() {
        let store = SessionStore::new();
        let pending = SessionKey::generate();
        let authenticated = SessionKey::generate();
        let busy = SessionKey::generate();
        *store.lock(&pending).await = SessionState::PendingAuth(AuthRequestContext::generate());
        *store.lock(&busy).await = SessionState::PendingAuth(AuthRequestContext::generate());
        store.put(&authenticated, tokens("at1"), alice()).await;

        assert_eq!(store.purge_expired(Duration::from_secs(600)).await, 0);

        let held = store.lock(&busy).await;
        assert_eq!(store.purge_expired(Duration::ZERO).await, 1);
        drop(held);

        assert_eq!(store.state(&pending).await.label(), "anonymous");
        assert_eq!(store.state(&busy).await.label(), "pending_auth");
        assert!(store.get(&authenticated).await.is_some());
        assert_eq!(store.len().await, 2);
    }
}
