//! Per-browser-session OpenID Connect state
//!
//! Owns the session state machine that sits on top of `oidc-auth`: the CSRF
//! state guard that brackets each authorization attempt, the token store
//! keyed by session, and the expiry/refresh policy consulted on every
//! authenticated request.
//!
//! Session lifecycle:
//! 1. `StateGuard::begin()` → `PendingAuth` with fresh state, nonce, verifier
//! 2. Callback → `StateGuard::validate()` consumes the pending context
//! 3. Code exchanged, `SessionStore::put()` → `Authenticated`
//! 4. Each request → `RefreshPolicy::ensure_fresh()` refreshes near expiry
//! 5. Logout or terminal refresh failure → `Anonymous`

pub mod error;
pub mod guard;
pub mod refresh;
pub mod store;

pub use error::{Error, Result};
pub use guard::{DEFAULT_PENDING_TTL, StateGuard, check_nonce};
pub use refresh::{DEFAULT_LEEWAY, RefreshPolicy, needs_refresh};
pub use store::{SessionKey, SessionState, SessionStore};
