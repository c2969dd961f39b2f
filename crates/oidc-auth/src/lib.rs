//! OpenID Connect client-side primitives
//!
//! Provides PKCE generation, the per-attempt authorization request context,
//! authorization URL construction, token endpoint exchange/refresh, and the
//! low-trust local decode of token claims. This crate holds no session
//! state; `oidc-session` owns the per-browser state machine built on top.
//!
//! Login flow:
//! 1. `AuthRequestContext::generate()` creates state, nonce and PKCE verifier
//! 2. User is redirected to `build_authorization_url()`
//! 3. Callback hands the code to `TokenClient::exchange_code()`
//! 4. `SessionIdentity::from_id_token()` extracts who logged in
//! 5. `TokenClient::exchange_refresh()` renews the access token on demand

pub mod claims;
pub mod endpoints;
pub mod error;
pub mod pkce;
pub mod request;
pub mod token;

pub use claims::{SessionIdentity, UnverifiedClaims};
pub use endpoints::{ClientSettings, ProviderEndpoints};
pub use error::{Error, Result};
pub use pkce::{PkcePair, compute_challenge, generate_verifier};
pub use request::{AuthRequestContext, build_authorization_url};
pub use token::{TokenClient, TokenResponse, TokenSet};
