//! Bearer token verification for resource servers
//!
//! Verifies `Authorization: Bearer <jwt>` credentials against the identity
//! provider's published signing keys. Keys are fetched from the JWKS
//! endpoint through a `KeySource` and cached in a `SigningKeySet`; a token
//! signed with an unknown key triggers one debounced refetch, which is how
//! key rotation is picked up. There is no background refresh.
//!
//! Verification order, terminal on the first failure:
//! 1. Extract the bearer credential (`MissingCredential`)
//! 2. Resolve the header `kid` to a signing key (`UnknownSigningKey`,
//!    `KeySetUnavailable`)
//! 3. Check the header `alg` against the key and the allow-list
//! 4. Check signature, issuer, expiry and audience (`InvalidToken`)

pub mod error;
pub mod keys;
pub mod verifier;

pub use error::{Error, Result};
pub use jsonwebtoken::Algorithm;
pub use keys::{
    DEFAULT_MIN_REFRESH_INTERVAL, HttpKeySource, KeySource, SigningKey, SigningKeySet,
    parse_key_set,
};
pub use verifier::{AudiencePolicy, BearerVerifier, VerifiedClaims, VerifierConfig, extract_bearer};
