//! Bearer credential extraction and JWT verification

use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, Validation, decode, decode_header};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};
use crate::keys::SigningKeySet;

/// Whether and how the `aud` claim is checked.
///
/// No `Default`: the caller picks one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudiencePolicy {
    /// Accept any audience (or none).
    Unchecked,
    /// Require `aud` to contain at least one of these values.
    Expected(Vec<String>),
}

/// What a token must satisfy besides a valid signature.
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Exact expected `iss`.
    pub issuer: String,
    pub audience: AudiencePolicy,
    /// Algorithms a signing key may use. Keys bound to anything else are
    /// never used to verify.
    pub allowed_algorithms: Vec<Algorithm>,
    /// Clock skew tolerated on `exp` and `nbf`.
    pub leeway: Duration,
}

impl VerifierConfig {
    /// RS256 only, no clock skew.
    pub fn new(issuer: impl Into<String>, audience: AudiencePolicy) -> Self {
        Self {
            issuer: issuer.into(),
            audience,
            allowed_algorithms: vec![Algorithm::RS256],
            leeway: Duration::ZERO,
        }
    }
}

/// Claims of a token whose signature, issuer and lifetime were checked.
///
/// Serializes as the raw claim object.
#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct VerifiedClaims(Map<String, Value>);

impl VerifiedClaims {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn sub(&self) -> Option<&str> {
        self.get_str("sub")
    }

    pub fn preferred_username(&self) -> Option<&str> {
        self.get_str("preferred_username")
    }

    pub fn scope(&self) -> Option<&str> {
        self.get_str("scope")
    }

    /// Keycloak realm roles (`realm_access.roles`); empty when absent.
    pub fn realm_roles(&self) -> Vec<&str> {
        self.0
            .get("realm_access")
            .and_then(|access| access.get("roles"))
            .and_then(Value::as_array)
            .map(|roles| roles.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }

    fn get_str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }
}

/// The token from an `Authorization: Bearer <token>` header value.
///
/// The scheme is matched case-insensitively and must be followed by exactly
/// one space. Anything else, including an empty token or one containing
/// whitespace, is `MissingCredential`.
pub fn extract_bearer(header: Option<&str>) -> Result<&str> {
    let value = header.ok_or_else(|| Error::MissingCredential("no Authorization header".into()))?;
    match value.split_once(' ') {
        Some((scheme, token))
            if scheme.eq_ignore_ascii_case("bearer")
                && !token.is_empty()
                && !token.contains(char::is_whitespace) =>
        {
            Ok(token)
        }
        _ => Err(Error::MissingCredential(
            "Authorization header is not a bearer credential".into(),
        )),
    }
}

/// Verifies bearer JWTs against the provider's signing keys.
pub struct BearerVerifier {
    keys: Arc<SigningKeySet>,
    config: VerifierConfig,
}

impl BearerVerifier {
    pub fn new(keys: Arc<SigningKeySet>, config: VerifierConfig) -> Self {
        Self { keys, config }
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// Verify the credential in an `Authorization` header value.
    pub async fn verify_authorization(&self, header: Option<&str>) -> Result<VerifiedClaims> {
        let token = extract_bearer(header)?;
        self.verify(token).await
    }

    /// Verify a compact JWT.
    #[instrument(skip_all)]
    pub async fn verify(&self, token: &str) -> Result<VerifiedClaims> {
        let header =
            decode_header(token).map_err(|e| Error::invalid(format!("malformed token: {e}")))?;
        let kid = header
            .kid
            .ok_or_else(|| Error::invalid("token header has no kid"))?;

        let key = self.keys.lookup(&kid).await?;

        if header.alg != key.algorithm {
            warn!(kid = %kid, token_alg = ?header.alg, key_alg = ?key.algorithm, "token algorithm does not match key");
            return Err(Error::invalid(format!(
                "token algorithm {:?} does not match key algorithm {:?}",
                header.alg, key.algorithm
            )));
        }
        if !self.config.allowed_algorithms.contains(&key.algorithm) {
            warn!(kid = %kid, alg = ?key.algorithm, "signing key algorithm not allowed");
            return Err(Error::invalid(format!(
                "algorithm {:?} is not allowed",
                key.algorithm
            )));
        }

        let validation = self.validation(key.algorithm);
        let data = decode::<Map<String, Value>>(token, &key.key, &validation).map_err(|e| {
            let err = rejection(&e);
            warn!(kid = %kid, error = %err, "bearer token rejected");
            err
        })?;

        debug!(kid = %kid, "bearer token verified");
        Ok(VerifiedClaims(data.claims))
    }

    fn validation(&self, algorithm: Algorithm) -> Validation {
        let mut validation = Validation::new(algorithm);
        validation.leeway = self.config.leeway.as_secs();
        validation.validate_nbf = true;
        validation.set_issuer(&[self.config.issuer.as_str()]);

        let mut required = vec!["exp", "iss"];
        match &self.config.audience {
            AudiencePolicy::Unchecked => validation.validate_aud = false,
            AudiencePolicy::Expected(audience) => {
                validation.set_audience(audience.as_slice());
                required.push("aud");
            }
        }
        validation.set_required_spec_claims(required.as_slice());
        validation
    }
}

fn rejection(e: &jsonwebtoken::errors::Error) -> Error {
    let reason = match e.kind() {
        ErrorKind::ExpiredSignature => "token expired".to_string(),
        ErrorKind::ImmatureSignature => "token not yet valid".to_string(),
        ErrorKind::InvalidIssuer => "issuer mismatch".to_string(),
        ErrorKind::InvalidAudience => "audience mismatch".to_string(),
        ErrorKind::InvalidSignature => "signature verification failed".to_string(),
        ErrorKind::InvalidAlgorithm => "algorithm not accepted for key".to_string(),
        ErrorKind::MissingRequiredClaim(claim) => format!("missing required claim: {claim}"),
        _ => format!("malformed token: {e}"),
    };
    Error::invalid(reason)
}
