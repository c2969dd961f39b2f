//! Local, signature-unchecked reading of token claims
//!
//! `UnverifiedClaims` is a liveness and display aid for tokens this process
//! already holds (it answers "is my access token about to expire?" and "who
//! did the ID token say logged in?"). It must never back an authorization
//! decision; tokens presented to a resource server go through
//! `bearer_verifier::BearerVerifier`, which returns a different type.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Payload of a JWT decoded without checking its signature.
#[derive(Debug, Clone)]
pub struct UnverifiedClaims(Map<String, Value>);

impl UnverifiedClaims {
    /// Decode the payload segment of a compact JWT.
    ///
    /// Fails with `Input` when the token does not have three segments or the
    /// payload is not a base64url-encoded JSON object.
    pub fn decode(token: &str) -> Result<Self> {
        let mut segments = token.split('.');
        let (Some(_header), Some(payload), Some(_signature), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(Error::Input("token is not a three-segment JWT".into()));
        };

        // Some issuers pad their segments even though RFC 7515 forbids it.
        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|e| Error::Input(format!("token payload is not base64url: {e}")))?;
        let claims: Map<String, Value> = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Input(format!("token payload is not a JSON object: {e}")))?;
        Ok(Self(claims))
    }

    /// `exp` as unix seconds. `None` when absent or not a number.
    pub fn expires_at(&self) -> Option<i64> {
        match self.0.get("exp")? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            _ => None,
        }
    }

    /// Whether the token expires within `leeway_secs` of `now`.
    ///
    /// A missing or malformed `exp` counts as expiring.
    pub fn is_expiring(&self, now: i64, leeway_secs: i64) -> bool {
        match self.expires_at() {
            Some(exp) => now.saturating_add(leeway_secs) >= exp,
            None => true,
        }
    }

    /// String-valued claim.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }
}

/// Who logged in, as stated by the ID token at login time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub sub: Option<String>,
    pub preferred_username: Option<String>,
    pub email: Option<String>,
}

impl SessionIdentity {
    /// Identity from already-decoded ID token claims.
    pub fn from_claims(claims: &UnverifiedClaims) -> Self {
        Self {
            sub: claims.get_str("sub").map(str::to_owned),
            preferred_username: claims.get_str("preferred_username").map(str::to_owned),
            email: claims.get_str("email").map(str::to_owned),
        }
    }

    /// Identity from a raw ID token.
    pub fn from_id_token(id_token: &str) -> Result<Self> {
        UnverifiedClaims::decode(id_token).map(|claims| Self::from_claims(&claims))
    }
}

/// Current unix time in seconds.
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn token_with(payload: Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(payload.to_string());
        format!("{header}.{body}.c2lnbmF0dXJl")
    }

    #[test]
    fn decodes_payload_without_checking_signature() {
        let token = token_with(json!({"sub":"user-1","exp":1_900_000_000}));
        let claims = UnverifiedClaims::decode(&token).unwrap();
        assert_eq!(claims.get_str("sub"), Some("user-1"));
        assert_eq!(claims.expires_at(), Some(1_900_000_000));
    }

    #[test]
    fn float_exp_is_accepted() {
        let token = token_with(json!({"exp": 1_900_000_000.5}));
        let claims = UnverifiedClaims::decode(&token).unwrap();
        assert_eq!(claims.expires_at(), Some(1_900_000_000));
    }

    #[test]
    fn expiring_within_leeway() {
        let now = 1_000_000;
        let claims = UnverifiedClaims::decode(&token_with(json!({"exp": now + 10}))).unwrap();
        assert!(claims.is_expiring(now, 30));
        assert!(!claims.is_expiring(now, 5));
    }

    #[test]
    fn exp_equal_to_now_plus_leeway_is_expiring() {
        let now = 1_000_000;
        let claims = UnverifiedClaims::decode(&token_with(json!({"exp": now + 30}))).unwrap();
        assert!(claims.is_expiring(now, 30));
    }

    #[test]
    fn missing_or_malformed_exp_is_expiring() {
        let missing = UnverifiedClaims::decode(&token_with(json!({"sub":"x"}))).unwrap();
        assert!(missing.is_expiring(0, 0));

        let string = UnverifiedClaims::decode(&token_with(json!({"exp":"tomorrow"}))).unwrap();
        assert_eq!(string.expires_at(), None);
        assert!(string.is_expiring(0, 0));
    }

    #[test]
    fn rejects_non_jwt_input() {
        assert!(UnverifiedClaims::decode("opaque-access-token").is_err());
        assert!(UnverifiedClaims::decode("a.b").is_err());
        assert!(UnverifiedClaims::decode("a.b.c.d").is_err());
        assert!(UnverifiedClaims::decode("a.!!!.c").is_err());

        let not_object = format!("h.{}.s", URL_SAFE_NO_PAD.encode("[1,2,3]"));
        assert!(UnverifiedClaims::decode(&not_object).is_err());
    }

    #[test]
    fn identity_from_id_token() {
        let token = token_with(json!({
            "sub": "f3b1",
            "preferred_username": "alice",
            "email": "alice@example.com",
            "nonce": "n-1"
        }));
        let identity = SessionIdentity::from_id_token(&token).unwrap();
        assert_eq!(identity.sub.as_deref(), Some("f3b1"));
        assert_eq!(identity.preferred_username.as_deref(), Some("alice"));
        assert_eq!(identity.email.as_deref(), Some("alice@example.com"));
    }

    #[test]
    fn identity_tolerates_missing_claims() {
        let token = token_with(json!({"sub": "only-sub"}));
        let identity = SessionIdentity::from_id_token(&token).unwrap();
        assert_eq!(identity.sub.as_deref(), Some("only-sub"));
        assert!(identity.email.is_none());
    }
}
