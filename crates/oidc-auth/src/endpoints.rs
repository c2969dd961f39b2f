//! Identity provider endpoints and client registration settings
//!
//! Endpoints follow the Keycloak realm layout: the issuer is
//! `{base}/realms/{realm}` and every OpenID Connect endpoint lives under
//! `{issuer}/protocol/openid-connect/`. Each endpoint can be overridden
//! individually for providers that use a different layout.

use std::time::Duration;

use common::Secret;

/// Scopes requested when the configuration does not name any.
/// `openid` is what makes the provider issue an ID token.
pub const DEFAULT_SCOPES: &str = "openid profile email";

/// Bound on every call to the identity provider.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// The only PKCE method this client offers.
pub const CODE_CHALLENGE_METHOD: &str = "S256";

/// Absolute URLs of the provider endpoints used by the flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEndpoints {
    /// Expected `iss` claim of every token this provider issues.
    pub issuer: String,
    pub authorization: String,
    pub token: String,
    pub jwks: String,
    pub end_session: String,
}

impl ProviderEndpoints {
    /// Endpoints for a Keycloak realm served from `base_url`.
    pub fn keycloak(base_url: &str, realm: &str) -> Self {
        Self::from_issuer(&format!("{}/realms/{realm}", base_url.trim_end_matches('/')))
    }

    /// Derive all endpoints from an issuer using the Keycloak path layout.
    pub fn from_issuer(issuer: &str) -> Self {
        let issuer = issuer.trim_end_matches('/').to_string();
        let base = format!("{issuer}/protocol/openid-connect");
        Self {
            authorization: format!("{base}/auth"),
            token: format!("{base}/token"),
            jwks: format!("{base}/certs"),
            end_session: format!("{base}/logout"),
            issuer,
        }
    }
}

/// Registration of this application with the identity provider.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub client_id: String,
    /// Only set for confidential clients; public clients rely on PKCE alone.
    pub client_secret: Option<Secret<String>>,
    pub redirect_uri: String,
    pub scopes: String,
}

impl ClientSettings {
    /// Public client settings with the default scopes.
    pub fn public(client_id: impl Into<String>, redirect_uri: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: None,
            redirect_uri: redirect_uri.into(),
            scopes: DEFAULT_SCOPES.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keycloak_layout() {
        let endpoints = ProviderEndpoints::keycloak("http://localhost:8080/", "demo");
        assert_eq!(endpoints.issuer, "http://localhost:8080/realms/demo");
        assert_eq!(
            endpoints.authorization,
            "http://localhost:8080/realms/demo/protocol/openid-connect/auth"
        );
        assert_eq!(
            endpoints.token,
            "http://localhost:8080/realms/demo/protocol/openid-connect/token"
        );
        assert_eq!(
            endpoints.jwks,
            "http://localhost:8080/realms/demo/protocol/openid-connect/certs"
        );
        assert_eq!(
            endpoints.end_session,
            "http://localhost:8080/realms/demo/protocol/openid-connect/logout"
        );
    }

    #[test]
    fn issuer_trailing_slash_is_trimmed() {
        let endpoints = ProviderEndpoints::from_issuer("https://sso.example.com/realms/acme/");
        assert_eq!(endpoints.issuer, "https://sso.example.com/realms/acme");
        assert!(!endpoints.token.contains("//protocol"));
    }

    #[test]
    fn public_client_has_no_secret() {
        let client = ClientSettings::public("test-client", "http://localhost:5000/callback");
        assert!(client.client_secret.is_none());
        assert_eq!(client.scopes, DEFAULT_SCOPES);
    }
}
