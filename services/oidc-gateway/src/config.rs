//! Configuration types and loading
//!
//! Config precedence: env vars > config file > defaults. The four
//! deployment variables `KC_BASE`, `REALM`, `CLIENT_ID` and `REDIRECT_URI`
//! override their `[provider]` counterparts. The client secret is loaded
//! from `OIDC_CLIENT_SECRET` or `client_secret_file`, never from the TOML
//! itself.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use bearer_verifier::{Algorithm, AudiencePolicy};
use common::Secret;
use oidc_auth::endpoints::{DEFAULT_SCOPES, DEFAULT_TIMEOUT};
use oidc_auth::{ClientSettings, ProviderEndpoints};
use serde::Deserialize;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub provider: ProviderConfig,
    #[serde(default)]
    pub client: ClientConfig,
    pub resource: ResourceConfig,
}

/// Identity provider and client registration
#[derive(Debug, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub realm: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub redirect_uri: String,
    #[serde(default = "default_scopes")]
    pub scopes: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Path to a file holding the client secret (confidential clients only)
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
    /// Overrides for providers that do not follow the Keycloak layout
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub authorization_endpoint: Option<String>,
    #[serde(default)]
    pub token_endpoint: Option<String>,
    #[serde(default)]
    pub jwks_uri: Option<String>,
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
}

/// Browser-facing listener
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_client_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_refresh_leeway")]
    pub refresh_leeway_secs: u64,
    #[serde(default = "default_pending_flow_ttl")]
    pub pending_flow_ttl_secs: u64,
    #[serde(default)]
    pub secure_cookies: bool,
}

/// Bearer-protected resource listener
#[derive(Debug, Deserialize)]
pub struct ResourceConfig {
    #[serde(default = "default_resource_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_algorithms")]
    pub allowed_algorithms: Vec<String>,
    #[serde(default)]
    pub clock_skew_secs: u64,
    #[serde(default = "default_jwks_min_refresh")]
    pub jwks_min_refresh_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// No default: every deployment must decide whether `aud` is checked.
    pub audience: AudienceConfig,
}

#[derive(Debug, Deserialize)]
pub struct AudienceConfig {
    pub verify: bool,
    #[serde(default)]
    pub expected: Vec<String>,
}

fn default_scopes() -> String {
    DEFAULT_SCOPES.to_string()
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT.as_secs()
}

fn default_client_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5000))
}

fn default_resource_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8000))
}

fn default_refresh_leeway() -> u64 {
    30
}

fn default_pending_flow_ttl() -> u64 {
    600
}

fn default_algorithms() -> Vec<String> {
    vec!["RS256".to_string()]
}

fn default_jwks_min_refresh() -> u64 {
    30
}

fn default_max_connections() -> usize {
    1000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_client_addr(),
            refresh_leeway_secs: default_refresh_leeway(),
            pending_flow_ttl_secs: default_pending_flow_ttl(),
            secure_cookies: false,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Client secret resolution order:
    /// 1. OIDC_CLIENT_SECRET env var
    /// 2. client_secret_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        config.apply_env()?;
        config.validate()?;

        if let Ok(secret) = std::env::var("OIDC_CLIENT_SECRET") {
            config.provider.client_secret = Some(Secret::new(secret));
        } else if let Some(ref secret_file) = config.provider.client_secret_file {
            config.provider.client_secret = Secret::from_file(secret_file)?;
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("oidc-gateway.toml")
    }

    fn apply_env(&mut self) -> common::Result<()> {
        let provider = &mut self.provider;
        for (name, field) in [
            ("KC_BASE", &mut provider.base_url),
            ("REALM", &mut provider.realm),
            ("CLIENT_ID", &mut provider.client_id),
            ("REDIRECT_URI", &mut provider.redirect_uri),
        ] {
            match std::env::var(name) {
                Ok(value) if value.trim().is_empty() => {
                    return Err(common::Error::Env {
                        name: name.to_string(),
                        reason: "must not be empty".into(),
                    });
                }
                Ok(value) => *field = value,
                Err(std::env::VarError::NotPresent) => {}
                Err(e) => {
                    return Err(common::Error::Env {
                        name: name.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn validate(&self) -> common::Result<()> {
        let provider = &self.provider;
        if provider.issuer.is_none() {
            require("base_url (or KC_BASE)", &provider.base_url)?;
            require("realm (or REALM)", &provider.realm)?;
            require_http("base_url", &provider.base_url)?;
        }
        require("client_id (or CLIENT_ID)", &provider.client_id)?;
        require("redirect_uri (or REDIRECT_URI)", &provider.redirect_uri)?;
        require_http("redirect_uri", &provider.redirect_uri)?;
        for (name, value) in [
            ("issuer", &provider.issuer),
            ("authorization_endpoint", &provider.authorization_endpoint),
            ("token_endpoint", &provider.token_endpoint),
            ("jwks_uri", &provider.jwks_uri),
            ("end_session_endpoint", &provider.end_session_endpoint),
        ] {
            if let Some(url) = value {
                require_http(name, url)?;
            }
        }

        if provider.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if self.resource.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        let audience = &self.resource.audience;
        if audience.verify && audience.expected.iter().all(|a| a.trim().is_empty()) {
            return Err(common::Error::Config(
                "[resource.audience] verify = true requires a non-empty expected list".into(),
            ));
        }

        self.resource.algorithms()?;
        Ok(())
    }
}

impl ProviderConfig {
    /// Provider endpoints: derived from the issuer (or base URL and realm)
    /// with any per-endpoint overrides applied.
    pub fn endpoints(&self) -> ProviderEndpoints {
        let mut endpoints = match &self.issuer {
            Some(issuer) => ProviderEndpoints::from_issuer(issuer),
            None => ProviderEndpoints::keycloak(&self.base_url, &self.realm),
        };
        if let Some(url) = &self.authorization_endpoint {
            endpoints.authorization = url.clone();
        }
        if let Some(url) = &self.token_endpoint {
            endpoints.token = url.clone();
        }
        if let Some(url) = &self.jwks_uri {
            endpoints.jwks = url.clone();
        }
        if let Some(url) = &self.end_session_endpoint {
            endpoints.end_session = url.clone();
        }
        endpoints
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            redirect_uri: self.redirect_uri.clone(),
            scopes: self.scopes.clone(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ResourceConfig {
    /// Parsed `allowed_algorithms`. Must name at least one signature
    /// algorithm.
    pub fn algorithms(&self) -> common::Result<Vec<Algorithm>> {
        if self.allowed_algorithms.is_empty() {
            return Err(common::Error::Config(
                "allowed_algorithms must not be empty".into(),
            ));
        }
        self.allowed_algorithms
            .iter()
            .map(|name| {
                Algorithm::from_str(name).map_err(|_| {
                    common::Error::Config(format!("unknown signature algorithm: {name}"))
                })
            })
            .collect()
    }

    pub fn audience_policy(&self) -> AudiencePolicy {
        if self.audience.verify {
            AudiencePolicy::Expected(self.audience.expected.clone())
        } else {
            AudiencePolicy::Unchecked
        }
    }
}

fn require(name: &str, value: &str) -> common::Result<()> {
    if value.trim().is_empty() {
        return Err(common::Error::Config(format!("{name} must be set")));
    }
    Ok(())
}

fn require_http(name: &str, value: &str) -> common::Result<()> {
    if !value.starts_with("http://") && !value.starts_with("https://") {
        return Err(common::Error::Config(format!(
            "{name} must start with http:// or https://, got: {value}"
        )));
    }
    Ok(())
}
