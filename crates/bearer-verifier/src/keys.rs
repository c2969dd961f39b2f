//! Signing key discovery and caching
//!
//! `KeySource` fetches the provider's JWKS; `SigningKeySet` caches the usable
//! signature keys by `kid`. Lookups read an `Arc` snapshot under a short read
//! lock. A miss takes the refresh mutex, refetches at most once per
//! `min_refresh_interval`, and swaps in the new snapshot, so a token signed
//! with a freshly rotated key verifies after one fetch while a flood of
//! tokens with made-up `kid`s cannot turn into a flood of JWKS requests.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::jwk::{AlgorithmParameters, EllipticCurve, Jwk, KeyAlgorithm, PublicKeyUse};
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Misses within this long of the previous fetch do not refetch.
pub const DEFAULT_MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Bound on one JWKS request.
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Where signing keys come from.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn KeySource>`).
pub trait KeySource: Send + Sync {
    /// Fetch the current key set. Keys that cannot be parsed are skipped;
    /// an unreachable or unparsable set is `KeySetUnavailable`.
    fn fetch(&self) -> Pin<Box<dyn Future<Output = Result<Vec<Jwk>>> + Send + '_>>;
}

/// JWKS document with keys left unparsed, so one exotic key does not make
/// the whole set unusable.
#[derive(Deserialize)]
struct RawKeySet {
    keys: Vec<serde_json::Value>,
}

/// Parse a JWKS document, skipping keys `jsonwebtoken` cannot represent.
pub fn parse_key_set(body: &[u8]) -> Result<Vec<Jwk>> {
    let raw: RawKeySet = serde_json::from_slice(body)
        .map_err(|e| Error::KeySetUnavailable(format!("malformed JWKS document: {e}")))?;
    Ok(raw
        .keys
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<Jwk>(value) {
            Ok(jwk) => Some(jwk),
            Err(e) => {
                debug!(error = %e, "skipping unparsable JWK");
                None
            }
        })
        .collect())
}

/// Fetches keys from a JWKS URI over HTTP.
pub struct HttpKeySource {
    http: reqwest::Client,
    jwks_uri: String,
    timeout: Duration,
}

impl HttpKeySource {
    pub fn new(http: reqwest::Client, jwks_uri: impl Into<String>) -> Self {
        Self {
            http,
            jwks_uri: jwks_uri.into(),
            timeout: FETCH_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn fetch_keys(&self) -> Result<Vec<Jwk>> {
        let response = self
            .http
            .get(&self.jwks_uri)
            .header("accept", "application/json")
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::KeySetUnavailable(format!("JWKS request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::KeySetUnavailable(format!(
                "JWKS endpoint returned {status}"
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::KeySetUnavailable(format!("JWKS body read failed: {e}")))?;
        parse_key_set(&body)
    }
}

impl KeySource for HttpKeySource {
    fn fetch(&self) -> Pin<Box<dyn Future<Output = Result<Vec<Jwk>>> + Send + '_>> {
        Box::pin(self.fetch_keys())
    }
}

/// A verification key with the one algorithm it may be used with.
#[derive(Clone)]
pub struct SigningKey {
    pub kid: String,
    pub algorithm: Algorithm,
    pub key: DecodingKey,
}

impl SigningKey {
    /// Resolve a JWK into a signing key.
    ///
    /// `None` for keys without a `kid`, encryption keys, and keys whose
    /// algorithm is neither stated nor inferable from the key family.
    pub fn from_jwk(jwk: &Jwk) -> Option<Self> {
        let kid = jwk.common.key_id.clone()?;
        if let Some(PublicKeyUse::Encryption) = jwk.common.public_key_use {
            return None;
        }
        let algorithm = match &jwk.common.key_algorithm {
            Some(stated) => signature_algorithm(stated)?,
            None => infer_algorithm(&jwk.algorithm)?,
        };
        match DecodingKey::from_jwk(jwk) {
            Ok(key) => Some(Self {
                kid,
                algorithm,
                key,
            }),
            Err(e) => {
                debug!(kid = %kid, error = %e, "skipping JWK with unusable key material");
                None
            }
        }
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

fn signature_algorithm(alg: &KeyAlgorithm) -> Option<Algorithm> {
    match alg {
        KeyAlgorithm::HS256 => Some(Algorithm::HS256),
        KeyAlgorithm::HS384 => Some(Algorithm::HS384),
        KeyAlgorithm::HS512 => Some(Algorithm::HS512),
        KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
        // Key-management algorithms (RSA-OAEP and friends)
        _ => None,
    }
}

fn infer_algorithm(params: &AlgorithmParameters) -> Option<Algorithm> {
    match params {
        AlgorithmParameters::RSA(_) => Some(Algorithm::RS256),
        AlgorithmParameters::EllipticCurve(ec) => match ec.curve {
            EllipticCurve::P256 => Some(Algorithm::ES256),
            EllipticCurve::P384 => Some(Algorithm::ES384),
            _ => None,
        },
        AlgorithmParameters::OctetKeyPair(okp) => match okp.curve {
            EllipticCurve::Ed25519 => Some(Algorithm::EdDSA),
            _ => None,
        },
        // Symmetric keys must state their algorithm.
        AlgorithmParameters::OctetKey(_) => None,
    }
}

/// Outcome of the most recent fetch, for debouncing.
#[derive(Clone, Copy)]
struct LastFetch {
    at: Instant,
    succeeded: bool,
}

type KeyMap = HashMap<String, Arc<SigningKey>>;

/// Cached signing keys, refreshed on unknown `kid`.
pub struct SigningKeySet {
    source: Arc<dyn KeySource>,
    keys: RwLock<Arc<KeyMap>>,
    last_fetch: Mutex<Option<LastFetch>>,
    min_refresh_interval: Duration,
}

impl SigningKeySet {
    pub fn new(source: Arc<dyn KeySource>) -> Self {
        Self {
            source,
            keys: RwLock::new(Arc::new(HashMap::new())),
            last_fetch: Mutex::new(None),
            min_refresh_interval: DEFAULT_MIN_REFRESH_INTERVAL,
        }
    }

    pub fn with_min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    /// Fetch the key set now, ignoring the debounce. Returns the number of
    /// usable keys.
    pub async fn prime(&self) -> Result<usize> {
        let mut last_fetch = self.last_fetch.lock().await;
        let keys = self.refetch(&mut last_fetch).await?;
        Ok(keys.len())
    }

    /// Signing key for `kid`, refetching the key set once on a miss.
    ///
    /// - known `kid` → the cached key, no I/O
    /// - unknown `kid`, fetch allowed → refetch; `UnknownSigningKey` if the
    ///   fresh set lacks it too
    /// - unknown `kid` within the debounce window → `UnknownSigningKey`
    ///   without fetching (`KeySetUnavailable` if that fetch failed)
    /// - fetch fails → `KeySetUnavailable`
    pub async fn lookup(&self, kid: &str) -> Result<Arc<SigningKey>> {
        if let Some(key) = self.snapshot().await.get(kid) {
            return Ok(key.clone());
        }

        let mut last_fetch = self.last_fetch.lock().await;

        // Another caller may have refetched while we waited for the mutex.
        if let Some(key) = self.snapshot().await.get(kid) {
            return Ok(key.clone());
        }

        if let Some(previous) = *last_fetch {
            if previous.at.elapsed() < self.min_refresh_interval {
                debug!(kid, "unknown kid within refetch interval, not fetching");
                return Err(if previous.succeeded {
                    Error::UnknownSigningKey(kid.to_string())
                } else {
                    Error::KeySetUnavailable("recent JWKS fetch failed".into())
                });
            }
        }

        info!(kid, "unknown kid, refetching signing keys");
        let keys = self.refetch(&mut last_fetch).await?;
        keys.get(kid)
            .cloned()
            .ok_or_else(|| Error::UnknownSigningKey(kid.to_string()))
    }

    /// Number of cached keys.
    pub async fn len(&self) -> usize {
        self.snapshot().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.snapshot().await.is_empty()
    }

    async fn snapshot(&self) -> Arc<KeyMap> {
        self.keys.read().await.clone()
    }

    /// Fetch and swap in a new snapshot. Caller holds the refresh mutex.
    async fn refetch(&self, last_fetch: &mut Option<LastFetch>) -> Result<Arc<KeyMap>> {
        let result = self.source.fetch().await;
        *last_fetch = Some(LastFetch {
            at: Instant::now(),
            succeeded: result.is_ok(),
        });

        let jwks = match result {
            Ok(jwks) => jwks,
            Err(e) => {
                warn!(error = %e, "signing key fetch failed");
                record_fetch("error");
                return Err(e);
            }
        };

        let keys: KeyMap = jwks
            .iter()
            .filter_map(SigningKey::from_jwk)
            .map(|key| (key.kid.clone(), Arc::new(key)))
            .collect();
        let keys = Arc::new(keys);
        *self.keys.write().await = keys.clone();
        record_fetch("success");
        info!(keys = keys.len(), "signing keys refreshed");
        Ok(keys)
    }
}

fn record_fetch(outcome: &'static str) {
    metrics::counter!("jwks_fetch_total", "outcome" => outcome).increment(1);
}
