//! Key-set cache for the identity provider's JWKS.
//!
//! # Refresh behaviour
//!
//! - The first lookup fetches the document; failure there is reported to the
//!   caller so the verifier can classify it as a generation error.
//! - A set older than `refresh_interval` is refreshed lazily on the next
//!   lookup, and eagerly by [`KeySetCache::spawn_refresher`].
//! - A lookup for an unknown `kid` triggers one extra refresh, at most once
//!   per `refresh_rate_limit`.
//! - Concurrent refreshes collapse into a single fetch.
//! - A failed refresh keeps serving the previous set and logs a warning.
//! - A lookup that finds the set stale while a refresh is running serves the
//!   stale set instead of queueing behind the fetch.
//! - A failed fetch is remembered for `retry_backoff`; lookups in that window
//!   reuse the failure rather than fetching again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use jsonwebtoken::{
    Algorithm, DecodingKey,
    jwk::{AlgorithmParameters, Jwk, JwkSet},
};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::JwksConfig;

/// Key-set fetch failures.
#[derive(Debug, thiserror::Error)]
pub enum KeySetError {
    /// No JWKS URI configured.
    #[error("JWKS URI is not configured")]
    NotConfigured,

    /// Network or HTTP client error.
    #[error("JWKS fetch error: {0}")]
    Http(#[from] reqwest::Error),

    /// The endpoint answered with a non-success status.
    #[error("JWKS endpoint returned HTTP {0}")]
    Status(u16),

    /// The body is not a JWKS document.
    #[error("malformed JWKS document: {0}")]
    Malformed(String),

    /// The document holds no RSA or EC key with a `kid`.
    #[error("JWKS document contains no usable signing keys")]
    Empty,

    /// A recent fetch failed and the retry backoff has not elapsed.
    #[error("JWKS unavailable after recent failure: {0}")]
    Unavailable(String),
}

/// Key type of a cached public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyFamily {
    /// RSA modulus/exponent
    Rsa,
    /// Elliptic-curve point
    Ec,
}

impl KeyFamily {
    /// Whether a token signed with `alg` can be checked against this key type.
    #[must_use]
    pub fn supports(self, alg: Algorithm) -> bool {
        match self {
            Self::Rsa => matches!(
                alg,
                Algorithm::RS256
                    | Algorithm::RS384
                    | Algorithm::RS512
                    | Algorithm::PS256
                    | Algorithm::PS384
                    | Algorithm::PS512
            ),
            Self::Ec => matches!(alg, Algorithm::ES256 | Algorithm::ES384),
        }
    }
}

/// A public key resolved from the JWKS.
#[derive(Clone)]
pub struct PublicKey {
    /// `kid` of the key
    pub key_id: String,
    /// Key type
    pub family: KeyFamily,
    /// `alg` pinned by the JWK, if any
    pub algorithm: Option<String>,
    decoding: DecodingKey,
}

impl PublicKey {
    /// Key material for signature checks.
    #[must_use]
    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding
    }

    /// Whether this key may verify a token signed with `alg`.
    #[must_use]
    pub fn accepts(&self, alg: Algorithm) -> bool {
        if !self.family.supports(alg) {
            return false;
        }
        match &self.algorithm {
            Some(pinned) => pinned.eq_ignore_ascii_case(&format!("{alg:?}")),
            None => true,
        }
    }

    fn from_jwk(jwk: &Jwk) -> Option<Self> {
        let key_id = jwk.common.key_id.clone()?;
        let (family, decoding) = match &jwk.algorithm {
            AlgorithmParameters::RSA(rsa) => (
                KeyFamily::Rsa,
                DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok()?,
            ),
            AlgorithmParameters::EllipticCurve(ec) => (
                KeyFamily::Ec,
                DecodingKey::from_ec_components(&ec.x, &ec.y).ok()?,
            ),
            // Symmetric and OKP keys never verify ID tokens here
            _ => return None,
        };
        let algorithm = jwk
            .common
            .key_algorithm
            .as_ref()
            .map(|alg| format!("{alg:?}"));
        Some(Self {
            key_id,
            family,
            algorithm,
            decoding,
        })
    }
}

/// One fetched generation of keys.
struct KeySet {
    keys: HashMap<String, PublicKey>,
    refreshed_at: Instant,
}

impl KeySet {
    fn from_jwks(jwks: &JwkSet) -> Result<Self, KeySetError> {
        let mut keys = HashMap::with_capacity(jwks.keys.len());
        for jwk in &jwks.keys {
            match PublicKey::from_jwk(jwk) {
                Some(key) => {
                    keys.insert(key.key_id.clone(), key);
                }
                None => debug!(kid = ?jwk.common.key_id, "Skipping unusable JWK"),
            }
        }
        if keys.is_empty() {
            return Err(KeySetError::Empty);
        }
        Ok(Self {
            keys,
            refreshed_at: Instant::now(),
        })
    }
}

/// Outcome of the last failed fetch, shared with callers inside the backoff.
struct FailedFetch {
    at: Instant,
    reason: String,
}

/// Snapshot of the cache for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct KeySetStatus {
    /// Whether a key set has been loaded
    pub loaded: bool,
    /// Number of usable keys
    pub keys: usize,
    /// Seconds since the last successful fetch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_secs: Option<u64>,
}

/// Cached, self-refreshing view of the provider's signing keys.
pub struct KeySetCache {
    jwks_uri: String,
    http: reqwest::Client,
    refresh_interval: Duration,
    retry_backoff: Duration,
    current: RwLock<Option<Arc<KeySet>>>,
    last_failure: RwLock<Option<FailedFetch>>,
    fetch_lock: Mutex<()>,
    unknown_kid_limiter: Option<DefaultDirectRateLimiter>,
}

impl KeySetCache {
    /// Build an empty cache; nothing is fetched until first use.
    ///
    /// # Errors
    ///
    /// Returns [`KeySetError::Http`] if the HTTP client cannot be built.
    pub fn new(config: &JwksConfig) -> Result<Self, KeySetError> {
        let http = reqwest::Client::builder()
            .https_only(config.require_https)
            .timeout(config.timeout)
            .build()?;

        let unknown_kid_limiter =
            Quota::with_period(config.refresh_rate_limit).map(RateLimiter::direct);

        Ok(Self {
            jwks_uri: config.uri.clone(),
            http,
            refresh_interval: config.refresh_interval,
            retry_backoff: config.retry_backoff,
            current: RwLock::new(None),
            last_failure: RwLock::new(None),
            fetch_lock: Mutex::new(()),
            unknown_kid_limiter,
        })
    }

    /// Build a cache pre-populated with `jwks`.
    ///
    /// # Errors
    ///
    /// Returns [`KeySetError::Empty`] if `jwks` has no usable key.
    pub fn with_key_set(config: &JwksConfig, jwks: &JwkSet) -> Result<Self, KeySetError> {
        let cache = Self::new(config)?;
        *cache.current.write() = Some(Arc::new(KeySet::from_jwks(jwks)?));
        Ok(cache)
    }

    /// Make sure a key set is available, fetching it if none is cached.
    ///
    /// # Errors
    ///
    /// Returns the fetch error when no set is cached and the fetch fails.
    pub async fn ensure_loaded(&self) -> Result<(), KeySetError> {
        self.current_or_fetch().await.map(|_| ())
    }

    /// Resolve `kid` to a public key.
    ///
    /// `Ok(None)` means the key set is available but does not contain `kid`,
    /// even after any permitted refresh.
    ///
    /// # Errors
    ///
    /// Returns an error only when no key set could be obtained at all.
    pub async fn get(&self, kid: &str) -> Result<Option<PublicKey>, KeySetError> {
        let set = self.current_or_fetch().await?;
        if let Some(key) = set.keys.get(kid) {
            return Ok(Some(key.clone()));
        }

        if !self.allow_unknown_kid_refresh() {
            debug!(kid, "Unknown kid; refresh rate limited");
            return Ok(None);
        }

        debug!(kid, "Unknown kid; refreshing JWKS");
        match self.refresh_set().await {
            Ok(set) => Ok(set.keys.get(kid).cloned()),
            Err(e) => {
                warn!(kid, error = %e, "JWKS refresh for unknown kid failed");
                Ok(None)
            }
        }
    }

    /// Fetch the document now and replace the cached set.
    ///
    /// Callers that arrive while a fetch is running wait for it and share its
    /// result instead of fetching again. Within `retry_backoff` of a failed
    /// fetch the failure is returned without contacting the endpoint.
    ///
    /// # Errors
    ///
    /// Returns the fetch error, or [`KeySetError::Unavailable`] inside the
    /// backoff; the previous set stays cached.
    pub async fn refresh(&self) -> Result<(), KeySetError> {
        self.refresh_set().await.map(|_| ())
    }

    /// Current cache state.
    #[must_use]
    pub fn status(&self) -> KeySetStatus {
        match self.current.read().as_ref() {
            Some(set) => KeySetStatus {
                loaded: true,
                keys: set.keys.len(),
                age_secs: Some(set.refreshed_at.elapsed().as_secs()),
            },
            None => KeySetStatus {
                loaded: false,
                keys: 0,
                age_secs: None,
            },
        }
    }

    /// Refresh the set every `refresh_interval` until `shutdown` fires.
    ///
    /// Errors are logged and the previous set stays in use.
    pub fn spawn_refresher(
        self: &Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cache.refresh_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = cache.refresh().await {
                            warn!(uri = %cache.jwks_uri, error = %e, "Scheduled JWKS refresh failed");
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("JWKS refresher stopping");
                        break;
                    }
                }
            }
        })
    }

    fn allow_unknown_kid_refresh(&self) -> bool {
        self.unknown_kid_limiter
            .as_ref()
            .is_none_or(|limiter| limiter.check().is_ok())
    }

    async fn current_or_fetch(&self) -> Result<Arc<KeySet>, KeySetError> {
        let cached = self.current.read().clone();
        match cached {
            Some(set) if set.refreshed_at.elapsed() < self.refresh_interval => Ok(set),
            Some(stale) => {
                let requested_at = Instant::now();
                let Ok(guard) = self.fetch_lock.try_lock() else {
                    debug!("JWKS refresh in progress; serving previous key set");
                    return Ok(stale);
                };
                match self.refresh_locked(requested_at, guard).await {
                    Ok(fresh) => Ok(fresh),
                    Err(KeySetError::Unavailable(reason)) => {
                        debug!(%reason, "JWKS in retry backoff; serving previous key set");
                        Ok(stale)
                    }
                    Err(e) => {
                        warn!(error = %e, "JWKS refresh failed; serving previous key set");
                        Ok(stale)
                    }
                }
            }
            None => self.refresh_set().await,
        }
    }

    async fn refresh_set(&self) -> Result<Arc<KeySet>, KeySetError> {
        let requested_at = Instant::now();
        let guard = self.fetch_lock.lock().await;
        self.refresh_locked(requested_at, guard).await
    }

    /// Fetch while holding `fetch_lock`, unless another caller already
    /// settled the outcome after `requested_at`.
    async fn refresh_locked(
        &self,
        requested_at: Instant,
        _guard: MutexGuard<'_, ()>,
    ) -> Result<Arc<KeySet>, KeySetError> {
        // Someone else fetched while we waited for the lock.
        let fetched_meanwhile = self
            .current
            .read()
            .as_ref()
            .filter(|set| set.refreshed_at >= requested_at)
            .cloned();
        if let Some(set) = fetched_meanwhile {
            return Ok(set);
        }

        let recent_failure = self
            .last_failure
            .read()
            .as_ref()
            .filter(|failure| {
                failure.at >= requested_at || failure.at.elapsed() < self.retry_backoff
            })
            .map(|failure| failure.reason.clone());
        if let Some(reason) = recent_failure {
            return Err(KeySetError::Unavailable(reason));
        }

        match self.fetch().await {
            Ok(set) => {
                let set = Arc::new(set);
                info!(uri = %self.jwks_uri, keys = set.keys.len(), "JWKS refreshed");
                *self.last_failure.write() = None;
                *self.current.write() = Some(Arc::clone(&set));
                Ok(set)
            }
            Err(e) => {
                *self.last_failure.write() = Some(FailedFetch {
                    at: Instant::now(),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn fetch(&self) -> Result<KeySet, KeySetError> {
        if self.jwks_uri.is_empty() {
            return Err(KeySetError::NotConfigured);
        }

        debug!(uri = %self.jwks_uri, "Fetching JWKS");
        let response = self.http.get(&self.jwks_uri).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(KeySetError::Status(status.as_u16()));
        }

        let body = response.bytes().await?;
        let jwks: JwkSet =
            serde_json::from_slice(&body).map_err(|e| KeySetError::Malformed(e.to_string()))?;
        KeySet::from_jwks(&jwks)
    }
}
