use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::DecodingKey;
use tokio::sync::RwLock;

use crate::error::AuthlyError;

/// How long a fetched key set is served before it is considered stale.
const JWKS_CACHE_TTL: Duration = Duration::from_secs(300);

enum KeySource {
    Remote { url: String, http: reqwest::Client },
    Static(Arc<JwkSet>),
}

struct CachedJwks {
    fetched_at: Instant,
    jwks: Arc<JwkSet>,
}

/// Resolves the verification key for a token header.
///
/// Either backed by a remote JWKS endpoint (fetched lazily, cached per
/// resolver instance, refetched once when an unknown `kid` shows up so key
/// rotation is picked up promptly) or by an injected static key set.
pub struct KeyResolver {
    source: KeySource,
    cache: RwLock<Option<CachedJwks>>,
}

impl KeyResolver {
    /// Resolver backed by a remote JWKS URL.
    pub fn remote(url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            source: KeySource::Remote {
                url: url.into(),
                http,
            },
            cache: RwLock::new(None),
        }
    }

    /// Resolver over a fixed key set. No network access; the test seam.
    pub fn from_jwk_set(jwks: JwkSet) -> Self {
        Self {
            source: KeySource::Static(Arc::new(jwks)),
            cache: RwLock::new(None),
        }
    }

    /// Resolve the decoding key for the given `kid`.
    ///
    /// All resolution failures, including fetch errors, surface as
    /// `TokenInvalid`: a token whose key cannot be obtained cannot be valid.
    pub async fn resolve(&self, kid: Option<&str>) -> Result<DecodingKey, AuthlyError> {
        match &self.source {
            KeySource::Static(jwks) => {
                let jwk = select_jwk(jwks, kid)?;
                decoding_key(jwk)
            }
            KeySource::Remote { url, http } => {
                let (jwks, just_fetched) = self.cached_or_fetch(url, http).await?;
                match select_jwk(&jwks, kid) {
                    Ok(jwk) => decoding_key(jwk),
                    Err(_) if !just_fetched => {
                        // Unknown kid against a cached set: the provider may
                        // have rotated keys since the last fetch.
                        tracing::debug!("kid not in cached JWKS, refetching");
                        let jwks = self.refetch(url, http).await?;
                        let jwk = select_jwk(&jwks, kid)?;
                        decoding_key(jwk)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn cached_or_fetch(
        &self,
        url: &str,
        http: &reqwest::Client,
    ) -> Result<(Arc<JwkSet>, bool), AuthlyError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < JWKS_CACHE_TTL {
                    return Ok((Arc::clone(&cached.jwks), false));
                }
            }
        }
        let jwks = self.refetch(url, http).await?;
        Ok((jwks, true))
    }

    async fn refetch(
        &self,
        url: &str,
        http: &reqwest::Client,
    ) -> Result<Arc<JwkSet>, AuthlyError> {
        let jwks = Arc::new(fetch_jwks(url, http).await?);
        let mut cache = self.cache.write().await;
        *cache = Some(CachedJwks {
            fetched_at: Instant::now(),
            jwks: Arc::clone(&jwks),
        });
        Ok(jwks)
    }
}

async fn fetch_jwks(url: &str, http: &reqwest::Client) -> Result<JwkSet, AuthlyError> {
    let resp = http
        .get(url)
        .send()
        .await
        .map_err(|e| AuthlyError::TokenInvalid(format!("failed to fetch JWKS from {url}: {e}")))?;

    if !resp.status().is_success() {
        return Err(AuthlyError::TokenInvalid(format!(
            "JWKS endpoint returned status {}",
            resp.status()
        )));
    }

    resp.json()
        .await
        .map_err(|e| AuthlyError::TokenInvalid(format!("invalid JWKS document: {e}")))
}

fn select_jwk<'a>(jwks: &'a JwkSet, kid: Option<&str>) -> Result<&'a Jwk, AuthlyError> {
    if jwks.keys.is_empty() {
        return Err(AuthlyError::TokenInvalid("JWKS contains no keys".into()));
    }
    match kid {
        Some(kid) => jwks
            .find(kid)
            .ok_or_else(|| AuthlyError::TokenInvalid(format!("no JWKS key with kid '{kid}'"))),
        None if jwks.keys.len() == 1 => Ok(&jwks.keys[0]),
        None => Err(AuthlyError::TokenInvalid(
            "token header has no kid and JWKS has multiple keys".into(),
        )),
    }
}

fn decoding_key(jwk: &Jwk) -> Result<DecodingKey, AuthlyError> {
    DecodingKey::from_jwk(jwk)
        .map_err(|e| AuthlyError::TokenInvalid(format!("unusable JWKS key: {e}")))
}
