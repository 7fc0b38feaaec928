use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use jsonwebtoken::jwk::{Jwk, JwkSet};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// The parts of the discovery document this flow uses
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryDocument {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: Option<String>,
    pub jwks_uri: String,
}

#[derive(Debug, Clone)]
pub struct ProviderMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: Option<String>,
    pub jwks: JwkSet,
}

impl ProviderMetadata {
    /// Look up a signing key by `kid`. Tokens without a `kid` are only
    /// accepted when the provider publishes exactly one key.
    pub fn find_key(&self, kid: Option<&str>) -> Option<&Jwk> {
        match kid {
            Some(kid) => self.jwks.find(kid),
            None if self.jwks.keys.len() == 1 => self.jwks.keys.first(),
            None => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("failed to fetch {what}: {source}")]
    Fetch {
        what: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("invalid {what} from provider: {source}")]
    Invalid {
        what: &'static str,
        #[source]
        source: reqwest::Error,
    },
}

struct CachedMetadata {
    metadata: Arc<ProviderMetadata>,
    fetched_at: Instant,
}

/// Discovery document and key set, cached for `ttl`.
///
/// Shared by all requests. Concurrent refreshes may race; the last writer
/// wins and the worst case is one redundant fetch.
pub struct ProviderConfig {
    client: reqwest::Client,
    discovery_url: String,
    ttl: Duration,
    cache: RwLock<Option<CachedMetadata>>,
}

impl ProviderConfig {
    pub fn new(client: reqwest::Client, discovery_url: impl Into<String>, ttl: Duration) -> Self {
        Self {
            client,
            discovery_url: discovery_url.into(),
            ttl,
            cache: RwLock::new(None),
        }
    }

    /// Cached metadata if still fresh, otherwise a new fetch
    pub async fn discover(&self) -> Result<Arc<ProviderMetadata>, ProviderError> {
        if let Some(cached) = self.cache.read().await.as_ref() {
            if cached.fetched_at.elapsed() < self.ttl {
                return Ok(cached.metadata.clone());
            }
            debug!("Provider metadata cache expired");
        }

        self.refresh().await
    }

    /// Fetch discovery document and key set, replacing the cache for everyone
    #[tracing::instrument(skip(self), fields(discovery_url = %self.discovery_url), err)]
    pub async fn refresh(&self) -> Result<Arc<ProviderMetadata>, ProviderError> {
        let metadata = Arc::new(self.fetch().await?);

        *self.cache.write().await = Some(CachedMetadata {
            metadata: metadata.clone(),
            fetched_at: Instant::now(),
        });

        info!(
            issuer = %metadata.issuer,
            keys = metadata.jwks.keys.len(),
            "Provider metadata refreshed"
        );
        Ok(metadata)
    }

    /// Signing key for `kid`.
    ///
    /// A miss against the cached key set triggers exactly one refresh, which
    /// picks up keys the provider rotated in since the last fetch.
    pub async fn signing_key(&self, kid: Option<&str>) -> Result<Option<Jwk>, ProviderError> {
        let metadata = self.discover().await?;
        if let Some(key) = metadata.find_key(kid) {
            return Ok(Some(key.clone()));
        }

        warn!(kid = ?kid, "Signing key not in cached key set, refreshing");
        let metadata = self.refresh().await?;
        Ok(metadata.find_key(kid).cloned())
    }

    async fn fetch(&self) -> Result<ProviderMetadata, ProviderError> {
        let document: DiscoveryDocument = self
            .client
            .get(&self.discovery_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|source| ProviderError::Fetch {
                what: "discovery document",
                source,
            })?
            .json()
            .await
            .map_err(|source| ProviderError::Invalid {
                what: "discovery document",
                source,
            })?;

        let jwks: JwkSet = self
            .client
            .get(&document.jwks_uri)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|source| ProviderError::Fetch {
                what: "key set",
                source,
            })?
            .json()
            .await
            .map_err(|source| ProviderError::Invalid {
                what: "key set",
                source,
            })?;

        Ok(ProviderMetadata {
            issuer: document.issuer,
            authorization_endpoint: document.authorization_endpoint,
            token_endpoint: document.token_endpoint,
            userinfo_endpoint: document.userinfo_endpoint,
            jwks,
        })
    }
}
