//! Redis cache of fetched documents and search results

use std::env;
use std::sync::Arc;

use async_trait::async_trait;
use redis::{AsyncCommands, Client};
use serde::{Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};
use url::Url;

use crate::model::SourceCategory;
use crate::retriever::{FetchError, FetchedDocument, Fetcher, RetrieverError, SearchHit, SearchProvider};

// Environment variable names
const ENV_REDIS_HOST: &str = "FACTHARBOR_REDIS_HOST";
const ENV_REDIS_PORT: &str = "FACTHARBOR_REDIS_PORT";
const ENV_REDIS_PASSWORD: &str = "FACTHARBOR_REDIS_PASSWORD";
const ENV_REDIS_DB: &str = "FACTHARBOR_REDIS_DB";
const ENV_CACHE_TTL: &str = "FACTHARBOR_CACHE_TTL";

// Default values
const DEFAULT_REDIS_HOST: &str = "127.0.0.1";
const DEFAULT_REDIS_PORT: &str = "6379";
const DEFAULT_REDIS_DB: &str = "0";
const DEFAULT_TTL_SECONDS: u64 = 6 * 60 * 60;

// Search results go stale faster than documents
const SEARCH_TTL_SECONDS: u64 = 60 * 60;

const PREFIX_DOCUMENT: &str = "doc:";
const PREFIX_SEARCH: &str = "search:";

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CacheError {
    #[error("Redis connection error: {0}")]
    Connection(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Cache miss for key: {0}")]
    Miss(String),
}

/// Redis-based cache for research inputs
#[derive(Clone)]
pub struct SourceCache {
    client: Client,
    ttl_seconds: u64,
}

impl SourceCache {
    /// Create a new cache instance and verify the connection
    ///
    /// Configuration via environment variables:
    /// - `FACTHARBOR_REDIS_HOST` - Redis host (default: 127.0.0.1)
    /// - `FACTHARBOR_REDIS_PORT` - Redis port (default: 6379)
    /// - `FACTHARBOR_REDIS_PASSWORD` - Redis password (default: none)
    /// - `FACTHARBOR_REDIS_DB` - Redis database number (default: 0)
    /// - `FACTHARBOR_CACHE_TTL` - Document TTL in seconds (default: 21600)
    pub async fn new() -> Result<Self, CacheError> {
        let host = env::var(ENV_REDIS_HOST).unwrap_or_else(|_| DEFAULT_REDIS_HOST.to_string());
        let port = env::var(ENV_REDIS_PORT).unwrap_or_else(|_| DEFAULT_REDIS_PORT.to_string());
        let password = env::var(ENV_REDIS_PASSWORD).ok();
        let db = env::var(ENV_REDIS_DB).unwrap_or_else(|_| DEFAULT_REDIS_DB.to_string());

        let ttl_seconds = env::var(ENV_CACHE_TTL)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_TTL_SECONDS);

        // redis://[password@]host:port/db
        let redis_url = match password {
            Some(pwd) if !pwd.is_empty() => format!("redis://:{}@{}:{}/{}", pwd, host, port, db),
            _ => format!("redis://{}:{}/{}", host, port, db),
        };

        tracing::debug!(host = %host, port = %port, db = %db, "Connecting to Redis");

        let client = Client::open(redis_url)?;

        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        tracing::info!(host = %host, port = %port, "Redis connection established");

        Ok(Self { client, ttl_seconds })
    }

    pub async fn get_document(&self, url: &str) -> Result<FetchedDocument, CacheError> {
        self.get_with_prefix(PREFIX_DOCUMENT, &hash_key(url)).await
    }

    pub async fn set_document(&self, url: &str, doc: &FetchedDocument) -> Result<(), CacheError> {
        self.set_with_prefix_and_ttl(PREFIX_DOCUMENT, &hash_key(url), doc, self.ttl_seconds)
            .await
    }

    pub async fn get_search(&self, key: &str) -> Result<Vec<SearchHit>, CacheError> {
        self.get_with_prefix(PREFIX_SEARCH, &hash_key(key)).await
    }

    pub async fn set_search(&self, key: &str, hits: &[SearchHit]) -> Result<(), CacheError> {
        self.set_with_prefix_and_ttl(PREFIX_SEARCH, &hash_key(key), &hits, SEARCH_TTL_SECONDS)
            .await
    }

    async fn get_with_prefix<T: DeserializeOwned>(&self, prefix: &str, key: &str) -> Result<T, CacheError> {
        let full_key = format!("{}{}", prefix, key);
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let data: Option<String> = conn.get(&full_key).await?;

        match data {
            Some(json) => serde_json::from_str(&json).map_err(|e| CacheError::Serialization(e.to_string())),
            None => Err(CacheError::Miss(key.to_string())),
        }
    }

    async fn set_with_prefix_and_ttl<T: Serialize>(
        &self,
        prefix: &str,
        key: &str,
        data: &T,
        ttl: u64,
    ) -> Result<(), CacheError> {
        let full_key = format!("{}{}", prefix, key);
        let json = serde_json::to_string(data).map_err(|e| CacheError::Serialization(e.to_string()))?;

        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.set_ex(&full_key, json, ttl).await?;

        tracing::debug!(key = %full_key, ttl = ttl, "Cached data");
        Ok(())
    }
}

fn hash_key(raw: &str) -> String {
    format!("{:x}", Sha256::digest(raw.as_bytes()))
}

/// Fetcher decorator that reads through the cache. Cache failures never fail a fetch.
pub struct CachedFetcher {
    inner: Arc<dyn Fetcher>,
    cache: SourceCache,
}

impl CachedFetcher {
    pub fn new(inner: Arc<dyn Fetcher>, cache: SourceCache) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl Fetcher for CachedFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchedDocument, FetchError> {
        match self.cache.get_document(url.as_str()).await {
            Ok(doc) => {
                tracing::debug!(url = %url, "Cache hit for document");
                return Ok(doc);
            }
            Err(CacheError::Miss(_)) => {}
            Err(e) => tracing::warn!(url = %url, error = %e, "Document cache read failed"),
        }

        let doc = self.inner.fetch(url).await?;
        if let Err(e) = self.cache.set_document(url.as_str(), &doc).await {
            tracing::warn!(url = %url, error = %e, "Failed to cache document");
        }
        Ok(doc)
    }
}

/// Search decorator that reads through the cache
pub struct CachedSearch {
    inner: Arc<dyn SearchProvider>,
    cache: SourceCache,
}

impl CachedSearch {
    pub fn new(inner: Arc<dyn SearchProvider>, cache: SourceCache) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl SearchProvider for CachedSearch {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, RetrieverError> {
        let key = format!("{:?}|{}|{}", self.inner.category(), limit, query);

        match self.cache.get_search(&key).await {
            Ok(hits) => {
                tracing::debug!(query = %query, "Cache hit for search");
                return Ok(hits);
            }
            Err(CacheError::Miss(_)) => {}
            Err(e) => tracing::warn!(query = %query, error = %e, "Search cache read failed"),
        }

        let hits = self.inner.search(query, limit).await?;
        if let Err(e) = self.cache.set_search(&key, &hits).await {
            tracing::warn!(query = %query, error = %e, "Failed to cache search results");
        }
        Ok(hits)
    }

    fn category(&self) -> SourceCategory {
        self.inner.category()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_key_is_stable_hex() {
        let a = hash_key("https://example.com/a");
        assert_eq!(a, hash_key("https://example.com/a"));
        assert_ne!(a, hash_key("https://example.com/b"));
        assert_eq!(a.len(), 64);
    }
}
