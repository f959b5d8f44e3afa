//! Namespaced TTL cache
//!
//! Two backends selected by `cache_type`: rows in the SQL store, or Redis
//! keys shaped `{prefix}:{namespace}:{key}`. TTL is enforced by callers
//! comparing an item's age against the namespace max age; a periodic sweep
//! removes long-dead entries from the DB backend.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fred::prelude::*;
use fred::types::Scanner;
use futures::TryStreamExt;

use super::models::{CacheItem, ValueType};
use super::store::Store;
use crate::config::{CacheType, FileConfig};
use crate::error::{AppError, Result};

/// Namespace for cached nodeinfo software names
pub const NS_NODEINFO: &str = "nodeinfo";
/// Namespace for cached actor documents
pub const NS_ACTOR: &str = "actor";

/// Max age of a cached nodeinfo lookup
pub const NODEINFO_MAX_AGE_SECS: i64 = 3600;
/// Max age of a cached actor document
pub const ACTOR_MAX_AGE_SECS: i64 = 21600;

/// Upper bound on any namespace TTL; the sweep cutoff and the Redis
/// key expiry both derive from it.
const MAX_ENTRY_AGE_SECS: i64 = 86400;

/// Key/value cache operations shared by both backends
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<CacheItem>>;
    async fn set(&self, namespace: &str, key: &str, value: &str, value_type: ValueType)
        -> Result<()>;
    async fn del(&self, namespace: &str, key: &str) -> Result<()>;
    async fn del_namespace(&self, namespace: &str) -> Result<()>;
    async fn clear(&self) -> Result<()>;

    /// Remove entries nothing will ever read again
    async fn sweep(&self) -> Result<()>;
}

/// Build the cache backend selected by the config
pub async fn build_cache(file_config: &FileConfig, store: Arc<Store>) -> Result<Arc<dyn Cache>> {
    match file_config.cache_type {
        CacheType::Database => Ok(Arc::new(SqlCache { store })),
        CacheType::Redis => Ok(Arc::new(RedisCache::connect(file_config).await?)),
    }
}

// =============================================================================
// DB backend
// =============================================================================

/// Cache rows stored in the `cache` table of the SQL store
pub struct SqlCache {
    store: Arc<Store>,
}

impl SqlCache {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Cache for SqlCache {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<CacheItem>> {
        self.store.get_cache_item(namespace, key).await
    }

    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
        value_type: ValueType,
    ) -> Result<()> {
        self.store
            .set_cache_item(namespace, key, value, value_type)
            .await
    }

    async fn del(&self, namespace: &str, key: &str) -> Result<()> {
        self.store.del_cache_item(namespace, key).await
    }

    async fn del_namespace(&self, namespace: &str) -> Result<()> {
        self.store.del_cache_namespace(namespace).await
    }

    async fn clear(&self) -> Result<()> {
        self.store.clear_cache().await
    }

    async fn sweep(&self) -> Result<()> {
        let cutoff = Utc::now() - Duration::seconds(MAX_ENTRY_AGE_SECS);
        let removed = self.store.sweep_cache(cutoff).await?;

        if removed > 0 {
            tracing::debug!(removed, "Swept expired cache rows");
        }

        Ok(())
    }
}

// =============================================================================
// Redis backend
// =============================================================================

/// Cache entries stored as Redis strings
///
/// The value wire format is `{type}:{epoch}:{value}` so the age survives
/// without a second key.
pub struct RedisCache {
    client: RedisClient,
    prefix: String,
}

fn redis_error(context: &str, error: RedisError) -> AppError {
    AppError::Transient(format!("{context}: {error}"))
}

fn redis_key(prefix: &str, namespace: &str, key: &str) -> String {
    format!("{prefix}:{namespace}:{key}")
}

fn encode_entry(value: &str, value_type: ValueType, updated: DateTime<Utc>) -> String {
    format!("{}:{}:{}", value_type.as_str(), updated.timestamp(), value)
}

fn decode_entry(raw: &str) -> Result<CacheItem> {
    let mut parts = raw.splitn(3, ':');
    let (Some(type_tag), Some(epoch), Some(value)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(AppError::Validation("malformed cache entry".to_string()));
    };

    let updated = epoch
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .ok_or_else(|| AppError::Validation("malformed cache timestamp".to_string()))?;

    Ok(CacheItem {
        value: value.to_string(),
        value_type: ValueType::parse(type_tag)?,
        updated,
    })
}

impl RedisCache {
    /// Connect to the Redis instance described by the file config
    pub async fn connect(file_config: &FileConfig) -> Result<Self> {
        let redis = &file_config.redis;

        let auth = match (&redis.user, &redis.pass) {
            (Some(user), Some(pass)) => format!("{user}:{pass}@"),
            (None, Some(pass)) => format!(":{pass}@"),
            _ => String::new(),
        };
        let url = format!(
            "redis://{}{}:{}/{}",
            auth, redis.host, redis.port, redis.database
        );

        let config = RedisConfig::from_url(&url)
            .map_err(|e| AppError::Config(format!("invalid redis config: {e}")))?;
        let client = Builder::from_config(config)
            .build()
            .map_err(|e| AppError::Config(format!("redis client setup failed: {e}")))?;

        client
            .init()
            .await
            .map_err(|e| redis_error("redis connect failed", e))?;

        Ok(Self {
            client,
            prefix: redis.prefix.clone(),
        })
    }

    /// Delete every key matching a pattern, page by page
    async fn del_pattern(&self, pattern: &str) -> Result<()> {
        let mut pages = self.client.scan(pattern, Some(100), None);

        while let Some(mut page) = pages
            .try_next()
            .await
            .map_err(|e| redis_error("redis scan failed", e))?
        {
            if let Some(keys) = page.take_results() {
                if !keys.is_empty() {
                    self.client
                        .del::<u64, _>(keys)
                        .await
                        .map_err(|e| redis_error("redis del failed", e))?;
                }
            }

            let _ = page.next();
        }

        Ok(())
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<CacheItem>> {
        let raw: Option<String> = self
            .client
            .get(redis_key(&self.prefix, namespace, key))
            .await
            .map_err(|e| redis_error("redis get failed", e))?;

        raw.as_deref().map(decode_entry).transpose()
    }

    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
        value_type: ValueType,
    ) -> Result<()> {
        self.client
            .set::<(), _, _>(
                redis_key(&self.prefix, namespace, key),
                encode_entry(value, value_type, Utc::now()),
                Some(Expiration::EX(MAX_ENTRY_AGE_SECS)),
                None,
                false,
            )
            .await
            .map_err(|e| redis_error("redis set failed", e))
    }

    async fn del(&self, namespace: &str, key: &str) -> Result<()> {
        self.client
            .del::<u64, _>(redis_key(&self.prefix, namespace, key))
            .await
            .map_err(|e| redis_error("redis del failed", e))?;
        Ok(())
    }

    async fn del_namespace(&self, namespace: &str) -> Result<()> {
        self.del_pattern(&format!("{}:{}:*", self.prefix, namespace))
            .await
    }

    async fn clear(&self) -> Result<()> {
        self.del_pattern(&format!("{}:*", self.prefix)).await
    }

    async fn sweep(&self) -> Result<()> {
        // key expiry is set at write time
        Ok(())
    }
}
