//! Redis storage backends.
//!
//! Counters are plain integer keys, moving windows are lists of hit
//! timestamps kept most-recent-first. Every mutation runs as a single Lua
//! script or atomic pipeline on the server.

mod async_storage;
mod scripts;
mod storage;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;

use limits_core::domain::{KeyPrefix, WindowSnapshot};
use limits_core::ports::{AsyncMovingWindowStorage, MovingWindowStorage};
use limits_core::registry::SchemeRegistry;
use limits_core::{Result, StorageError};

use crate::registry::{AsyncBackendFactory, BackendFactory};

pub use async_storage::AsyncRedisStorage;
pub use storage::RedisStorage;

/// Schemes served by the Redis backends.
pub const SCHEMES: &[&str] = &["redis", "rediss", "redis+unix"];

/// Redis connection configuration.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis URL (e.g., redis://localhost:6379, redis+unix:///tmp/redis.sock)
    pub url: String,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Read/write timeout of the blocking connection
    pub response_timeout: Duration,
    /// Prefix shared by every rate limit key, used by `reset`
    pub key_prefix: KeyPrefix,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(5),
            key_prefix: KeyPrefix::default(),
        }
    }
}

impl RedisConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            connect_timeout: Duration::from_secs(
                std::env::var("REDIS_CONNECT_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            ),
            response_timeout: Duration::from_secs(
                std::env::var("REDIS_RESPONSE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            ),
            key_prefix: super::key_prefix_from_env()?,
        })
    }

    /// Environment configuration pointed at `url`.
    pub fn for_url(url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            url: url.into(),
            ..Self::from_env()?
        })
    }

    /// URL in the form the redis client understands.
    fn client_url(&self) -> String {
        match self.url.strip_prefix("redis+unix://") {
            Some(path) => format!("unix://{path}"),
            None => self.url.clone(),
        }
    }
}

/// Register the Redis backends for all of [`SCHEMES`].
pub fn register(
    async_backends: &SchemeRegistry<AsyncBackendFactory>,
    backends: &SchemeRegistry<BackendFactory>,
) -> Result<()> {
    async_backends.register(SCHEMES, connect_async)?;
    backends.register(SCHEMES, connect)
}

fn connect_async(url: String) -> BoxFuture<'static, Result<Arc<dyn AsyncMovingWindowStorage>>> {
    async move {
        let storage = AsyncRedisStorage::new(RedisConfig::for_url(url)?).await?;
        Ok(Arc::new(storage) as Arc<dyn AsyncMovingWindowStorage>)
    }
    .boxed()
}

fn connect(url: &str) -> Result<Arc<dyn MovingWindowStorage>> {
    let storage = RedisStorage::new(RedisConfig::for_url(url)?)?;
    Ok(Arc::new(storage))
}

fn backend_err(e: redis::RedisError) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// Instant a key expires given its `TTL` reply (-2 absent, -1 persistent).
fn expiry_from_ttl(ttl: i64, now: DateTime<Utc>) -> DateTime<Utc> {
    now + chrono::TimeDelta::seconds(ttl.max(0))
}

/// Decode the `{oldest, count}` reply of the moving window script.
fn snapshot_from_reply(
    (oldest, count): (Option<String>, u64),
    now: DateTime<Utc>,
) -> Result<WindowSnapshot> {
    let oldest = oldest
        .map(|raw| {
            raw.parse::<f64>()
                .map_err(|e| StorageError::Backend(format!("Malformed window entry {raw:?}: {e}")))
        })
        .transpose()?;

    Ok(WindowSnapshot::from_scan(oldest, count, now))
}
