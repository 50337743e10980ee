//! Async Redis storage over a multiplexed, auto-reconnecting connection.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};

use limits_core::domain::{KeyPrefix, WindowSnapshot, expiry_seconds, unix_seconds};
use limits_core::ports::{AsyncMovingWindowStorage, AsyncStorage};
use limits_core::{Result, StorageError};

use super::scripts::Scripts;
use super::{RedisConfig, backend_err, expiry_from_ttl, snapshot_from_reply};

/// Redis-backed async storage.
///
/// The connection manager is cloned per call and is safe to share between
/// tasks, so no local lock is held.
pub struct AsyncRedisStorage {
    conn: ConnectionManager,
    key_prefix: KeyPrefix,
    scripts: Scripts,
}

impl AsyncRedisStorage {
    pub async fn new(config: RedisConfig) -> Result<Self> {
        let client = Client::open(config.client_url().as_str())
            .map_err(|e| StorageError::Configuration(e.to_string()))?;

        // Use timeout to prevent hanging if Redis is unreachable
        let conn_manager_fut = ConnectionManager::new(client);
        let conn = tokio::time::timeout(config.connect_timeout, conn_manager_fut)
            .await
            .map_err(|_| StorageError::Connection("Connection timed out".to_string()))?
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        tracing::info!(
            url = %config.url,
            prefix = %config.key_prefix,
            "Connected to Redis storage"
        );

        Ok(Self::with_connection(conn, config.key_prefix))
    }

    /// Wrap a connection manager owned by the caller. Clones of `conn`
    /// elsewhere keep working independently of this storage.
    pub fn with_connection(conn: ConnectionManager, key_prefix: KeyPrefix) -> Self {
        Self {
            conn,
            key_prefix,
            scripts: Scripts::load(),
        }
    }

    /// Create from environment configuration.
    pub async fn from_env() -> Result<Self> {
        Self::new(RedisConfig::from_env()?).await
    }

    pub fn key_prefix(&self) -> &KeyPrefix {
        &self.key_prefix
    }
}

#[async_trait]
impl AsyncStorage for AsyncRedisStorage {
    async fn incr(
        &self,
        key: &str,
        expiry: Duration,
        elastic_expiry: bool,
        amount: u64,
    ) -> Result<u64> {
        let mut conn = self.conn.clone();

        if elastic_expiry {
            let (value,): (u64,) = redis::pipe()
                .atomic()
                .cmd("INCRBY")
                .arg(key)
                .arg(amount)
                .cmd("EXPIRE")
                .arg(key)
                .arg(expiry_seconds(expiry))
                .ignore()
                .query_async(&mut conn)
                .await
                .map_err(backend_err)?;
            return Ok(value);
        }

        self.scripts
            .incr_expire(key, amount, expiry)
            .invoke_async(&mut conn)
            .await
            .map_err(backend_err)
    }

    async fn get(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let value = conn
            .get::<_, Option<u64>>(key)
            .await
            .map_err(backend_err)?;
        Ok(value.unwrap_or(0))
    }

    async fn get_expiry(&self, key: &str) -> Result<DateTime<Utc>> {
        let mut conn = self.conn.clone();
        let ttl = conn.ttl::<_, i64>(key).await.map_err(backend_err)?;
        Ok(expiry_from_ttl(ttl, Utc::now()))
    }

    async fn check(&self) -> bool {
        let mut conn = self.conn.clone();
        let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        match pong {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(prefix = %self.key_prefix, error = %e, "Redis health check failed");
                false
            }
        }
    }

    async fn clear(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await.map_err(backend_err)?;
        Ok(())
    }

    async fn reset(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        let deleted: u64 = self
            .scripts
            .clear_keys(&self.key_prefix)
            .invoke_async(&mut conn)
            .await
            .map_err(backend_err)?;

        if deleted > 0 {
            tracing::warn!(prefix = %self.key_prefix, deleted, "Rate limit keys reset");
        }
        Ok(deleted)
    }
}

#[async_trait]
impl AsyncMovingWindowStorage for AsyncRedisStorage {
    async fn get_moving_window(
        &self,
        key: &str,
        limit: u64,
        expiry: Duration,
    ) -> Result<WindowSnapshot> {
        let mut conn = self.conn.clone();
        let now = Utc::now();
        if limit == 0 {
            return Ok(WindowSnapshot::empty(now));
        }
        let threshold = unix_seconds(now) - expiry.as_secs_f64();

        let reply: (Option<String>, u64) = self
            .scripts
            .moving_window(key, threshold, limit)
            .invoke_async(&mut conn)
            .await
            .map_err(backend_err)?;
        snapshot_from_reply(reply, now)
    }

    async fn acquire_entry(
        &self,
        key: &str,
        limit: u64,
        expiry: Duration,
        no_add: bool,
    ) -> Result<bool> {
        if limit == 0 {
            return Ok(false);
        }

        let mut conn = self.conn.clone();
        let reply: i64 = self
            .scripts
            .acquire_entry(key, unix_seconds(Utc::now()), limit, expiry, no_add)
            .invoke_async(&mut conn)
            .await
            .map_err(backend_err)?;

        let admitted = reply == 1;
        tracing::debug!(key = %key, limit, no_add, admitted, "Moving window acquire");
        Ok(admitted)
    }
}
