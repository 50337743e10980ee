//! Blocking Redis storage.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use redis::{Client, Commands, Connection, RedisResult};

use limits_core::domain::{KeyPrefix, WindowSnapshot, expiry_seconds, unix_seconds};
use limits_core::ports::{MovingWindowStorage, Storage};
use limits_core::{Result, StorageError};

use super::scripts::Scripts;
use super::{RedisConfig, backend_err, expiry_from_ttl, snapshot_from_reply};

/// Redis-backed blocking storage over a single connection.
///
/// The mutex only serialises callers inside this process so they do not
/// interleave on the shared connection. Atomicity across processes comes
/// from the server-side scripts, never from this lock. Every reply is
/// bounded by the response timeout, so a stalled server cannot hold the
/// lock forever.
pub struct RedisStorage {
    client: Client,
    conn: Mutex<Option<Connection>>,
    connect_timeout: Duration,
    response_timeout: Duration,
    key_prefix: KeyPrefix,
    scripts: Scripts,
}

impl RedisStorage {
    pub fn new(config: RedisConfig) -> Result<Self> {
        let client = Client::open(config.client_url().as_str())
            .map_err(|e| StorageError::Configuration(e.to_string()))?;
        let storage = Self::with_client(
            client,
            config.key_prefix,
            config.connect_timeout,
            config.response_timeout,
        )?;

        tracing::info!(
            url = %config.url,
            prefix = %storage.key_prefix,
            "Connected to Redis storage"
        );
        Ok(storage)
    }

    /// Build on a client owned by the caller. One connection is opened
    /// eagerly and re-opened from `client` whenever it drops.
    pub fn with_client(
        client: Client,
        key_prefix: KeyPrefix,
        connect_timeout: Duration,
        response_timeout: Duration,
    ) -> Result<Self> {
        let conn = Self::connect(&client, connect_timeout, response_timeout)?;

        Ok(Self {
            client,
            conn: Mutex::new(Some(conn)),
            connect_timeout,
            response_timeout,
            key_prefix,
            scripts: Scripts::load(),
        })
    }

    /// Create from environment configuration.
    pub fn from_env() -> Result<Self> {
        Self::new(RedisConfig::from_env()?)
    }

    pub fn key_prefix(&self) -> &KeyPrefix {
        &self.key_prefix
    }

    fn connect(
        client: &Client,
        connect_timeout: Duration,
        response_timeout: Duration,
    ) -> Result<Connection> {
        let conn = client
            .get_connection_with_timeout(connect_timeout)
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        conn.set_read_timeout(Some(response_timeout))
            .map_err(|e| StorageError::Configuration(e.to_string()))?;
        conn.set_write_timeout(Some(response_timeout))
            .map_err(|e| StorageError::Configuration(e.to_string()))?;
        Ok(conn)
    }

    /// Run `op` on the connection, reconnecting first if the previous one
    /// was dropped.
    fn with_connection<T>(&self, op: impl FnOnce(&mut Connection) -> RedisResult<T>) -> Result<T> {
        let mut guard = self.conn.lock();
        if guard.is_none() {
            *guard = Some(Self::connect(
                &self.client,
                self.connect_timeout,
                self.response_timeout,
            )?);
            tracing::info!(prefix = %self.key_prefix, "Reconnected to Redis storage");
        }

        let conn = guard
            .as_mut()
            .ok_or_else(|| StorageError::Connection("No Redis connection".to_string()))?;

        op(conn).map_err(|e| {
            // A timed out reply may still arrive later; the connection is
            // out of sync and must not be reused.
            if e.is_connection_dropped() || e.is_io_error() || e.is_timeout() {
                tracing::warn!(error = %e, "Redis connection lost");
                *guard = None;
            }
            backend_err(e)
        })
    }
}

impl Storage for RedisStorage {
    fn incr(&self, key: &str, expiry: Duration, elastic_expiry: bool, amount: u64) -> Result<u64> {
        if elastic_expiry {
            let (value,): (u64,) = self.with_connection(|conn| {
                redis::pipe()
                    .atomic()
                    .cmd("INCRBY")
                    .arg(key)
                    .arg(amount)
                    .cmd("EXPIRE")
                    .arg(key)
                    .arg(expiry_seconds(expiry))
                    .ignore()
                    .query(conn)
            })?;
            return Ok(value);
        }

        self.with_connection(|conn| self.scripts.incr_expire(key, amount, expiry).invoke(conn))
    }

    fn get(&self, key: &str) -> Result<u64> {
        let value = self.with_connection(|conn| conn.get::<_, Option<u64>>(key))?;
        Ok(value.unwrap_or(0))
    }

    fn get_expiry(&self, key: &str) -> Result<DateTime<Utc>> {
        let ttl = self.with_connection(|conn| conn.ttl::<_, i64>(key))?;
        Ok(expiry_from_ttl(ttl, Utc::now()))
    }

    fn check(&self) -> bool {
        let pong: Result<String> = self.with_connection(|conn| redis::cmd("PING").query(conn));
        match pong {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(prefix = %self.key_prefix, error = %e, "Redis health check failed");
                false
            }
        }
    }

    fn clear(&self, key: &str) -> Result<()> {
        self.with_connection(|conn| conn.del::<_, ()>(key))
    }

    fn reset(&self) -> Result<u64> {
        let deleted: u64 =
            self.with_connection(|conn| self.scripts.clear_keys(&self.key_prefix).invoke(conn))?;

        if deleted > 0 {
            tracing::warn!(prefix = %self.key_prefix, deleted, "Rate limit keys reset");
        }
        Ok(deleted)
    }
}

impl MovingWindowStorage for RedisStorage {
    fn get_moving_window(
        &self,
        key: &str,
        limit: u64,
        expiry: Duration,
    ) -> Result<WindowSnapshot> {
        let now = Utc::now();
        if limit == 0 {
            return Ok(WindowSnapshot::empty(now));
        }
        let threshold = unix_seconds(now) - expiry.as_secs_f64();

        let reply: (Option<String>, u64) = self.with_connection(|conn| {
            self.scripts
                .moving_window(key, threshold, limit)
                .invoke(conn)
        })?;
        snapshot_from_reply(reply, now)
    }

    fn acquire_entry(&self, key: &str, limit: u64, expiry: Duration, no_add: bool) -> Result<bool> {
        if limit == 0 {
            return Ok(false);
        }

        let now = unix_seconds(Utc::now());
        let reply: i64 = self.with_connection(|conn| {
            self.scripts
                .acquire_entry(key, now, limit, expiry, no_add)
                .invoke(conn)
        })?;

        let admitted = reply == 1;
        tracing::debug!(key = %key, limit, no_add, admitted, "Moving window acquire");
        Ok(admitted)
    }
}
