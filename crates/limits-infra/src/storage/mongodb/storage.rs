//! Blocking MongoDB storage.

use std::time::Duration;

use chrono::{DateTime, Utc};
use mongodb::bson::doc;
use mongodb::options::{ClientOptions, ReturnDocument};
use mongodb::sync::{Client, Collection};

use limits_core::domain::{KeyPrefix, WindowSnapshot, admits, scan_window, unix_seconds};
use limits_core::ports::{MovingWindowStorage, Storage};
use limits_core::{Result, StorageError};

use super::documents::{
    COUNTERS, CounterDocument, WINDOWS, WindowDocument, acquire_pipeline, by_key,
    expiration_after, expiry_index, from_bson_datetime, incr_pipeline, live_counter, owned_by,
    to_bson_datetime,
};
use super::{
    MongoConfig, amount_to_i64, backend_err, config_err, head, is_duplicate_key, window_cap,
};

/// MongoDB-backed blocking storage over the driver's sync client.
pub struct MongoStorage {
    client: Client,
    counters: Collection<CounterDocument>,
    windows: Collection<WindowDocument>,
    key_prefix: KeyPrefix,
}

impl MongoStorage {
    pub fn new(config: MongoConfig) -> Result<Self> {
        let mut options = ClientOptions::parse(config.url.as_str())
            .run()
            .map_err(config_err)?;
        config.apply_timeouts(&mut options);
        let client = Client::with_options(options).map_err(config_err)?;

        let storage = Self::with_client(client, &config.database, config.key_prefix)?;

        tracing::info!(
            url = %config.url,
            database = %config.database,
            prefix = %storage.key_prefix,
            "Connected to MongoDB storage"
        );
        Ok(storage)
    }

    /// Build on a sync client owned by the caller, storing documents in
    /// `database`. Creates the TTL indexes if they are missing.
    pub fn with_client(client: Client, database: &str, key_prefix: KeyPrefix) -> Result<Self> {
        let storage = Self::from_parts(client, database, key_prefix);

        storage
            .counters
            .create_index(expiry_index())
            .run()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        storage
            .windows
            .create_index(expiry_index())
            .run()
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        Ok(storage)
    }

    fn from_parts(client: Client, database: &str, key_prefix: KeyPrefix) -> Self {
        let database = client.database(database);
        Self {
            counters: database.collection(COUNTERS),
            windows: database.collection(WINDOWS),
            client,
            key_prefix,
        }
    }

    /// Create from environment configuration.
    pub fn from_env() -> Result<Self> {
        Self::new(MongoConfig::from_env()?)
    }

    pub fn key_prefix(&self) -> &KeyPrefix {
        &self.key_prefix
    }

    fn load_window(&self, key: &str) -> Result<WindowDocument> {
        let window = self
            .windows
            .find_one(by_key(key))
            .projection(doc! { "entries": 1 })
            .run()
            .map_err(backend_err)?;
        Ok(window.unwrap_or_default())
    }
}

impl Storage for MongoStorage {
    fn incr(&self, key: &str, expiry: Duration, elastic_expiry: bool, amount: u64) -> Result<u64> {
        let pipeline =
            incr_pipeline(amount_to_i64(amount)?, expiration_after(expiry), elastic_expiry);
        let counter = self
            .counters
            .find_one_and_update(by_key(key), pipeline)
            .upsert(true)
            .return_document(ReturnDocument::After)
            .projection(doc! { "count": 1 })
            .run()
            .map_err(backend_err)?
            .ok_or_else(|| {
                StorageError::Backend(format!("Upsert of counter {key} returned nothing"))
            })?;

        Ok(u64::try_from(counter.count).unwrap_or(0))
    }

    fn get(&self, key: &str) -> Result<u64> {
        let counter = self
            .counters
            .find_one(live_counter(key, to_bson_datetime(Utc::now())))
            .projection(doc! { "count": 1 })
            .run()
            .map_err(backend_err)?;

        Ok(counter.map_or(0, |c| u64::try_from(c.count).unwrap_or(0)))
    }

    fn get_expiry(&self, key: &str) -> Result<DateTime<Utc>> {
        let counter = self
            .counters
            .find_one(by_key(key))
            .run()
            .map_err(backend_err)?;

        Ok(counter
            .and_then(|c| c.expire_at)
            .map_or_else(Utc::now, from_bson_datetime))
    }

    fn check(&self) -> bool {
        let ping = self
            .client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .run();
        match ping {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(
                    prefix = %self.key_prefix,
                    error = %e,
                    "MongoDB health check failed"
                );
                false
            }
        }
    }

    /// Window first, then counter; see `AsyncMongoStorage::clear`.
    fn clear(&self, key: &str) -> Result<()> {
        self.windows
            .delete_one(by_key(key))
            .run()
            .map_err(backend_err)?;
        self.counters
            .delete_one(by_key(key))
            .run()
            .map_err(backend_err)?;
        Ok(())
    }

    fn reset(&self) -> Result<u64> {
        let filter = owned_by(&self.key_prefix);
        let counters = self
            .counters
            .delete_many(filter.clone())
            .run()
            .map_err(backend_err)?;
        let windows = self
            .windows
            .delete_many(filter)
            .run()
            .map_err(backend_err)?;

        let deleted = counters.deleted_count + windows.deleted_count;
        if deleted > 0 {
            tracing::warn!(prefix = %self.key_prefix, deleted, "Rate limit keys reset");
        }
        Ok(deleted)
    }
}

impl MovingWindowStorage for MongoStorage {
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

        let window = self.load_window(key)?;
        let (oldest, count) = scan_window(head(&window.entries, limit), threshold);
        Ok(WindowSnapshot::from_scan(oldest, count, now))
    }

    fn acquire_entry(&self, key: &str, limit: u64, expiry: Duration, no_add: bool) -> Result<bool> {
        if limit == 0 {
            return Ok(false);
        }
        let cap = window_cap(limit)?;

        let now = unix_seconds(Utc::now());
        let threshold = now - expiry.as_secs_f64();

        if no_add {
            let window = self.load_window(key)?;
            return Ok(admits(&window.entries, limit, threshold));
        }

        let before = self
            .windows
            .find_one_and_update(
                by_key(key),
                acquire_pipeline(now, cap, threshold, expiration_after(expiry)),
            )
            .upsert(true)
            .return_document(ReturnDocument::Before)
            .projection(doc! { "entries": 1 })
            .run();

        let admitted = match before {
            Ok(before) => admits(&before.unwrap_or_default().entries, limit, threshold),
            Err(e) if is_duplicate_key(&e) => false,
            Err(e) => return Err(backend_err(e)),
        };

        tracing::debug!(key = %key, limit, no_add, admitted, "Moving window acquire");
        Ok(admitted)
    }
}
