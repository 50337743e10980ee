//! Async MongoDB storage.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mongodb::bson::doc;
use mongodb::options::{ClientOptions, ReturnDocument};
use mongodb::{Client, Collection};

use limits_core::domain::{KeyPrefix, WindowSnapshot, admits, scan_window, unix_seconds};
use limits_core::ports::{AsyncMovingWindowStorage, AsyncStorage};
use limits_core::{Result, StorageError};

use super::documents::{
    COUNTERS, CounterDocument, WINDOWS, WindowDocument, acquire_pipeline, by_key,
    expiration_after, expiry_index, from_bson_datetime, incr_pipeline, live_counter, owned_by,
    to_bson_datetime,
};
use super::{
    MongoConfig, amount_to_i64, backend_err, config_err, head, is_duplicate_key, window_cap,
};

/// MongoDB-backed async storage.
///
/// The driver pools connections internally; the client is shared between
/// tasks as is.
pub struct AsyncMongoStorage {
    client: Client,
    counters: Collection<CounterDocument>,
    windows: Collection<WindowDocument>,
    key_prefix: KeyPrefix,
}

impl AsyncMongoStorage {
    pub async fn new(config: MongoConfig) -> Result<Self> {
        let mut options = ClientOptions::parse(config.url.as_str())
            .await
            .map_err(config_err)?;
        config.apply_timeouts(&mut options);
        let client = Client::with_options(options).map_err(config_err)?;

        let storage = Self::with_client(client, &config.database, config.key_prefix).await?;

        tracing::info!(
            url = %config.url,
            database = %config.database,
            prefix = %storage.key_prefix,
            "Connected to MongoDB storage"
        );
        Ok(storage)
    }

    /// Build on a client owned by the caller, storing documents in
    /// `database`. Creates the TTL indexes if they are missing.
    pub async fn with_client(
        client: Client,
        database: &str,
        key_prefix: KeyPrefix,
    ) -> Result<Self> {
        let storage = Self::from_parts(client, database, key_prefix);

        // First round trip; an unreachable server fails here.
        storage
            .counters
            .create_index(expiry_index())
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        storage
            .windows
            .create_index(expiry_index())
            .await
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
    pub async fn from_env() -> Result<Self> {
        Self::new(MongoConfig::from_env()?).await
    }

    pub fn key_prefix(&self) -> &KeyPrefix {
        &self.key_prefix
    }

    async fn load_window(&self, key: &str) -> Result<WindowDocument> {
        let window = self
            .windows
            .find_one(by_key(key))
            .projection(doc! { "entries": 1 })
            .await
            .map_err(backend_err)?;
        Ok(window.unwrap_or_default())
    }
}

#[async_trait]
impl AsyncStorage for AsyncMongoStorage {
    async fn incr(
        &self,
        key: &str,
        expiry: Duration,
        elastic_expiry: bool,
        amount: u64,
    ) -> Result<u64> {
        let pipeline =
            incr_pipeline(amount_to_i64(amount)?, expiration_after(expiry), elastic_expiry);
        let counter = self
            .counters
            .find_one_and_update(by_key(key), pipeline)
            .upsert(true)
            .return_document(ReturnDocument::After)
            .projection(doc! { "count": 1 })
            .await
            .map_err(backend_err)?
            .ok_or_else(|| {
                StorageError::Backend(format!("Upsert of counter {key} returned nothing"))
            })?;

        Ok(u64::try_from(counter.count).unwrap_or(0))
    }

    async fn get(&self, key: &str) -> Result<u64> {
        let counter = self
            .counters
            .find_one(live_counter(key, to_bson_datetime(Utc::now())))
            .projection(doc! { "count": 1 })
            .await
            .map_err(backend_err)?;

        Ok(counter.map_or(0, |c| u64::try_from(c.count).unwrap_or(0)))
    }

    async fn get_expiry(&self, key: &str) -> Result<DateTime<Utc>> {
        let counter = self
            .counters
            .find_one(by_key(key))
            .await
            .map_err(backend_err)?;

        Ok(counter
            .and_then(|c| c.expire_at)
            .map_or_else(Utc::now, from_bson_datetime))
    }

    async fn check(&self) -> bool {
        let ping = self
            .client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await;
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

    /// Counter and window live in separate documents and are deleted one
    /// after the other. The window goes first: if the second delete fails
    /// the caller is left with a counter to clear again, never with a stale
    /// window rejecting admissions.
    async fn clear(&self, key: &str) -> Result<()> {
        self.windows
            .delete_one(by_key(key))
            .await
            .map_err(backend_err)?;
        self.counters
            .delete_one(by_key(key))
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn reset(&self) -> Result<u64> {
        let filter = owned_by(&self.key_prefix);
        let counters = self
            .counters
            .delete_many(filter.clone())
            .await
            .map_err(backend_err)?;
        let windows = self
            .windows
            .delete_many(filter)
            .await
            .map_err(backend_err)?;

        let deleted = counters.deleted_count + windows.deleted_count;
        if deleted > 0 {
            tracing::warn!(prefix = %self.key_prefix, deleted, "Rate limit keys reset");
        }
        Ok(deleted)
    }
}

#[async_trait]
impl AsyncMovingWindowStorage for AsyncMongoStorage {
    async fn get_moving_window(
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

        let window = self.load_window(key).await?;
        let (oldest, count) = scan_window(head(&window.entries, limit), threshold);
        Ok(WindowSnapshot::from_scan(oldest, count, now))
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
        let cap = window_cap(limit)?;

        let now = unix_seconds(Utc::now());
        let threshold = now - expiry.as_secs_f64();

        if no_add {
            let window = self.load_window(key).await?;
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
            .await;

        let admitted = match before {
            Ok(before) => admits(&before.unwrap_or_default().entries, limit, threshold),
            Err(e) if is_duplicate_key(&e) => false,
            Err(e) => return Err(backend_err(e)),
        };

        tracing::debug!(key = %key, limit, no_add, admitted, "Moving window acquire");
        Ok(admitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const DATABASE: &str = "limits_database";

    async fn get_test_storage() -> Option<AsyncMongoStorage> {
        let config = MongoConfig {
            url: std::env::var("MONGODB_URL")
                .unwrap_or_else(|_| "mongodb://localhost:27017".to_string()),
            connect_timeout: Duration::from_secs(1),
            server_selection_timeout: Duration::from_secs(1),
            ..MongoConfig::default()
        };

        AsyncMongoStorage::new(config).await.ok()
    }

    fn test_key(name: &str) -> String {
        format!("LIMITER/{name}/{}", uuid::Uuid::new_v4())
    }

    /// Storage over a client pointed at a closed port. Nothing is sent
    /// until an operation runs.
    async fn unreachable_storage() -> AsyncMongoStorage {
        let mut options = ClientOptions::parse("mongodb://localhost:1").await.unwrap();
        options.server_selection_timeout = Some(Duration::from_millis(100));
        let client = Client::with_options(options).unwrap();
        AsyncMongoStorage::from_parts(client, DATABASE, KeyPrefix::default())
    }

    #[tokio::test]
    async fn test_zero_limit_needs_no_round_trip() {
        let storage = unreachable_storage().await;
        let expiry = Duration::from_secs(10);

        let snapshot = storage.get_moving_window("LIMITER/zero", 0, expiry).await.unwrap();
        assert_eq!(snapshot.count, 0);
        assert!(!storage.acquire_entry("LIMITER/zero", 0, expiry, false).await.unwrap());

        // The store really is unreachable.
        assert!(storage.get_moving_window("LIMITER/zero", 1, expiry).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_limit_is_rejected_up_front() {
        let storage = unreachable_storage().await;
        let limit = i32::MAX as u64 + 1;

        let err = storage
            .acquire_entry("LIMITER/huge", limit, Duration::from_secs(10), false)
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_incr_counts_within_window() {
        let storage = match get_test_storage().await {
            Some(s) => s,
            None => {
                tracing::warn!("MongoDB not available, skipping test");
                return;
            }
        };
        let key = test_key("fixed");
        let expiry = Duration::from_secs(60);

        assert_eq!(storage.get(&key).await.unwrap(), 0);
        assert_eq!(storage.incr(&key, expiry, false, 1).await.unwrap(), 1);
        let first_expiry = storage.get_expiry(&key).await.unwrap();

        for n in 2..=5 {
            assert_eq!(storage.incr(&key, expiry, false, 1).await.unwrap(), n);
        }
        assert_eq!(storage.get(&key).await.unwrap(), 5);
        assert_eq!(storage.get_expiry(&key).await.unwrap(), first_expiry);

        storage.clear(&key).await.unwrap();
    }

    #[tokio::test]
    async fn test_incr_honours_amount() {
        let storage = match get_test_storage().await {
            Some(s) => s,
            None => return,
        };
        let key = test_key("amount");

        assert_eq!(storage.incr(&key, Duration::from_secs(30), false, 4).await.unwrap(), 4);
        assert_eq!(storage.incr(&key, Duration::from_secs(30), false, 3).await.unwrap(), 7);

        storage.clear(&key).await.unwrap();
    }

    #[tokio::test]
    async fn test_elastic_expiry_extends_window() {
        let storage = match get_test_storage().await {
            Some(s) => s,
            None => return,
        };
        let key = test_key("elastic");
        let expiry = Duration::from_secs(10);

        storage.incr(&key, expiry, true, 1).await.unwrap();
        let first = storage.get_expiry(&key).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(storage.incr(&key, expiry, true, 1).await.unwrap(), 2);
        assert!(storage.get_expiry(&key).await.unwrap() > first);

        storage.clear(&key).await.unwrap();
    }

    #[tokio::test]
    async fn test_lapsed_counter_restarts() {
        let storage = match get_test_storage().await {
            Some(s) => s,
            None => return,
        };
        let key = test_key("lapsed");

        storage.incr(&key, Duration::from_millis(200), false, 3).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(storage.get(&key).await.unwrap(), 0);
        assert_eq!(storage.incr(&key, Duration::from_secs(30), false, 1).await.unwrap(), 1);
        assert!(storage.get_expiry(&key).await.unwrap() > Utc::now());

        storage.clear(&key).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let storage = match get_test_storage().await {
            Some(s) => Arc::new(s),
            None => return,
        };
        let key = test_key("concurrent");
        // Create the document up front so no two upserts race on insert.
        storage.incr(&key, Duration::from_secs(30), false, 1).await.unwrap();

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let storage = storage.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    storage.incr(&key, Duration::from_secs(30), false, 1).await.unwrap()
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(storage.get(&key).await.unwrap(), 21);
        storage.clear(&key).await.unwrap();
    }

    #[tokio::test]
    async fn test_moving_window_capacity() {
        let storage = match get_test_storage().await {
            Some(s) => s,
            None => return,
        };
        let key = test_key("window");
        let expiry = Duration::from_secs(2);

        for _ in 0..3 {
            assert!(storage.acquire_entry(&key, 3, expiry, false).await.unwrap());
        }
        assert!(!storage.acquire_entry(&key, 3, expiry, false).await.unwrap());

        let snapshot = storage.get_moving_window(&key, 3, expiry).await.unwrap();
        assert_eq!(snapshot.count, 3);
        assert!(snapshot.oldest <= Utc::now());

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert!(storage.acquire_entry(&key, 3, expiry, false).await.unwrap());
        assert_eq!(storage.get_moving_window(&key, 3, expiry).await.unwrap().count, 1);

        storage.clear(&key).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_acquire_respects_limit() {
        let storage = match get_test_storage().await {
            Some(s) => Arc::new(s),
            None => return,
        };
        let key = test_key("concurrent-window");
        let expiry = Duration::from_secs(30);
        // An existing document keeps every call on the update path, away
        // from the insert race.
        storage
            .windows
            .clone_with_type::<mongodb::bson::Document>()
            .insert_one(doc! { "_id": key.as_str(), "entries": [] })
            .await
            .unwrap();

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let storage = storage.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    storage.acquire_entry(&key, 5, expiry, false).await.unwrap()
                })
            })
            .collect();

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 5);
        assert_eq!(storage.get_moving_window(&key, 5, expiry).await.unwrap().count, 5);

        storage.clear(&key).await.unwrap();
    }

    #[tokio::test]
    async fn test_clear_removes_counter_and_window() {
        let storage = match get_test_storage().await {
            Some(s) => s,
            None => return,
        };
        let key = test_key("clear-both");
        let expiry = Duration::from_secs(30);

        storage.incr(&key, expiry, false, 1).await.unwrap();
        assert!(storage.acquire_entry(&key, 1, expiry, false).await.unwrap());
        assert!(!storage.acquire_entry(&key, 1, expiry, false).await.unwrap());

        storage.clear(&key).await.unwrap();
        assert_eq!(storage.get(&key).await.unwrap(), 0);
        assert_eq!(storage.get_moving_window(&key, 1, expiry).await.unwrap().count, 0);
        assert!(storage.acquire_entry(&key, 1, expiry, false).await.unwrap());

        storage.clear(&key).await.unwrap();
    }

    #[tokio::test]
    async fn test_with_client_uses_caller_client() {
        let url = std::env::var("MONGODB_URL")
            .unwrap_or_else(|_| "mongodb://localhost:27017".to_string());
        let mut options = ClientOptions::parse(url.as_str()).await.unwrap();
        options.server_selection_timeout = Some(Duration::from_secs(1));
        let client = Client::with_options(options).unwrap();

        let prefix = KeyPrefix::default();
        let storage = match AsyncMongoStorage::with_client(client.clone(), DATABASE, prefix).await {
            Ok(s) => s,
            Err(_) => return,
        };
        let key = test_key("owned-client");
        assert_eq!(storage.incr(&key, Duration::from_secs(30), false, 2).await.unwrap(), 2);

        // The caller's client sees the counter once the storage is gone.
        drop(storage);
        let counter = client
            .database(DATABASE)
            .collection::<CounterDocument>(COUNTERS)
            .find_one(by_key(&key))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(counter.count, 2);

        client
            .database(DATABASE)
            .collection::<CounterDocument>(COUNTERS)
            .delete_one(by_key(&key))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_no_add_probe_is_read_only() {
        let storage = match get_test_storage().await {
            Some(s) => s,
            None => return,
        };
        let key = test_key("probe");
        let expiry = Duration::from_secs(30);

        assert!(storage.acquire_entry(&key, 1, expiry, true).await.unwrap());
        assert_eq!(storage.get_moving_window(&key, 1, expiry).await.unwrap().count, 0);

        assert!(storage.acquire_entry(&key, 1, expiry, false).await.unwrap());
        assert!(!storage.acquire_entry(&key, 1, expiry, true).await.unwrap());
        assert_eq!(storage.get_moving_window(&key, 1, expiry).await.unwrap().count, 1);

        storage.clear(&key).await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_limit_rejects() {
        let storage = match get_test_storage().await {
            Some(s) => s,
            None => return,
        };
        let key = test_key("zero");
        let expiry = Duration::from_secs(10);
        assert!(!storage.acquire_entry(&key, 0, expiry, false).await.unwrap());
        assert_eq!(storage.get_moving_window(&key, 0, expiry).await.unwrap().count, 0);
    }

    #[tokio::test]
    async fn test_reset_removes_only_prefixed_documents() {
        let prefix = KeyPrefix::new(format!("LIMITER-{}", uuid::Uuid::new_v4().simple())).unwrap();
        let storage = match get_test_storage().await {
            Some(s) => AsyncMongoStorage {
                key_prefix: prefix.clone(),
                ..s
            },
            None => return,
        };
        let foreign = test_key("foreign");
        let expiry = Duration::from_secs(30);
        storage.incr(&foreign, expiry, false, 1).await.unwrap();

        storage.incr(&format!("{prefix}/counter"), expiry, false, 1).await.unwrap();
        storage.acquire_entry(&format!("{prefix}/window"), 2, expiry, false).await.unwrap();

        assert_eq!(storage.reset().await.unwrap(), 2);
        assert_eq!(storage.get(&format!("{prefix}/counter")).await.unwrap(), 0);
        assert_eq!(storage.get(&foreign).await.unwrap(), 1);
        assert_eq!(storage.reset().await.unwrap(), 0);

        storage.clear(&foreign).await.unwrap();
    }

    #[tokio::test]
    async fn test_check() {
        let storage = match get_test_storage().await {
            Some(s) => s,
            None => return,
        };
        assert!(storage.check().await);
    }
}
