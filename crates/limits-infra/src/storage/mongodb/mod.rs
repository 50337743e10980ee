//! MongoDB storage backends.
//!
//! Every mutation is a single `find_one_and_update` with an aggregation
//! pipeline, so the read of the current window and the write happen in one
//! atomic server-side step.

mod async_storage;
mod documents;
mod storage;

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::ClientOptions;

use limits_core::domain::KeyPrefix;
use limits_core::ports::{AsyncMovingWindowStorage, MovingWindowStorage};
use limits_core::registry::SchemeRegistry;
use limits_core::{Result, StorageError};

use crate::registry::{AsyncBackendFactory, BackendFactory};

pub use async_storage::AsyncMongoStorage;
pub use storage::MongoStorage;

/// Schemes served by the MongoDB backends.
pub const SCHEMES: &[&str] = &["mongodb", "mongodb+srv"];

/// MongoDB connection configuration.
///
/// Both timeouts default to 100ms.
#[derive(Debug, Clone)]
pub struct MongoConfig {
    /// MongoDB URL (e.g., mongodb://localhost:27017)
    pub url: String,
    /// Database holding the `counters` and `windows` collections
    pub database: String,
    pub connect_timeout: Duration,
    pub server_selection_timeout: Duration,
    /// Prefix shared by every rate limit key, used by `reset`
    pub key_prefix: KeyPrefix,
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self {
            url: "mongodb://localhost:27017".to_string(),
            database: "limits_database".to_string(),
            connect_timeout: Duration::from_millis(100),
            server_selection_timeout: Duration::from_millis(100),
            key_prefix: KeyPrefix::default(),
        }
    }
}

impl MongoConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            url: std::env::var("MONGODB_URL")
                .unwrap_or_else(|_| "mongodb://localhost:27017".to_string()),
            database: std::env::var("MONGODB_DATABASE")
                .unwrap_or_else(|_| "limits_database".to_string()),
            connect_timeout: Duration::from_millis(
                std::env::var("MONGODB_CONNECT_TIMEOUT_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(100),
            ),
            server_selection_timeout: Duration::from_millis(
                std::env::var("MONGODB_SERVER_SELECTION_TIMEOUT_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(100),
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

    fn apply_timeouts(&self, options: &mut ClientOptions) {
        options.connect_timeout = Some(self.connect_timeout);
        options.server_selection_timeout = Some(self.server_selection_timeout);
    }
}

/// Register the MongoDB backends for all of [`SCHEMES`].
pub fn register(
    async_backends: &SchemeRegistry<AsyncBackendFactory>,
    backends: &SchemeRegistry<BackendFactory>,
) -> Result<()> {
    async_backends.register(SCHEMES, connect_async)?;
    backends.register(SCHEMES, connect)
}

fn connect_async(url: String) -> BoxFuture<'static, Result<Arc<dyn AsyncMovingWindowStorage>>> {
    async move {
        let storage = AsyncMongoStorage::new(MongoConfig::for_url(url)?).await?;
        Ok(Arc::new(storage) as Arc<dyn AsyncMovingWindowStorage>)
    }
    .boxed()
}

fn connect(url: &str) -> Result<Arc<dyn MovingWindowStorage>> {
    let storage = MongoStorage::new(MongoConfig::for_url(url)?)?;
    Ok(Arc::new(storage))
}

fn backend_err(e: mongodb::error::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn config_err(e: mongodb::error::Error) -> StorageError {
    StorageError::Configuration(e.to_string())
}

/// Server error code for a unique index violation.
const DUPLICATE_KEY: i32 = 11000;

/// Two upserts racing to create the same window document; the loser sees a
/// duplicate `_id`.
fn is_duplicate_key(e: &mongodb::error::Error) -> bool {
    match e.kind.as_ref() {
        ErrorKind::Command(err) => err.code == DUPLICATE_KEY,
        ErrorKind::Write(WriteFailure::WriteError(err)) => err.code == DUPLICATE_KEY,
        _ => false,
    }
}

/// The first `limit` entries of a most-recent-first log.
fn head(entries: &[f64], limit: u64) -> &[f64] {
    let len = usize::try_from(limit).map_or(entries.len(), |limit| limit.min(entries.len()));
    &entries[..len]
}

fn amount_to_i64(amount: u64) -> Result<i64> {
    i64::try_from(amount)
        .map_err(|_| StorageError::Configuration(format!("Increment {amount} is out of range")))
}

/// Window capacity as the server's 32-bit array index.
fn window_cap(limit: u64) -> Result<i32> {
    i32::try_from(limit)
        .map_err(|_| StorageError::Configuration(format!("Window limit {limit} is out of range")))
}
