//! Storage backends - Redis-like list store and MongoDB-like document store.

use limits_core::domain::KeyPrefix;
use limits_core::Result;

#[cfg(feature = "redis")]
pub mod redis;
#[cfg(feature = "redis")]
pub use self::redis::{AsyncRedisStorage, RedisConfig, RedisStorage};

#[cfg(feature = "mongodb")]
pub mod mongodb;
#[cfg(feature = "mongodb")]
pub use self::mongodb::{AsyncMongoStorage, MongoConfig, MongoStorage};

/// Key prefix from `LIMITS_KEY_PREFIX`, defaulting to `LIMITER`.
pub fn key_prefix_from_env() -> Result<KeyPrefix> {
    match std::env::var("LIMITS_KEY_PREFIX") {
        Ok(prefix) => KeyPrefix::new(prefix),
        Err(_) => Ok(KeyPrefix::default()),
    }
}
