//! # Limits Infrastructure
//!
//! Concrete implementations of the storage ports defined in `limits-core`,
//! and the registry that maps connection URIs to them.
//!
//! ## Feature Flags
//!
//! - `full` (default) - All backends enabled
//! - `minimal` - Registry only, no backends
//! - `redis` - Redis backends (`redis://`, `rediss://`, `redis+unix://`)
//! - `mongodb` - MongoDB backends (`mongodb://`, `mongodb+srv://`)
//! - `tls` - TLS support for `rediss://`

pub mod registry;
pub mod storage;

pub use registry::{open, open_async, register_backends};

// Re-exports - Redis
#[cfg(feature = "redis")]
pub use storage::{AsyncRedisStorage, RedisConfig, RedisStorage};

// Re-exports - MongoDB
#[cfg(feature = "mongodb")]
pub use storage::{AsyncMongoStorage, MongoConfig, MongoStorage};
