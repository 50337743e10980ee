//! Process-wide backend registries.
//!
//! Each backend module registers its schemes exactly once through
//! [`register_backends`]. [`open_async`] and [`open`] resolve a connection
//! URI to the backend serving its scheme and construct it.

use std::sync::{Arc, LazyLock, Once};

use futures::future::BoxFuture;

use limits_core::ports::{AsyncMovingWindowStorage, MovingWindowStorage};
use limits_core::registry::SchemeRegistry;
use limits_core::Result;

/// Builds an async backend from a connection URI.
pub type AsyncBackendFactory =
    fn(String) -> BoxFuture<'static, Result<Arc<dyn AsyncMovingWindowStorage>>>;

/// Builds a blocking backend from a connection URI.
pub type BackendFactory = fn(&str) -> Result<Arc<dyn MovingWindowStorage>>;

static ASYNC_BACKENDS: LazyLock<SchemeRegistry<AsyncBackendFactory>> =
    LazyLock::new(SchemeRegistry::new);

static BACKENDS: LazyLock<SchemeRegistry<BackendFactory>> = LazyLock::new(SchemeRegistry::new);

static REGISTER: Once = Once::new();

/// Registry of async backends.
pub fn async_backends() -> &'static SchemeRegistry<AsyncBackendFactory> {
    &ASYNC_BACKENDS
}

/// Registry of blocking backends.
pub fn backends() -> &'static SchemeRegistry<BackendFactory> {
    &BACKENDS
}

/// Register every backend compiled into this crate. Safe to call repeatedly.
pub fn register_backends() {
    REGISTER.call_once(|| {
        #[cfg(feature = "redis")]
        if let Err(e) = crate::storage::redis::register(&ASYNC_BACKENDS, &BACKENDS) {
            tracing::error!(error = %e, "Failed to register Redis backends");
        }

        #[cfg(feature = "mongodb")]
        if let Err(e) = crate::storage::mongodb::register(&ASYNC_BACKENDS, &BACKENDS) {
            tracing::error!(error = %e, "Failed to register MongoDB backends");
        }

        tracing::debug!(schemes = ?ASYNC_BACKENDS.schemes(), "Storage backends registered");
    });
}

/// Connect the async backend serving `uri`'s scheme.
pub async fn open_async(uri: &str) -> Result<Arc<dyn AsyncMovingWindowStorage>> {
    register_backends();
    let factory = ASYNC_BACKENDS.resolve(uri)?;
    factory(uri.to_string()).await
}

/// Connect the blocking backend serving `uri`'s scheme.
///
/// The blocking MongoDB backend drives its own runtime and must not be
/// opened or used from inside an async task.
pub fn open(uri: &str) -> Result<Arc<dyn MovingWindowStorage>> {
    register_backends();
    let factory = BACKENDS.resolve(uri)?;
    factory(uri)
}
