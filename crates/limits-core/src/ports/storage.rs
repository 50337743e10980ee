//! Async storage port.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::WindowSnapshot;
use crate::error::Result;

/// Async storage trait - counter primitives backed by a shared remote store.
///
/// Every mutating call is a single atomic operation on the store, so callers
/// in different processes observe one consistent state. Implementations hold
/// no authoritative local cache and never retry.
#[async_trait]
pub trait AsyncStorage: Send + Sync {
    /// Add `amount` to the counter at `key` and return the new value.
    ///
    /// The expiry is set when the increment creates the counter (or the old
    /// window has lapsed). With `elastic_expiry` every call pushes it back to
    /// `now + expiry`.
    async fn incr(
        &self,
        key: &str,
        expiry: Duration,
        elastic_expiry: bool,
        amount: u64,
    ) -> Result<u64>;

    /// Current counter value, `0` when absent or expired.
    async fn get(&self, key: &str) -> Result<u64>;

    /// Instant the counter at `key` expires; "now" when the key is absent.
    async fn get_expiry(&self, key: &str) -> Result<DateTime<Utc>>;

    /// Round-trip to the store. Failures are reported as `false`.
    async fn check(&self) -> bool;

    /// Remove all state for `key`. Clearing an absent key is a no-op.
    async fn clear(&self, key: &str) -> Result<()>;

    /// Remove every key under the engine's key prefix, returning how many
    /// were deleted. Administrative only; can be slow on large key spaces.
    async fn reset(&self) -> Result<u64>;
}

/// Async moving window support.
#[async_trait]
pub trait AsyncMovingWindowStorage: AsyncStorage {
    /// Oldest live entry and live count for the window at `key`.
    async fn get_moving_window(
        &self,
        key: &str,
        limit: u64,
        expiry: Duration,
    ) -> Result<WindowSnapshot>;

    /// Admit one more hit if the window has room, recording it unless
    /// `no_add` is set. A saturated window yields `Ok(false)`.
    async fn acquire_entry(
        &self,
        key: &str,
        limit: u64,
        expiry: Duration,
        no_add: bool,
    ) -> Result<bool>;
}
