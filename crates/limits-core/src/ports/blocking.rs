//! Blocking storage port. Same contract as [`AsyncStorage`](super::AsyncStorage),
//! the calling thread is occupied for the round trip.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::domain::WindowSnapshot;
use crate::error::Result;

/// Blocking storage trait.
pub trait Storage: Send + Sync {
    fn incr(&self, key: &str, expiry: Duration, elastic_expiry: bool, amount: u64) -> Result<u64>;

    fn get(&self, key: &str) -> Result<u64>;

    fn get_expiry(&self, key: &str) -> Result<DateTime<Utc>>;

    fn check(&self) -> bool;

    fn clear(&self, key: &str) -> Result<()>;

    fn reset(&self) -> Result<u64>;
}

/// Blocking moving window support.
pub trait MovingWindowStorage: Storage {
    fn get_moving_window(&self, key: &str, limit: u64, expiry: Duration) -> Result<WindowSnapshot>;

    fn acquire_entry(&self, key: &str, limit: u64, expiry: Duration, no_add: bool) -> Result<bool>;
}
