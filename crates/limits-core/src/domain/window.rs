//! Moving window log algorithms.
//!
//! A window log is a list of hit timestamps (fractional Unix seconds) kept
//! most-recent-first and capped at `limit` entries. Every mutation goes
//! through [`push_capped`], which prepends the newest timestamp and drops the
//! overflow, so the log is non-increasing and never longer than `limit`.
//! Both properties are what make the early-exit scan in [`scan_window`] and
//! the single-slot capacity check in [`admits`] correct.
//!
//! The Redis backend runs the same algorithms inside Lua scripts; the
//! document-store backend calls these functions on the state it reads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::time::from_unix_seconds;

/// Point-in-time view of a moving window. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowSnapshot {
    /// Oldest live entry, or the time of the read when nothing is live.
    pub oldest: DateTime<Utc>,
    /// Number of live entries.
    pub count: u64,
}

impl WindowSnapshot {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            oldest: now,
            count: 0,
        }
    }

    /// Build a snapshot from a scan result, falling back to `now`.
    pub fn from_scan(oldest: Option<f64>, count: u64, now: DateTime<Utc>) -> Self {
        match oldest {
            Some(ts) if count > 0 => Self {
                oldest: from_unix_seconds(ts),
                count,
            },
            _ => Self::empty(now),
        }
    }
}

/// Count the live entries of a log, stopping at the first stale one.
///
/// Entries are live when `>= threshold` (i.e. `now - expiry`). Returns the
/// oldest live timestamp and the live count.
pub fn scan_window(entries: &[f64], threshold: f64) -> (Option<f64>, u64) {
    let mut oldest = None;
    let mut count = 0;

    for &ts in entries {
        if ts < threshold {
            break;
        }
        oldest = Some(ts);
        count += 1;
    }

    (oldest, count)
}

/// Whether one more entry fits in the window.
///
/// Only the slot at `limit - 1` is inspected: once the log holds `limit`
/// entries that slot is the oldest one that still counts, and if it is live
/// the window is saturated.
pub fn admits(entries: &[f64], limit: u64, threshold: f64) -> bool {
    if limit == 0 {
        return false;
    }

    match usize::try_from(limit - 1).ok().and_then(|slot| entries.get(slot)) {
        Some(&ts) => ts < threshold,
        None => true,
    }
}

/// Prepend `ts` and truncate the log to `limit` entries.
pub fn push_capped(entries: &mut Vec<f64>, ts: f64, limit: u64) {
    entries.insert(0, ts);
    entries.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
}
