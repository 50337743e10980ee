//! Domain types shared by every backend.

mod key;
mod time;
mod window;

pub use key::{DEFAULT_KEY_PREFIX, KeyPrefix};
pub use time::{expiry_seconds, from_unix_seconds, unix_seconds};
pub use window::{WindowSnapshot, admits, push_capped, scan_window};
