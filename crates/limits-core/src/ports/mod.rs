//! Ports - trait definitions every storage backend must implement.
//! The async and blocking traits share method names and contracts; pick the
//! one matching the caller's execution context.

mod blocking;
mod storage;

pub use blocking::{MovingWindowStorage, Storage};
pub use storage::{AsyncMovingWindowStorage, AsyncStorage};
