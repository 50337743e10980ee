//! # Limits Core
//!
//! The storage contract of the distributed rate limiter.
//! This crate holds the backend traits, the window-log algorithms and the
//! scheme registry, with zero network dependencies.

pub mod domain;
pub mod error;
pub mod ports;
pub mod registry;

pub use error::{Result, StorageError};
