//! Scheme-based backend registry.
//!
//! Maps the scheme of a connection URI (`redis`, `mongodb`, ...) to the
//! factory of the backend serving it. Backends register themselves once,
//! before the first lookup; lookups are pure functions of the scheme.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{Result, StorageError};

/// Extract the lowercased scheme of a connection URI.
///
/// ```
/// use limits_core::registry::scheme_of;
///
/// assert_eq!(scheme_of("redis+unix:///tmp/redis.sock").unwrap(), "redis+unix");
/// ```
pub fn scheme_of(uri: &str) -> Result<String> {
    match uri.split_once("://") {
        Some((scheme, _)) if !scheme.is_empty() => Ok(scheme.to_ascii_lowercase()),
        _ => Err(StorageError::Configuration(format!(
            "Storage URI {uri:?} has no scheme"
        ))),
    }
}

/// Scheme -> factory map.
pub struct SchemeRegistry<F> {
    backends: RwLock<HashMap<String, F>>,
}

impl<F: Clone> SchemeRegistry<F> {
    pub fn new() -> Self {
        Self {
            backends: RwLock::new(HashMap::new()),
        }
    }

    /// Register `factory` for every scheme in `schemes`.
    ///
    /// Nothing is registered if any of the schemes is already taken.
    pub fn register(&self, schemes: &[&str], factory: F) -> Result<()> {
        let mut backends = self.backends.write();

        if let Some(taken) = schemes
            .iter()
            .find(|s| backends.contains_key(&s.to_ascii_lowercase()))
        {
            return Err(StorageError::Configuration(format!(
                "Storage scheme {taken:?} is already registered"
            )));
        }

        for scheme in schemes {
            backends.insert(scheme.to_ascii_lowercase(), factory.clone());
        }

        Ok(())
    }

    /// Look up the factory serving `uri`.
    pub fn resolve(&self, uri: &str) -> Result<F> {
        let scheme = scheme_of(uri)?;
        self.backends
            .read()
            .get(&scheme)
            .cloned()
            .ok_or(StorageError::UnknownScheme(scheme))
    }

    pub fn contains(&self, scheme: &str) -> bool {
        self.backends
            .read()
            .contains_key(&scheme.to_ascii_lowercase())
    }

    /// Registered schemes, sorted.
    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.backends.read().keys().cloned().collect();
        schemes.sort();
        schemes
    }
}

impl<F: Clone> Default for SchemeRegistry<F> {
    fn default() -> Self {
        Self::new()
    }
}
