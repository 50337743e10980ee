//! Key namespace shared by all engine-owned keys.

use std::fmt;

use crate::error::StorageError;

/// Prefix every rate-limit key is expected to start with.
pub const DEFAULT_KEY_PREFIX: &str = "LIMITER";

/// A validated literal key prefix.
///
/// The prefix is embedded verbatim in a Redis glob (`LIMITER*`) and in an
/// anchored MongoDB regex (`^LIMITER`), so it is restricted to characters
/// that carry no meaning in either syntax.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPrefix(String);

impl KeyPrefix {
    pub fn new(prefix: impl Into<String>) -> Result<Self, StorageError> {
        let prefix = prefix.into();
        if prefix.is_empty() {
            return Err(StorageError::Configuration(
                "Key prefix must not be empty".to_string(),
            ));
        }

        if let Some(c) = prefix
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':' | '.')))
        {
            return Err(StorageError::Configuration(format!(
                "Key prefix {prefix:?} contains unsupported character {c:?}"
            )));
        }

        Ok(Self(prefix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Glob pattern matching every key under this prefix.
    pub fn glob(&self) -> String {
        format!("{}*", self.0)
    }

    /// Regex matching every key under this prefix.
    pub fn anchored_regex(&self) -> String {
        format!("^{}", self.0.replace('.', r"\."))
    }

    pub fn owns(&self, key: &str) -> bool {
        key.starts_with(&self.0)
    }
}

impl Default for KeyPrefix {
    fn default() -> Self {
        Self(DEFAULT_KEY_PREFIX.to_string())
    }
}

impl fmt::Display for KeyPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_prefix() {
        let prefix = KeyPrefix::default();
        assert_eq!(prefix.as_str(), "LIMITER");
        assert_eq!(prefix.glob(), "LIMITER*");
        assert_eq!(prefix.anchored_regex(), "^LIMITER");
    }

    #[test]
    fn test_owns() {
        let prefix = KeyPrefix::default();
        assert!(prefix.owns("LIMITER/user:42/login"));
        assert!(!prefix.owns("session:42"));
        assert!(!prefix.owns("limiter/user:42"));
    }

    #[test]
    fn test_rejects_glob_and_regex_metacharacters() {
        for bad in ["", "LIMIT*", "LIM?TER", "[LIMITER]", "LIMITER$", "a b"] {
            let err = KeyPrefix::new(bad).unwrap_err();
            assert!(err.is_configuration(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_dot_is_escaped_in_regex() {
        let prefix = KeyPrefix::new("app.limits:").unwrap();
        assert_eq!(prefix.glob(), "app.limits:*");
        assert_eq!(prefix.anchored_regex(), r"^app\.limits:");
    }
}
