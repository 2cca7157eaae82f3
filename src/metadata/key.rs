//! Validated, cheaply-clonable cache key.

use std::fmt;
use std::sync::Arc;

use crate::error::{CacheError, CacheResult};

/// Maximum key length in bytes, per the data model.
pub const MAX_KEY_LEN: usize = 1024;

/// A non-empty string key, length <= 1024 bytes, opaque to the core.
///
/// Cloning is an `Arc` bump so the same key can be held cheaply in the
/// in-flight map, the refresh-task map, and fanned out across providers at
/// once.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    /// Validate and construct a key: non-empty, non-whitespace-only, and at
    /// most [`MAX_KEY_LEN`] bytes.
    pub fn new(raw: impl Into<Arc<str>>) -> CacheResult<Self> {
        let raw: Arc<str> = raw.into();
        if raw.trim().is_empty() {
            return Err(CacheError::invalid_key("key must not be empty or whitespace"));
        }
        if raw.len() > MAX_KEY_LEN {
            return Err(CacheError::key_too_long(raw.len(), MAX_KEY_LEN));
        }
        Ok(Self(raw))
    }

    /// Borrow the underlying string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_whitespace() {
        assert!(CacheKey::new("").is_err());
        assert!(CacheKey::new("   ").is_err());
    }

    #[test]
    fn boundary_length_exactly_1024_is_accepted() {
        let key = "a".repeat(MAX_KEY_LEN);
        assert!(CacheKey::new(key).is_ok());
    }

    #[test]
    fn boundary_length_1025_is_rejected() {
        let key = "a".repeat(MAX_KEY_LEN + 1);
        let err = CacheKey::new(key).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::KeyTooLong);
    }
}
