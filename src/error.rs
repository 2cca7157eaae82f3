//! Structured error taxonomy shared by every component in the crate.

use std::fmt;

use crate::metadata::CacheKey;

/// Closed set of error kinds surfaced by cache operations.
///
/// Every facade entry point normalizes whatever a provider or fetcher threw
/// into one of these kinds before it reaches a caller or an [`EventKind::Error`]
/// event.
///
/// [`EventKind::Error`]: crate::events::EventKind::Error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Catch-all for values that did not already carry a structured kind.
    Unknown,
    /// A lookup found nothing for the given key.
    NotFound,
    /// A caller-supplied argument failed a basic shape check.
    InvalidArgument,
    /// A key was empty, all-whitespace, or otherwise malformed.
    InvalidKey,
    /// A key exceeded the 1024-byte length limit.
    KeyTooLong,
    /// An options struct failed validation.
    InvalidOptions,
    /// A TTL value was negative or otherwise out of range.
    InvalidTtl,
    /// A value failed a provider's acceptance check (e.g. too large).
    InvalidValue,
    /// An operation was attempted from a state that forbids it.
    InvalidState,
    /// An operation exceeded its deadline.
    Timeout,
    /// A storage provider reported a failure.
    ProviderError,
    /// No provider was available to service the request.
    NoProvider,
    /// The circuit for a provider or key is open.
    CircuitOpen,
    /// Encoding a value to bytes failed.
    SerializationError,
    /// Decoding bytes into a value failed.
    DeserializationError,
    /// Compressing or decompressing a payload failed.
    CompressionError,
    /// Decompressed or decoded data failed an integrity check.
    DataIntegrityError,
    /// A generic operation failure not covered by a more specific kind.
    OperationError,
    /// A batch operation partially or fully failed.
    BatchError,
    /// A rate limit was exceeded.
    RateLimitExceeded,
    /// A network-level failure occurred talking to a provider.
    NetworkError,
    /// The operation was cancelled cooperatively.
    OperationAborted,
}

impl ErrorKind {
    /// Short machine-readable name, stable across versions.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::NotFound => "not_found",
            Self::InvalidArgument => "invalid_argument",
            Self::InvalidKey => "invalid_key",
            Self::KeyTooLong => "key_too_long",
            Self::InvalidOptions => "invalid_options",
            Self::InvalidTtl => "invalid_ttl",
            Self::InvalidValue => "invalid_value",
            Self::InvalidState => "invalid_state",
            Self::Timeout => "timeout",
            Self::ProviderError => "provider_error",
            Self::NoProvider => "no_provider",
            Self::CircuitOpen => "circuit_open",
            Self::SerializationError => "serialization_error",
            Self::DeserializationError => "deserialization_error",
            Self::CompressionError => "compression_error",
            Self::DataIntegrityError => "data_integrity_error",
            Self::OperationError => "operation_error",
            Self::BatchError => "batch_error",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::NetworkError => "network_error",
            Self::OperationAborted => "operation_aborted",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A structured error carrying the failure kind plus whatever context was
/// available at the call site.
#[derive(Debug, thiserror::Error, Clone)]
#[error("{kind}: {message}")]
pub struct CacheError {
    /// Which of the closed set of kinds this error belongs to.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// The facade/provider operation that raised this error, if known.
    pub operation: Option<&'static str>,
    /// The key involved, if any.
    pub key: Option<CacheKey>,
    /// The provider involved, if any.
    pub provider: Option<String>,
    /// Free-form extra context (e.g. a provider's raw error text).
    pub context: Option<String>,
}

impl CacheError {
    /// Build a bare error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            operation: None,
            key: None,
            provider: None,
            context: None,
        }
    }

    /// Attach the operation name (e.g. `"get"`, `"set"`).
    #[must_use]
    pub fn with_operation(mut self, operation: &'static str) -> Self {
        self.operation = Some(operation);
        self
    }

    /// Attach the key the operation was acting on.
    #[must_use]
    pub fn with_key(mut self, key: CacheKey) -> Self {
        self.key = Some(key);
        self
    }

    /// Attach the provider name the error originated from.
    #[must_use]
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Attach free-form context.
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Shorthand for `CacheError::new(ErrorKind::NotFound, ..)`.
    pub fn not_found(key: CacheKey) -> Self {
        Self::new(ErrorKind::NotFound, format!("no entry for key {key}")).with_key(key)
    }

    /// Shorthand for an invalid-key error.
    pub fn invalid_key(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidKey, reason)
    }

    /// Shorthand for a key-too-long error.
    pub fn key_too_long(len: usize, max: usize) -> Self {
        Self::new(
            ErrorKind::KeyTooLong,
            format!("key length {len} exceeds maximum of {max}"),
        )
    }

    /// Shorthand for a timeout error.
    pub fn timeout(operation: &'static str) -> Self {
        Self::new(ErrorKind::Timeout, format!("{operation} timed out")).with_operation(operation)
    }

    /// Shorthand for "no provider could service this request".
    pub fn no_provider() -> Self {
        Self::new(ErrorKind::NoProvider, "no provider available")
    }

    /// Wrap an arbitrary error as `ErrorKind::Unknown`, preserving its text.
    pub fn unknown(err: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Unknown, err.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type CacheResult<T> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let err = CacheError::new(ErrorKind::Timeout, "deadline exceeded");
        assert_eq!(err.to_string(), "timeout: deadline exceeded");
    }

    #[test]
    fn builder_methods_chain() {
        let key = CacheKey::new("u:42").unwrap();
        let err = CacheError::not_found(key.clone())
            .with_operation("get")
            .with_provider("memory");
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert_eq!(err.key, Some(key));
        assert_eq!(err.operation, Some("get"));
        assert_eq!(err.provider.as_deref(), Some("memory"));
    }
}
