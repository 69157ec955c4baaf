//! Error types for the datafile controller.

use thiserror::Error;

/// A specialized Result type for controller operations.
pub type Result<T> = std::result::Result<T, FlagsError>;

/// The main error type for all controller operations.
///
/// Variants correspond to the error taxonomy in the design doc: what the
/// caller sees, not how a given source failed internally.
#[derive(Debug, Error)]
pub enum FlagsError {
    // === Auth ===
    /// The remote service rejected the SDK key (401). Terminal for the
    /// source that produced it.
    #[error("unauthorized: invalid or revoked SDK key")]
    Unauthorized,

    // === Config ===
    /// The SDK key or connection string failed validation.
    #[error("invalid SDK key: {0}")]
    InvalidSdkKey(String),

    /// A configuration value was out of range or malformed.
    #[error("configuration error: {0}")]
    Config(String),

    // === Transport / timeout ===
    /// A network or transport-level error (covers 5xx and connection
    /// failures); retryable per source-specific policy.
    #[error("transport error: {0}")]
    Transport(String),

    /// A source failed to deliver within its init timeout.
    #[error("timed out after {0}ms waiting for initial data")]
    Timeout(u64),

    /// The NDJSON body or JSON payload could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    // === Fallback exhaustion ===
    /// No bundled snapshot file is registered at all.
    #[error("no bundled snapshot available")]
    FallbackNotFoundError,

    /// A bundled snapshot file exists but has no entry for this SDK key.
    #[error("bundled snapshot has no entry for this SDK key")]
    FallbackEntryNotFoundError,

    /// Every source (stream, polling, bundled, one-shot fetch) failed.
    #[error("no flag definitions available")]
    NoDataAvailable,

    // === Evaluation-adjacent (surfaced via EvaluationResult, not Err,
    // except at the fatal per-call boundary documented in the façade) ===
    /// Requested flag key has no definition in the current datafile.
    #[error("flag not found: {0}")]
    FlagNotFound(String),

    /// The flag's stored value could not be coerced to the requested type.
    #[error("type mismatch evaluating flag: {0}")]
    TypeMismatch(String),

    // === Internal ===
    /// Internal invariant violation (bug).
    #[error("internal error: {0}")]
    Internal(String),

    /// The controller has been shut down.
    #[error("controller is shut down")]
    ShutDown,
}

impl FlagsError {
    /// Whether this error indicates the failing source should reconnect
    /// rather than give up permanently.
    pub fn needs_reconnect(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }

    /// Whether a one-shot operation (fetch, poll) should be retried.
    ///
    /// 401 and 4xx-other-than-429 are not retryable; 5xx/transport errors
    /// and timeouts are.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }

    /// Whether this error is fatal for the owning source (no further
    /// reconnect attempts should be made).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }

    /// Create a transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a parse error.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<reqwest::Error> for FlagsError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(0)
        } else {
            Self::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for FlagsError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn needs_reconnect_covers_transport_and_timeout() {
        assert!(FlagsError::transport("boom").needs_reconnect());
        assert!(FlagsError::Timeout(3000).needs_reconnect());
        assert!(!FlagsError::Unauthorized.needs_reconnect());
    }

    #[test]
    fn is_retryable_matches_transport_timeout_only() {
        assert!(FlagsError::transport("boom").is_retryable());
        assert!(!FlagsError::Unauthorized.is_retryable());
        assert!(!FlagsError::FlagNotFound("f".into()).is_retryable());
    }

    #[test]
    fn unauthorized_is_terminal() {
        assert!(FlagsError::Unauthorized.is_terminal());
        assert!(!FlagsError::transport("boom").is_terminal());
    }
}
