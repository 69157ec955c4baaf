//! The result of evaluating a single flag: the value returned to the
//! caller, plus the reason code and metrics describing how it was produced.
//!
//! Evaluation itself (matching targeting rules, splits, segments) is an
//! external collaborator — this module only defines the shape of its
//! output.

use serde::{Deserialize, Serialize};

use crate::core::metrics::Metrics;

/// The outcome of evaluating one flag for one set of entities.
///
/// `value` is `None` only when [`Reason::Error`] or [`Reason::Disabled`]
/// applies and no default value was supplied for the call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult<T> {
    /// The resolved value, or `None` if evaluation could not produce one.
    pub value: Option<T>,

    /// Why this value (or lack of one) was produced.
    pub reason: Reason,

    /// Set alongside `reason = Error`; classifies the failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,

    /// Human-readable detail for `error_code`, not meant to be parsed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Metrics describing the read that produced this result.
    pub metrics: Metrics,
}

impl<T> EvaluationResult<T> {
    /// Build a successful evaluation result.
    pub fn ok(value: T, reason: Reason, metrics: Metrics) -> Self {
        Self {
            value: Some(value),
            reason,
            error_code: None,
            error_message: None,
            metrics,
        }
    }

    /// Build an error evaluation result, falling back to `default_value` if
    /// one was supplied by the caller.
    pub fn error(
        code: ErrorCode,
        message: impl Into<String>,
        default_value: Option<T>,
        metrics: Metrics,
    ) -> Self {
        Self {
            value: default_value,
            reason: Reason::Error,
            error_code: Some(code),
            error_message: Some(message.into()),
            metrics,
        }
    }

    /// Whether this result carries a usable value.
    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }
}

/// Why an [`EvaluationResult`] took the value it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    /// The flag resolved to a statically configured value (no rules).
    Static,
    /// A targeting rule matched a specific entity.
    TargetMatch,
    /// The entity fell into a percentage-rollout bucket.
    Split,
    /// The flag is paused; the configured paused value was returned.
    Paused,
    /// No rule matched; the flag's default value was returned.
    Default,
    /// Evaluation failed; see `error_code`/`error_message`.
    Error,
    /// The flag is disabled for this environment.
    Disabled,
}

/// Classifies why evaluation produced [`Reason::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The requested key has no definition in the current datafile.
    FlagNotFound,
    /// The flag definition itself could not be parsed.
    ParseError,
    /// The stored value could not be coerced to the requested type.
    TypeMismatch,
    /// No datafile has ever been admitted to the cache.
    NoDataAvailable,
    /// The controller has been shut down.
    ShutDown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::Source;
    use crate::core::metrics::{CacheStatus, ConnectionState, Mode};
    use std::time::Duration;

    fn metrics() -> Metrics {
        Metrics::new(
            Duration::from_millis(5),
            Source::InMemory,
            CacheStatus::Hit,
            ConnectionState::Connected,
            Mode::Streaming,
        )
    }

    #[test]
    fn ok_result_has_no_error_code() {
        let r = EvaluationResult::ok(true, Reason::Static, metrics());
        assert_eq!(r.value, Some(true));
        assert!(r.error_code.is_none());
    }

    #[test]
    fn error_result_falls_back_to_default_value() {
        let r: EvaluationResult<bool> = EvaluationResult::error(
            ErrorCode::FlagNotFound,
            "flag not found: f",
            Some(false),
            metrics(),
        );
        assert_eq!(r.reason, Reason::Error);
        assert_eq!(r.value, Some(false));
        assert!(r.has_value());
    }

    #[test]
    fn error_result_without_default_has_no_value() {
        let r: EvaluationResult<bool> =
            EvaluationResult::error(ErrorCode::NoDataAvailable, "no data", None, metrics());
        assert!(!r.has_value());
    }
}
