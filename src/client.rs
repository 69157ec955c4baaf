//! The Client Façade: the only type consumers bind against.
//!
//! Wraps a [`Controller`] with a monotonic instance id, idempotent
//! `initialize()`, and `evaluate()` — which auto-initializes on first call
//! and delegates to an injected [`Evaluator`] with the current datafile.
//! Evaluation itself (targeting rules, splits, segments) is an external
//! collaborator; this façade only calls through that seam.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use crate::controller::{Controller, ControllerOptions};
use crate::core::data::{Datafile, Source};
use crate::core::error::{FlagsError, Result};
use crate::core::evaluation::{ErrorCode, EvaluationResult, Reason};
use crate::core::metrics::{CacheStatus, ConnectionState, Metrics, Mode};
use crate::host::Host;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Evaluates a single flag definition against a set of entities.
///
/// Out of scope for this repository (see `SPEC_FULL.md` §1): targeting
/// rules, percentage splits, and segment matching are a pure function of
/// `(definition, entities, environment, segments)` supplied by the host
/// application. [`RawDefinitionEvaluator`] is a usable default that returns
/// the flag's raw definition verbatim, for callers who only need access to
/// the synchronized datafile.
pub trait Evaluator: Send + Sync {
    fn evaluate(
        &self,
        datafile: &Datafile,
        flag_key: &str,
        entities: Option<&serde_json::Value>,
    ) -> EvaluatorOutcome;
}

/// What an [`Evaluator`] produced for one flag.
pub struct EvaluatorOutcome {
    pub value: Option<serde_json::Value>,
    pub reason: Reason,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
}

/// Returns the raw `FlagDefinition` for `flag_key`, with `reason = Static`.
/// No targeting, splits, or segments are evaluated.
pub struct RawDefinitionEvaluator;

impl Evaluator for RawDefinitionEvaluator {
    fn evaluate(
        &self,
        datafile: &Datafile,
        flag_key: &str,
        _entities: Option<&serde_json::Value>,
    ) -> EvaluatorOutcome {
        match datafile.get(flag_key) {
            Some(def) => EvaluatorOutcome {
                value: Some(def.clone()),
                reason: Reason::Static,
                error_code: None,
                error_message: None,
            },
            None => EvaluatorOutcome {
                value: None,
                reason: Reason::Error,
                error_code: Some(ErrorCode::FlagNotFound),
                error_message: Some(format!("flag not found: {flag_key}")),
            },
        }
    }
}

/// Public client façade. Cheap to clone via `Arc`; one instance per SDK key
/// per process is the intended usage (see `factory.rs`).
pub struct Client {
    id: u64,
    controller: Arc<Controller>,
    evaluator: Arc<dyn Evaluator>,
    initialized: AtomicBool,
    init_lock: Mutex<()>,
    request_counter: AtomicU64,
}

impl Client {
    /// Build a client with the default [`RawDefinitionEvaluator`].
    pub fn new(options: ControllerOptions, host: Arc<dyn Host>) -> Self {
        Self::with_evaluator(options, host, Arc::new(RawDefinitionEvaluator))
    }

    /// Build a client with an explicit evaluator (host applications with a
    /// real targeting/splits engine inject it here).
    pub fn with_evaluator(options: ControllerOptions, host: Arc<dyn Host>, evaluator: Arc<dyn Evaluator>) -> Self {
        Self {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            controller: Arc::new(Controller::new(options, host)),
            evaluator,
            initialized: AtomicBool::new(false),
            init_lock: Mutex::new(()),
            request_counter: AtomicU64::new(0),
        }
    }

    /// Monotonic id assigned at construction, unique within the process.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Drive the controller to a steady state. Concurrent callers
    /// serialize on the init lock rather than racing the controller;
    /// once `initialized` flips, later calls are O(1).
    pub async fn initialize(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.init_lock.lock().await;
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.controller.initialize().await?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.initialize().await
    }

    /// Evaluate `flag_key`, auto-initializing on first call. Generates a
    /// fresh per-call request nonce; callers running inside a host request
    /// context that wants dedup across multiple `evaluate()` calls in the
    /// same request should use [`Client::evaluate_for_request`] instead.
    ///
    /// Returns `Err` only for fatal datafile unavailability (no data has
    /// ever been admitted, or the controller is shut down) when no
    /// `default_value` was supplied; flag-level problems (unknown key, type
    /// mismatch) are always reported as a structured `EvaluationResult`.
    pub async fn evaluate<T: DeserializeOwned>(
        &self,
        flag_key: &str,
        default_value: Option<T>,
        entities: Option<serde_json::Value>,
    ) -> Result<EvaluationResult<T>> {
        let nonce = format!("client-{}-{}", self.id, self.request_counter.fetch_add(1, Ordering::Relaxed));
        self.evaluate_for_request(flag_key, default_value, entities, &nonce).await
    }

    /// Evaluate `flag_key` under an explicit request nonce, so that
    /// multiple calls sharing the same host request are deduplicated by
    /// the usage tracker (§4.6).
    pub async fn evaluate_for_request<T: DeserializeOwned>(
        &self,
        flag_key: &str,
        default_value: Option<T>,
        entities: Option<serde_json::Value>,
        request_nonce: &str,
    ) -> Result<EvaluationResult<T>> {
        if let Err(e) = self.ensure_initialized().await {
            return fatal_or_structured(e, default_value);
        }

        let read = match self.controller.read(request_nonce).await {
            Ok(read) => read,
            Err(e) => return fatal_or_structured(e, default_value),
        };

        let outcome = self.evaluator.evaluate(&read.datafile, flag_key, entities.as_ref());
        Ok(match outcome.value {
            Some(json) => match serde_json::from_value::<T>(json) {
                Ok(value) => EvaluationResult::ok(value, outcome.reason, read.metrics),
                Err(e) => EvaluationResult::error(ErrorCode::TypeMismatch, e.to_string(), default_value, read.metrics),
            },
            None => EvaluationResult::error(
                outcome.error_code.unwrap_or(ErrorCode::FlagNotFound),
                outcome
                    .error_message
                    .unwrap_or_else(|| format!("flag not found: {flag_key}")),
                default_value,
                read.metrics,
            ),
        })
    }

    /// Passthrough to `Controller::get_datafile` (never opens a stream).
    pub async fn get_datafile(&self) -> Result<Datafile> {
        Ok(self.controller.get_datafile().await?.datafile)
    }

    /// Passthrough to `Controller::get_fallback_datafile`.
    pub fn get_fallback_datafile(&self) -> Result<Datafile> {
        self.controller.get_fallback_datafile()
    }

    /// Stop both sources, reset the cache, flush telemetry, and clear the
    /// initialized flag so a later `initialize()` reinitializes cleanly.
    pub async fn shutdown(&self) {
        self.controller.shutdown().await;
        self.initialized.store(false, Ordering::SeqCst);
    }
}

fn classify_error(e: &FlagsError) -> ErrorCode {
    match e {
        FlagsError::NoDataAvailable => ErrorCode::NoDataAvailable,
        FlagsError::ShutDown => ErrorCode::ShutDown,
        FlagsError::FlagNotFound(_) => ErrorCode::FlagNotFound,
        FlagsError::TypeMismatch(_) => ErrorCode::TypeMismatch,
        _ => ErrorCode::NoDataAvailable,
    }
}

/// Whether `e` is the fatal-unavailability class the façade is allowed to
/// propagate as `Err` (no datafile has ever been admitted, or the
/// controller has been shut down).
fn is_fatal_unavailability(e: &FlagsError) -> bool {
    matches!(e, FlagsError::NoDataAvailable | FlagsError::ShutDown)
}

/// `e` propagates as `Err` only when it is fatal-unavailability and the
/// caller supplied no default; otherwise it is reported as a structured
/// `EvaluationResult` falling back to `default_value`.
fn fatal_or_structured<T>(e: FlagsError, default_value: Option<T>) -> Result<EvaluationResult<T>> {
    if is_fatal_unavailability(&e) && default_value.is_none() {
        return Err(e);
    }
    Ok(EvaluationResult::error(classify_error(&e), e.to_string(), default_value, offline_metrics()))
}

fn offline_metrics() -> Metrics {
    Metrics::new(
        Duration::ZERO,
        Source::Embedded,
        CacheStatus::Miss,
        ConnectionState::Disconnected,
        Mode::Offline,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::TestHost;

    fn opts() -> ControllerOptions {
        ControllerOptions::new("vf_test")
            .unwrap()
            .with_datafile(Datafile::empty("production"))
    }

    #[tokio::test]
    async fn evaluate_auto_initializes_and_returns_raw_definition() {
        let mut datafile = Datafile::empty("production");
        datafile
            .definitions
            .insert("my-flag".to_string(), serde_json::json!(true));
        let options = disable_sources(opts().with_datafile(datafile));

        let host = Arc::new(TestHost::new());
        let client = Client::new(options, host);

        let result = client.evaluate::<bool>("my-flag", None, None).await.unwrap();
        assert_eq!(result.value, Some(true));
        assert_eq!(result.reason, Reason::Static);
    }

    #[tokio::test]
    async fn evaluate_missing_flag_falls_back_to_default() {
        let options = disable_sources(opts());
        let host = Arc::new(TestHost::new());
        let client = Client::new(options, host);

        let result = client.evaluate::<bool>("absent", Some(false), None).await.unwrap();
        assert_eq!(result.value, Some(false));
        assert_eq!(result.error_code, Some(ErrorCode::FlagNotFound));
    }

    #[tokio::test]
    async fn evaluate_propagates_err_for_fatal_unavailability_without_default() {
        let mut options = ControllerOptions::new("vf_test").unwrap().with_host("http://127.0.0.1:1");
        options.stream.init_timeout = Duration::from_millis(50);
        options.polling.enabled = false;
        let host = Arc::new(TestHost::new());
        let client = Client::new(options, host);

        let result = client.evaluate::<bool>("any-flag", None, None).await;
        assert!(matches!(result, Err(FlagsError::NoDataAvailable)));
    }

    #[tokio::test]
    async fn evaluate_with_default_value_does_not_propagate_fatal_err() {
        let mut options = ControllerOptions::new("vf_test").unwrap().with_host("http://127.0.0.1:1");
        options.stream.init_timeout = Duration::from_millis(50);
        options.polling.enabled = false;
        let host = Arc::new(TestHost::new());
        let client = Client::new(options, host);

        let result = client.evaluate::<bool>("any-flag", Some(true), None).await.unwrap();
        assert_eq!(result.value, Some(true));
        assert_eq!(result.error_code, Some(ErrorCode::NoDataAvailable));
    }

    #[tokio::test]
    async fn concurrent_initialize_calls_are_idempotent() {
        let options = disable_sources(opts());
        let host = Arc::new(TestHost::new());
        let client = Arc::new(Client::new(options, host));

        let a = { let c = client.clone(); tokio::spawn(async move { c.initialize().await }) };
        let b = { let c = client.clone(); tokio::spawn(async move { c.initialize().await }) };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
    }

    fn disable_sources(mut options: ControllerOptions) -> ControllerOptions {
        options.stream.enabled = false;
        options.polling.enabled = false;
        options
    }
}
