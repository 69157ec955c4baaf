//! The injectable host seam.
//!
//! Every touch of global process state — environment variables, SIGTERM
//! registration, the wall clock, and the shared HTTP client — goes through
//! this trait. Production code uses [`ProcessHost`]; tests use [`TestHost`]
//! so that CI detection, signal delivery, elapsed time, and server
//! responses are all deterministic without real sleeps or real sockets.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

/// Recognized environment variables, consumed exclusively through [`Host`].
pub const ENV_FLAGS: &str = "FLAGS";
pub const ENV_CI: &str = "CI";
pub const ENV_NEXT_PHASE: &str = "NEXT_PHASE";
pub const ENV_VERCEL: &str = "VERCEL";
pub const ENV_VERCEL_DEPLOYMENT_ID: &str = "VERCEL_DEPLOYMENT_ID";
pub const ENV_VERCEL_REGION: &str = "VERCEL_REGION";
pub const ENV_VERCEL_ENV: &str = "VERCEL_ENV";
pub const ENV_DEBUG: &str = "DEBUG";

/// The boundary between the controller/sources/tracker and the ambient
/// process. No other module reads `std::env`, registers signal handlers,
/// reads the clock, or constructs a [`reqwest::Client`] directly.
#[async_trait]
pub trait Host: Send + Sync {
    /// Look up an environment variable by name.
    fn env(&self, key: &str) -> Option<String>;

    /// Whether this process is running a build step (`CI=1` or
    /// `NEXT_PHASE=phase-production-build`), unless overridden by explicit
    /// `ControllerOptions::build_step`.
    fn is_build_step(&self) -> bool {
        self.env(ENV_CI).as_deref() == Some("1")
            || self.env(ENV_NEXT_PHASE).as_deref() == Some("phase-production-build")
    }

    /// Whether debug-mode telemetry headers/logging should be enabled.
    fn is_debug(&self) -> bool {
        self.env(ENV_DEBUG).is_some()
    }

    /// The current instant, for computing elapsed durations. Overridden in
    /// tests to avoid real sleeps.
    fn now(&self) -> Instant;

    /// Resolve when the process receives a termination signal. Used by the
    /// Usage Tracker to trigger a best-effort flush.
    async fn terminate_signal(&self);

    /// The shared HTTP client used by sources and the tracker.
    fn http_client(&self) -> Arc<reqwest::Client>;
}

/// Production [`Host`] backed by `std::env`, `tokio::signal`, and a shared
/// `reqwest::Client`.
pub struct ProcessHost {
    client: Arc<reqwest::Client>,
}

impl ProcessHost {
    /// Build a `ProcessHost` with a fresh shared HTTP client.
    pub fn new() -> crate::core::Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| crate::core::FlagsError::internal(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
        })
    }
}

impl Default for ProcessHost {
    fn default() -> Self {
        Self::new().expect("failed to build default HTTP client")
    }
}

#[async_trait]
impl Host for ProcessHost {
    fn env(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn terminate_signal(&self) {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => tracing::warn!(error = %e, "failed to install termination signal handler"),
        }
    }

    fn http_client(&self) -> Arc<reqwest::Client> {
        Arc::clone(&self.client)
    }
}

/// Test [`Host`]: environment variables, clock, and termination are fully
/// under the test's control; no real sleeps or signals occur.
pub struct TestHost {
    env: dashmap::DashMap<String, String>,
    start: Instant,
    elapsed_override: std::sync::RwLock<Option<Duration>>,
    client: Arc<reqwest::Client>,
    terminate: tokio::sync::Notify,
}

impl TestHost {
    /// A `TestHost` with no environment variables set and a client with no
    /// special configuration (tests typically point it at a local mock
    /// server via `ControllerOptions::host`).
    pub fn new() -> Self {
        Self {
            env: dashmap::DashMap::new(),
            start: Instant::now(),
            elapsed_override: std::sync::RwLock::new(None),
            client: Arc::new(reqwest::Client::new()),
            terminate: tokio::sync::Notify::new(),
        }
    }

    /// Set an environment variable for this host.
    pub fn set_env(&self, key: impl Into<String>, value: impl Into<String>) -> &Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Force `now()` to report `start + elapsed` instead of real elapsed
    /// time, so timeout/backoff logic can be tested without real sleeps.
    pub fn set_elapsed(&self, elapsed: Duration) {
        *self.elapsed_override.write().unwrap() = Some(elapsed);
    }

    /// Fire the termination signal, unblocking any pending
    /// `terminate_signal()` awaits.
    pub fn fire_terminate(&self) {
        self.terminate.notify_waiters();
    }
}

impl Default for TestHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Host for TestHost {
    fn env(&self, key: &str) -> Option<String> {
        self.env.get(key).map(|v| v.clone())
    }

    fn now(&self) -> Instant {
        match *self.elapsed_override.read().unwrap() {
            Some(elapsed) => self.start + elapsed,
            None => Instant::now(),
        }
    }

    async fn terminate_signal(&self) {
        self.terminate.notified().await;
    }

    fn http_client(&self) -> Arc<reqwest::Client> {
        Arc::clone(&self.client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_step_detected_from_ci_env() {
        let host = TestHost::new();
        assert!(!host.is_build_step());
        host.set_env(ENV_CI, "1");
        assert!(host.is_build_step());
    }

    #[test]
    fn build_step_detected_from_next_phase() {
        let host = TestHost::new();
        host.set_env(ENV_NEXT_PHASE, "phase-production-build");
        assert!(host.is_build_step());
    }

    #[test]
    fn debug_mode_detected_from_env_presence() {
        let host = TestHost::new();
        assert!(!host.is_debug());
        host.set_env(ENV_DEBUG, "1");
        assert!(host.is_debug());
    }

    #[tokio::test]
    async fn terminate_signal_resolves_after_fire() {
        let host = Arc::new(TestHost::new());
        let waiter = {
            let host = Arc::clone(&host);
            tokio::spawn(async move {
                host.terminate_signal().await;
            })
        };
        host.fire_terminate();
        waiter.await.unwrap();
    }
}
