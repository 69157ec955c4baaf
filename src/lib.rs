//! # flags-core
//!
//! A datafile controller for a feature-flags client: fetches, streams,
//! caches, and gracefully degrades a remote flag datafile for near-zero-
//! latency local evaluation.
//!
//! The crate composes a long-lived push channel ([`sources::StreamSource`]),
//! a polling fallback ([`sources::PollingSource`]), a build-time bundled
//! snapshot ([`sources::BundledSource`]), and a per-request-deduplicated
//! usage telemetry sink ([`telemetry::UsageTracker`]), all coordinated
//! through an explicit state machine ([`controller::Controller`]) with a
//! single-writer cache.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use flags_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<()> {
//! let host: Arc<dyn Host> = Arc::new(ProcessHost::new()?);
//! let client = create_client("vf_abc123", host, |opts| opts)?;
//! client.initialize().await?;
//! let result = client.evaluate::<bool>("my-flag", Some(false), None).await?;
//! # Ok(())
//! # }
//! ```
//!
//! All touches of ambient process state (environment variables, SIGTERM,
//! the clock, the HTTP client) go through the injectable [`host::Host`]
//! seam; production code uses [`host::ProcessHost`], tests use
//! [`host::TestHost`].

pub mod client;
pub mod controller;
pub mod core;
pub mod factory;
pub mod host;
pub mod ndjson;
pub mod sources;
pub mod telemetry;

/// Sent as `User-Agent` on every outbound request (stream, fetch, ingest).
pub const USER_AGENT: &str = concat!("VercelFlagsCore/", env!("CARGO_PKG_VERSION"));

/// Convenient imports for consumers of this crate.
pub mod prelude {
    pub use crate::client::{Client, Evaluator, EvaluatorOutcome, RawDefinitionEvaluator};
    pub use crate::controller::{Controller, ControllerOptions, ControllerState, PollingOptions, StreamOptions};
    pub use crate::core::data::{Datafile, Origin, Source};
    pub use crate::core::error::{FlagsError, Result};
    pub use crate::core::evaluation::{ErrorCode, EvaluationResult, Reason};
    pub use crate::core::metrics::{CacheStatus, ConnectionState, Metrics, Mode};
    pub use crate::factory::{create_client, default_client, default_client_process_host, parse_sdk_key};
    pub use crate::host::{Host, ProcessHost, TestHost};
}

pub use crate::core::error::{FlagsError, Result};
