//! Per-request-deduplicated, batched usage telemetry.

pub mod dedup;
pub mod event;
pub mod tracker;

pub use event::{UsageEvent, UsageEventType, UsagePayload};
pub use tracker::{payload_from_host, UsageTracker};
