//! The usage-tracking event shape sent to the ingest endpoint.

use serde::{Deserialize, Serialize};

use crate::core::data::Source;
use crate::core::metrics::CacheStatus;

/// One `FLAGS_CONFIG_READ` telemetry event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    #[serde(rename = "type")]
    pub event_type: UsageEventType,
    /// Unix epoch milliseconds.
    pub ts: f64,
    pub payload: UsagePayload,
}

/// Closed set of usage event types. Currently only one is defined; the
/// enum exists so the wire shape can grow without breaking callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UsageEventType {
    FlagsConfigRead,
}

/// Payload for a [`UsageEventType::FlagsConfigRead`] event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsagePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub invocation_host: Option<String>,
    pub vercel_request_id: String,
    pub cache_status: CacheStatus,
    pub cache_is_blocking: bool,
    pub cache_is_first_read: bool,
    pub duration: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_updated_at: Option<f64>,
    pub config_origin: Source,
}

impl UsageEvent {
    /// Build a `FLAGS_CONFIG_READ` event at the given timestamp (millis
    /// since epoch, supplied by the caller since `Host` owns the clock).
    pub fn config_read(ts_millis: f64, payload: UsagePayload) -> Self {
        Self {
            event_type: UsageEventType::FlagsConfigRead,
            ts: ts_millis,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_event_type_as_screaming_snake_case() {
        let event = UsageEvent::config_read(
            0.0,
            UsagePayload {
                deployment_id: None,
                region: None,
                invocation_host: None,
                vercel_request_id: "req_1".into(),
                cache_status: CacheStatus::Hit,
                cache_is_blocking: false,
                cache_is_first_read: true,
                duration: 1.0,
                config_updated_at: Some(1.0),
                config_origin: Source::InMemory,
            },
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"FLAGS_CONFIG_READ\""));
        assert!(json.contains("req_1"));
    }
}
