//! Metrics returned alongside every read.
//!
//! Every `Controller::read`/`get_datafile` call returns a [`Metrics`] bag
//! describing how the read was served, so callers (and the usage tracker)
//! can distinguish a warm cache hit from a degraded fallback.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::data::Source;

/// Whether the read was served from a live cache, a degraded cache, or had
/// to materialize data from a non-cache path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheStatus {
    /// Served from an in-memory cache while the primary source is live.
    Hit,
    /// The read had to materialize data from a non-cache path (initial
    /// fallback chain, build-step resolution, one-shot fetch).
    Miss,
    /// Served from cache while disconnected/degraded.
    Stale,
}

impl CacheStatus {
    /// Whether this status represents a cache hit of any kind (`Hit` or
    /// `Stale`), i.e. no network round-trip was needed to serve the read.
    #[inline]
    pub fn is_cached(&self) -> bool {
        matches!(self, Self::Hit | Self::Stale)
    }
}

/// Whether the primary source currently has a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// The primary source has delivered data and is currently connected.
    Connected,
    /// The primary source is not currently connected (degraded, build
    /// step, or not yet initialized).
    #[default]
    Disconnected,
}

impl ConnectionState {
    /// Convenience constructor from a `bool`.
    #[inline]
    pub fn from_connected(connected: bool) -> Self {
        if connected {
            Self::Connected
        } else {
            Self::Disconnected
        }
    }

    /// Whether the state is `Connected`.
    #[inline]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// The Controller's operating mode at the time of a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// The stream source is the live primary.
    Streaming,
    /// The polling source is the live primary.
    Polling,
    /// No primary source is live; serving from cache or a fallback.
    Offline,
    /// Running in the build step (no long-lived process).
    Build,
}

/// Metrics returned with every read, describing how it was served.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Wall time for the read, in milliseconds.
    pub read_ms: f64,
    /// Where the served datafile lives.
    pub source: Source,
    /// Cache-hit classification for this read.
    pub cache_status: CacheStatus,
    /// Whether the primary source is currently connected.
    pub connection_state: ConnectionState,
    /// The Controller's operating mode at the time of the read.
    pub mode: Mode,
}

impl Metrics {
    /// Build a metrics bag, computing `read_ms` from the given start
    /// instant (or `Duration`, for test determinism via the `Host` clock).
    pub fn new(
        elapsed: Duration,
        source: Source,
        cache_status: CacheStatus,
        connection_state: ConnectionState,
        mode: Mode,
    ) -> Self {
        Self {
            read_ms: elapsed.as_secs_f64() * 1000.0,
            source,
            cache_status,
            connection_state,
            mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_status_is_cached() {
        assert!(CacheStatus::Hit.is_cached());
        assert!(CacheStatus::Stale.is_cached());
        assert!(!CacheStatus::Miss.is_cached());
    }

    #[test]
    fn connection_state_from_bool() {
        assert_eq!(
            ConnectionState::from_connected(true),
            ConnectionState::Connected
        );
        assert_eq!(
            ConnectionState::from_connected(false),
            ConnectionState::Disconnected
        );
    }

    #[test]
    fn metrics_computes_read_ms_from_duration() {
        let m = Metrics::new(
            Duration::from_millis(250),
            Source::InMemory,
            CacheStatus::Hit,
            ConnectionState::Connected,
            Mode::Streaming,
        );
        assert!((m.read_ms - 250.0).abs() < 1e-6);
    }
}
