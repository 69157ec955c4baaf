//! Normalized controller configuration.
//!
//! Mirrors the gateway's TOML-config-normalization convention: a
//! constructor validates and fills defaults once, so the rest of the
//! system can treat [`ControllerOptions`] as already-correct.

use std::time::Duration;

use crate::core::data::Datafile;
use crate::core::error::{FlagsError, Result};

/// Default polling interval floor. `polling.interval` below this is an
/// error, not silently clamped — silent clamping would mask a
/// misconfiguration that costs the caller request volume.
pub const MIN_POLLING_INTERVAL: Duration = Duration::from_millis(30_000);

const DEFAULT_STREAM_INIT_TIMEOUT: Duration = Duration::from_millis(3_000);
const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_millis(30_000);
const DEFAULT_POLLING_INIT_TIMEOUT: Duration = Duration::from_millis(3_000);
const DEFAULT_HOST: &str = "https://flags.vercel.com";

/// Stream source configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamOptions {
    /// Whether the stream source is used at all.
    pub enabled: bool,
    /// How long `initialize()` waits for the first datafile before falling
    /// back, without killing the underlying connection attempt.
    pub init_timeout: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            init_timeout: DEFAULT_STREAM_INIT_TIMEOUT,
        }
    }
}

/// Polling source configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PollingOptions {
    /// Whether the polling source may run (as primary or as a secondary
    /// after a stream disconnect).
    pub enabled: bool,
    /// Interval between polls; floored at [`MIN_POLLING_INTERVAL`].
    pub interval: Duration,
    /// How long `initialize()` waits for the first poll before falling
    /// back, when polling is primary.
    pub init_timeout: Duration,
}

impl Default for PollingOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: DEFAULT_POLLING_INTERVAL,
            init_timeout: DEFAULT_POLLING_INIT_TIMEOUT,
        }
    }
}

/// Fully normalized controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Bearer credential for the remote service, must start with `vf_`.
    pub sdk_key: String,
    /// A datafile supplied directly by the caller; seeds the cache
    /// immediately and is used as the primary source at the build step.
    pub datafile: Option<Datafile>,
    /// Stream source configuration.
    pub stream: StreamOptions,
    /// Polling source configuration.
    pub polling: PollingOptions,
    /// Whether this process is a build step. `None` autodetects via
    /// `Host::is_build_step()`.
    pub build_step: Option<bool>,
    /// Base URL of the remote service.
    pub host: String,
}

impl ControllerOptions {
    /// Validate and normalize options for a given SDK key.
    pub fn new(sdk_key: impl Into<String>) -> Result<Self> {
        let sdk_key = sdk_key.into();
        if !sdk_key.starts_with("vf_") {
            return Err(FlagsError::InvalidSdkKey(sdk_key));
        }
        Ok(Self {
            sdk_key,
            datafile: None,
            stream: StreamOptions::default(),
            polling: PollingOptions::default(),
            build_step: None,
            host: DEFAULT_HOST.to_string(),
        })
    }

    /// Seed the cache with a caller-supplied datafile.
    pub fn with_datafile(mut self, datafile: Datafile) -> Self {
        self.datafile = Some(datafile);
        self
    }

    /// Override stream configuration.
    pub fn with_stream(mut self, stream: StreamOptions) -> Self {
        self.stream = stream;
        self
    }

    /// Override polling configuration, enforcing the interval floor.
    pub fn with_polling(mut self, polling: PollingOptions) -> Result<Self> {
        if polling.interval < MIN_POLLING_INTERVAL {
            return Err(FlagsError::config(format!(
                "polling interval {:?} is below the {:?} floor",
                polling.interval, MIN_POLLING_INTERVAL
            )));
        }
        self.polling = polling;
        Ok(self)
    }

    /// Force build-step behavior instead of autodetecting.
    pub fn with_build_step(mut self, build_step: bool) -> Self {
        self.build_step = Some(build_step);
        self
    }

    /// Override the remote service base URL (tests point this at a mock
    /// server).
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_sdk_key_without_prefix() {
        let err = ControllerOptions::new("not-a-key").unwrap_err();
        assert!(matches!(err, FlagsError::InvalidSdkKey(_)));
    }

    #[test]
    fn accepts_well_formed_sdk_key_with_defaults() {
        let opts = ControllerOptions::new("vf_abc123").unwrap();
        assert!(opts.stream.enabled);
        assert!(opts.polling.enabled);
        assert_eq!(opts.polling.interval, DEFAULT_POLLING_INTERVAL);
        assert_eq!(opts.host, DEFAULT_HOST);
    }

    #[test]
    fn rejects_polling_interval_below_floor() {
        let opts = ControllerOptions::new("vf_abc123").unwrap();
        let err = opts
            .with_polling(PollingOptions {
                enabled: true,
                interval: Duration::from_millis(1000),
                init_timeout: DEFAULT_POLLING_INIT_TIMEOUT,
            })
            .unwrap_err();
        assert!(matches!(err, FlagsError::Config(_)));
    }
}
