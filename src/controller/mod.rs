//! The Controller: selects one primary source, wires its events, owns the
//! single cached datafile, enforces monotonicity, and serves reads with
//! metrics.

pub mod options;
pub mod state;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

pub use options::{ControllerOptions, PollingOptions, StreamOptions};
pub use state::ControllerState;

use crate::core::data::{is_newer, Datafile, Origin, TaggedDatafile};
use crate::core::error::{FlagsError, Result};
use crate::core::metrics::{CacheStatus, ConnectionState, Metrics, Mode};
use crate::core::traits::{source_event_channel, SourceEvent, SourceEventReceiver};
use crate::host::Host;
use crate::sources::{BundledSource, InMemoryBundledRegistry, PollingSource, StreamSource};
use crate::telemetry::{payload_from_host, UsageTracker};

/// A datafile plus the metrics describing how the read that produced it
/// was served.
#[derive(Debug, Clone)]
pub struct DatafileRead {
    pub datafile: Datafile,
    pub metrics: Metrics,
}

/// The Controller: one instance per process per SDK key.
///
/// `data`/`connected`/`mode`/`shut_down` are each wrapped in their own
/// `Arc` (rather than one `Arc<Controller>`) so that the event-drain task
/// spawned per source can hold owned clones without requiring the whole
/// Controller, and without `Controller` itself needing to be `'static`.
pub struct Controller {
    options: ControllerOptions,
    host: Arc<dyn Host>,
    state: Arc<Mutex<ControllerState>>,
    data: Arc<RwLock<Option<TaggedDatafile>>>,
    connected: Arc<AtomicBool>,
    mode: Arc<Mutex<Mode>>,
    stream: StreamSource,
    polling: Arc<PollingSource>,
    bundled: BundledSource,
    tracker: Arc<UsageTracker>,
    drain_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    shut_down: Arc<AtomicBool>,
    /// Set while the polling source is running as a secondary feed behind
    /// a disconnected stream (state diagram: `streaming -disconnect->
    /// degraded (and start_interval if polling.enabled -> polling)`).
    secondary_polling_active: Arc<AtomicBool>,
}

/// State shared with a drain task, cloned out of the owning `Controller` so
/// the task can run detached without borrowing it.
#[derive(Clone)]
struct DrainContext {
    data: Arc<RwLock<Option<TaggedDatafile>>>,
    connected: Arc<AtomicBool>,
    mode: Arc<Mutex<Mode>>,
    shut_down: Arc<AtomicBool>,
    state: Arc<Mutex<ControllerState>>,
    polling: Arc<PollingSource>,
    polling_enabled: bool,
    secondary_polling_active: Arc<AtomicBool>,
    drain_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

/// Drain one source's event channel, applying data through the
/// monotonicity guard and reacting to connect/disconnect.
///
/// A stream `Disconnected` event starts polling as a secondary feed when
/// `polling.enabled` (state diagram: `streaming -disconnect-> degraded
/// (and start_interval if polling.enabled -> polling)`); the corresponding
/// `Connected` event on the stream stops that secondary again. Polling is
/// never started this way when it is *already* primary (`polling_enabled`
/// is only consulted for `Origin::Stream` events).
async fn drain_loop(ctx: DrainContext, mut rx: SourceEventReceiver, origin: Origin) {
    while let Some(event) = rx.recv().await {
        if ctx.shut_down.load(Ordering::SeqCst) {
            return;
        }
        match event {
            SourceEvent::Data(incoming) => {
                let mut guard = ctx.data.write().await;
                let current_ts = guard.as_ref().and_then(|t| t.datafile.config_updated_at);
                if is_newer(current_ts, incoming.config_updated_at) {
                    *guard = Some(TaggedDatafile::new(incoming, origin));
                }
                drop(guard);
                if origin == Origin::Poll && ctx.secondary_polling_active.load(Ordering::SeqCst) {
                    *ctx.mode.lock().await = Mode::Polling;
                    *ctx.state.lock().await = ControllerState::Polling;
                }
            }
            SourceEvent::Connected => {
                ctx.connected.store(true, Ordering::SeqCst);
                let mut m = ctx.mode.lock().await;
                *m = match origin {
                    Origin::Stream => Mode::Streaming,
                    Origin::Poll => Mode::Polling,
                    _ => *m,
                };
                drop(m);
                if origin == Origin::Stream && ctx.secondary_polling_active.swap(false, Ordering::SeqCst) {
                    ctx.polling.stop().await;
                }
                match origin {
                    Origin::Stream => *ctx.state.lock().await = ControllerState::Streaming,
                    Origin::Poll => *ctx.state.lock().await = ControllerState::Polling,
                    _ => {}
                }
            }
            SourceEvent::Disconnected => {
                ctx.connected.store(false, Ordering::SeqCst);
                if origin == Origin::Stream {
                    if ctx.polling_enabled && !ctx.secondary_polling_active.swap(true, Ordering::SeqCst) {
                        *ctx.state.lock().await = ControllerState::Degraded;
                        let (tx, rx2) = source_event_channel();
                        let nested = ctx.clone();
                        let handle = tokio::spawn(drain_loop(nested, rx2, Origin::Poll));
                        ctx.drain_tasks.lock().await.push(handle);
                        ctx.polling.start_interval(tx).await;
                    } else {
                        *ctx.state.lock().await = ControllerState::Degraded;
                    }
                }
            }
            SourceEvent::Error(e) => {
                tracing::warn!(error = e, ?origin, "source reported error");
            }
        }
    }
}

impl Controller {
    /// Build a controller for the given (already-normalized) options.
    pub fn new(options: ControllerOptions, host: Arc<dyn Host>) -> Self {
        Self::with_bundled(options, host, Box::new(InMemoryBundledRegistry::empty()))
    }

    /// Build a controller with an explicit bundled-snapshot lookup (tests
    /// inject a populated registry to exercise the fallback chain).
    pub fn with_bundled(
        options: ControllerOptions,
        host: Arc<dyn Host>,
        bundled_lookup: Box<dyn crate::sources::BundledLookup>,
    ) -> Self {
        let stream = StreamSource::new(Arc::clone(&host), options.host.clone(), options.sdk_key.clone());
        let polling = PollingSource::new(
            Arc::clone(&host),
            options.host.clone(),
            options.sdk_key.clone(),
            options.polling.interval,
        );
        let bundled = BundledSource::new(options.sdk_key.clone(), bundled_lookup);
        let tracker = Arc::new(UsageTracker::new(
            Arc::clone(&host),
            options.host.clone(),
            options.sdk_key.clone(),
        ));
        let terminate_tracker = Arc::clone(&tracker);
        tokio::spawn(async move { terminate_tracker.flush_on_terminate().await });

        Self {
            options,
            host,
            state: Arc::new(Mutex::new(ControllerState::Idle)),
            data: Arc::new(RwLock::new(None)),
            connected: Arc::new(AtomicBool::new(false)),
            mode: Arc::new(Mutex::new(Mode::Offline)),
            stream,
            polling: Arc::new(polling),
            bundled,
            tracker,
            drain_tasks: Arc::new(Mutex::new(Vec::new())),
            shut_down: Arc::new(AtomicBool::new(false)),
            secondary_polling_active: Arc::new(AtomicBool::new(false)),
        }
    }

    fn is_build_step(&self) -> bool {
        self.options
            .build_step
            .unwrap_or_else(|| self.host.is_build_step())
    }

    /// Drive the state machine to a steady state: `streaming`, `polling`,
    /// `degraded`, or `build:ready`. Idempotent at the façade layer (§4.8);
    /// this method itself always runs the full sequence when called.
    pub async fn initialize(&self) -> Result<()> {
        self.shut_down.store(false, Ordering::SeqCst);
        if self.is_build_step() {
            *self.state.lock().await = ControllerState::BuildLoading;
            let datafile = self.resolve_build_step().await?;
            self.set_data(TaggedDatafile::new(datafile, Origin::Provided)).await;
            *self.state.lock().await = ControllerState::BuildReady;
            *self.mode.lock().await = Mode::Build;
            return Ok(());
        }

        if self.data.read().await.is_none() {
            if let Some(provided) = self.options.datafile.clone() {
                self.set_data(TaggedDatafile::new(provided, Origin::Provided)).await;
            }
        }

        if self.data.read().await.is_some() {
            self.start_primary_in_background().await;
            return Ok(());
        }

        if self.options.stream.enabled {
            if self.try_initialize_stream().await {
                return Ok(());
            }
        } else if self.options.polling.enabled && self.try_initialize_polling().await {
            return Ok(());
        }

        *self.state.lock().await = ControllerState::InitializingFallback;
        self.resolve_fallback_chain().await?;
        Ok(())
    }

    async fn try_initialize_stream(&self) -> bool {
        *self.state.lock().await = ControllerState::InitializingStream;
        let (tx, rx) = source_event_channel();
        self.spawn_drain(rx, Origin::Stream).await;

        let outcome = tokio::time::timeout(self.options.stream.init_timeout, self.stream.start(tx)).await;
        match outcome {
            Ok(Ok(())) => {
                *self.state.lock().await = ControllerState::Streaming;
                self.connected.store(true, Ordering::SeqCst);
                *self.mode.lock().await = Mode::Streaming;
                true
            }
            _ => false,
        }
    }

    async fn try_initialize_polling(&self) -> bool {
        *self.state.lock().await = ControllerState::InitializingPolling;
        let outcome = tokio::time::timeout(self.options.polling.init_timeout, self.polling.poll()).await;
        match outcome {
            Ok(Ok(datafile)) => {
                self.set_data(TaggedDatafile::new(datafile, Origin::Poll)).await;
                let (tx, rx) = source_event_channel();
                self.spawn_drain(rx, Origin::Poll).await;
                self.polling.start_interval(tx).await;
                *self.state.lock().await = ControllerState::Polling;
                self.connected.store(true, Ordering::SeqCst);
                *self.mode.lock().await = Mode::Polling;
                true
            }
            _ => false,
        }
    }

    /// Data already exists (provided datafile seeded the cache); start the
    /// applicable primary source in the background without blocking.
    async fn start_primary_in_background(&self) {
        if self.options.stream.enabled {
            let (tx, rx) = source_event_channel();
            self.spawn_drain(rx, Origin::Stream).await;
            let stream_tx = tx;
            // Fire-and-forget: initialize() does not block on this once data
            // already exists, but we still want `start()` running so future
            // reads pick up live updates.
            let stream_handle_fut = self.stream.start(stream_tx);
            tokio::spawn(async move {
                let _ = stream_handle_fut.await;
            });
            *self.state.lock().await = ControllerState::Streaming;
        } else if self.options.polling.enabled {
            let (tx, rx) = source_event_channel();
            self.spawn_drain(rx, Origin::Poll).await;
            self.polling.start_interval(tx).await;
            *self.state.lock().await = ControllerState::Polling;
        }
    }

    /// provided → bundled → (only when neither stream nor polling enabled)
    /// one-shot fetch → `NoDataAvailable`.
    async fn resolve_fallback_chain(&self) -> Result<()> {
        if let Some(provided) = self.options.datafile.clone() {
            self.set_data(TaggedDatafile::new(provided, Origin::Provided)).await;
            *self.state.lock().await = ControllerState::Degraded;
            return Ok(());
        }
        if let Some(datafile) = self.bundled.try_load() {
            self.set_data(TaggedDatafile::new(datafile, Origin::Bundled)).await;
            *self.state.lock().await = ControllerState::Degraded;
            return Ok(());
        }
        if !self.options.stream.enabled && !self.options.polling.enabled {
            let datafile = crate::sources::fetch_datafile(
                self.host.as_ref(),
                &self.options.host,
                &self.options.sdk_key,
            )
            .await?;
            self.set_data(TaggedDatafile::new(datafile, Origin::Fetched)).await;
            *self.state.lock().await = ControllerState::Degraded;
            return Ok(());
        }
        Err(FlagsError::NoDataAvailable)
    }

    async fn resolve_build_step(&self) -> Result<Datafile> {
        if let Some(provided) = self.options.datafile.clone() {
            return Ok(provided);
        }
        if let Some(datafile) = self.bundled.try_load() {
            return Ok(datafile);
        }
        crate::sources::fetch_datafile(self.host.as_ref(), &self.options.host, &self.options.sdk_key).await
    }

    /// Spawn a task draining one source's event channel into shared state.
    /// Built from `Arc`-cloned pieces ([`DrainContext`]) rather than
    /// borrowing `self`, so the task can outlive the call that spawned it.
    async fn spawn_drain(&self, rx: SourceEventReceiver, origin: Origin) {
        let ctx = DrainContext {
            data: Arc::clone(&self.data),
            connected: Arc::clone(&self.connected),
            mode: Arc::clone(&self.mode),
            shut_down: Arc::clone(&self.shut_down),
            state: Arc::clone(&self.state),
            polling: Arc::clone(&self.polling),
            polling_enabled: self.options.polling.enabled,
            secondary_polling_active: Arc::clone(&self.secondary_polling_active),
            drain_tasks: Arc::clone(&self.drain_tasks),
        };
        let handle = tokio::spawn(drain_loop(ctx, rx, origin));
        self.drain_tasks.lock().await.push(handle);
    }

    async fn set_data(&self, tagged: TaggedDatafile) {
        let mut guard = self.data.write().await;
        let current_ts = guard.as_ref().and_then(|t| t.datafile.config_updated_at);
        if is_newer(current_ts, tagged.datafile.config_updated_at) {
            *guard = Some(tagged);
        }
    }

    /// Serve a read from cache if possible, else run the fallback chain
    /// inline. Emits telemetry for the read.
    pub async fn read(&self, request_nonce: &str) -> Result<DatafileRead> {
        let start = Instant::now();

        if self.is_build_step() {
            let (datafile, cache_status) = match self.data.read().await.clone() {
                Some(tagged) => (tagged.datafile, CacheStatus::Hit),
                None => {
                    let datafile = self.resolve_build_step().await?;
                    self.set_data(TaggedDatafile::new(datafile.clone(), Origin::Fetched)).await;
                    (datafile, CacheStatus::Miss)
                }
            };
            let metrics = Metrics::new(
                start.elapsed(),
                crate::core::data::Source::Embedded,
                cache_status,
                ConnectionState::Disconnected,
                Mode::Build,
            );
            self.track(request_nonce, &metrics, datafile.config_updated_at.map(|t| t.value()))
                .await;
            return Ok(DatafileRead { datafile, metrics });
        }

        let existing = self.data.read().await.clone();
        let (tagged, cache_status) = match existing {
            Some(tagged) => {
                let connected = self.connected.load(Ordering::SeqCst);
                (tagged, if connected { CacheStatus::Hit } else { CacheStatus::Stale })
            }
            None => {
                self.resolve_fallback_chain().await?;
                let tagged = self
                    .data
                    .read()
                    .await
                    .clone()
                    .ok_or(FlagsError::NoDataAvailable)?;
                (tagged, CacheStatus::Miss)
            }
        };

        let connected = self.connected.load(Ordering::SeqCst);
        let mode = *self.mode.lock().await;
        let metrics = Metrics::new(
            start.elapsed(),
            tagged.origin.as_source(),
            cache_status,
            ConnectionState::from_connected(connected),
            mode,
        );
        self.track(
            request_nonce,
            &metrics,
            tagged.datafile.config_updated_at.map(|t| t.value()),
        )
        .await;
        Ok(DatafileRead {
            datafile: tagged.datafile,
            metrics,
        })
    }

    async fn track(&self, request_nonce: &str, metrics: &Metrics, config_updated_at: Option<f64>) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        let metrics = metrics.clone();
        self.tracker.track_read(request_nonce, || {
            payload_from_host(
                self.host.as_ref(),
                request_nonce,
                metrics.cache_status,
                false,
                metrics.cache_status == CacheStatus::Miss,
                Duration::from_secs_f64(metrics.read_ms / 1000.0),
                config_updated_at,
                metrics.source,
            )
        });
    }

    /// Never opens a stream. Serves cache if a live stream is already
    /// running; otherwise performs a one-shot authenticated fetch, falling
    /// back to bundled data.
    pub async fn get_datafile(&self) -> Result<DatafileRead> {
        let start = Instant::now();
        if self.connected.load(Ordering::SeqCst) {
            if let Some(tagged) = self.data.read().await.clone() {
                let metrics = Metrics::new(
                    start.elapsed(),
                    tagged.origin.as_source(),
                    CacheStatus::Hit,
                    ConnectionState::Connected,
                    *self.mode.lock().await,
                );
                return Ok(DatafileRead {
                    datafile: tagged.datafile,
                    metrics,
                });
            }
        }

        match crate::sources::fetch_datafile(self.host.as_ref(), &self.options.host, &self.options.sdk_key).await {
            Ok(datafile) => {
                let metrics = Metrics::new(
                    start.elapsed(),
                    crate::core::data::Source::Remote,
                    CacheStatus::Miss,
                    ConnectionState::from_connected(self.connected.load(Ordering::SeqCst)),
                    *self.mode.lock().await,
                );
                Ok(DatafileRead { datafile, metrics })
            }
            Err(_) => match self.bundled.try_load() {
                Some(datafile) => {
                    let metrics = Metrics::new(
                        start.elapsed(),
                        crate::core::data::Source::Embedded,
                        CacheStatus::Stale,
                        ConnectionState::Disconnected,
                        *self.mode.lock().await,
                    );
                    Ok(DatafileRead { datafile, metrics })
                }
                None => Err(FlagsError::NoDataAvailable),
            },
        }
    }

    /// Delegates to the bundled source's typed lookup.
    pub fn get_fallback_datafile(&self) -> Result<Datafile> {
        self.bundled.get_raw()
    }

    /// Stop both sources, drop event handlers, reset the cache to the
    /// `provided` datafile (if any), and flush telemetry.
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.stream.stop().await;
        self.polling.stop().await;
        for handle in self.drain_tasks.lock().await.drain(..) {
            handle.abort();
        }
        {
            let mut guard = self.data.write().await;
            *guard = self
                .options
                .datafile
                .clone()
                .map(|d| TaggedDatafile::new(d, Origin::Provided));
        }
        self.connected.store(false, Ordering::SeqCst);
        self.secondary_polling_active.store(false, Ordering::SeqCst);
        *self.state.lock().await = ControllerState::Shutdown;
        self.tracker.flush().await;
    }

    /// Current state, for tests and diagnostics.
    pub async fn state(&self) -> ControllerState {
        *self.state.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::TestHost;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn opts(host: &str) -> ControllerOptions {
        ControllerOptions::new("vf_test").unwrap().with_host(host)
    }

    #[tokio::test]
    async fn build_step_resolves_from_provided_datafile_without_network() {
        let host = Arc::new(TestHost::new());
        host.set_env(crate::host::ENV_CI, "1");
        let provided = Datafile::empty("production");
        let options = opts("http://127.0.0.1:1").with_datafile(provided.clone());
        let controller = Controller::new(options, host);

        controller.initialize().await.unwrap();
        assert_eq!(controller.state().await, ControllerState::BuildReady);

        let first = controller.read("req_1").await.unwrap();
        assert_eq!(first.metrics.cache_status, CacheStatus::Hit);
        let second = controller.read("req_2").await.unwrap();
        assert_eq!(second.metrics.cache_status, CacheStatus::Hit);
    }

    #[tokio::test]
    async fn stream_timeout_falls_back_to_bundled() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/stream"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let host = Arc::new(TestHost::new());
        let mut options = opts(&server.uri());
        options.stream.init_timeout = Duration::from_millis(50);
        options.polling.enabled = false;

        let mut entries = std::collections::HashMap::new();
        entries.insert("vf_test".to_string(), Datafile::empty("bundled"));
        let bundled = Box::new(InMemoryBundledRegistry::with_entries(entries));

        let controller = Controller::with_bundled(options, host, bundled);
        controller.initialize().await.unwrap();
        assert_eq!(controller.state().await, ControllerState::Degraded);

        let read = controller.read("req_1").await.unwrap();
        assert_eq!(read.datafile.environment, "bundled");
    }

    #[tokio::test]
    async fn no_data_anywhere_returns_no_data_available() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/stream"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/datafile"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let host = Arc::new(TestHost::new());
        let mut options = opts(&server.uri());
        options.stream.init_timeout = Duration::from_millis(50);
        options.polling.enabled = false;

        let controller = Controller::new(options, host);
        let err = controller.initialize().await.unwrap_err();
        assert!(matches!(err, FlagsError::NoDataAvailable));
    }

    #[tokio::test]
    async fn stream_disconnect_starts_polling_as_secondary() {
        let server = MockServer::start().await;
        // The stream endpoint closes immediately after one datafile line,
        // simulating a server-initiated disconnect.
        Mock::given(method("GET"))
            .and(path("/v1/stream"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(
                        "{\"type\":\"datafile\",\"data\":{\"environment\":\"production\",\"definitions\":{},\"segments\":{}}}\n",
                        "application/x-ndjson",
                    ),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/datafile"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "environment": "polled",
                "definitions": {},
                "segments": {},
            })))
            .mount(&server)
            .await;

        let host = Arc::new(TestHost::new());
        let mut options = opts(&server.uri());
        options.stream.init_timeout = Duration::from_millis(200);
        options = options.with_polling(PollingOptions {
            enabled: true,
            interval: Duration::from_millis(30_000),
            init_timeout: Duration::from_millis(200),
        })
        .unwrap();

        let controller = Controller::new(options, host);
        controller.initialize().await.unwrap();
        assert_eq!(controller.state().await, ControllerState::Streaming);

        // Give the drain task a moment to observe the disconnect and flip
        // the secondary polling flag.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(controller.state().await, ControllerState::Degraded);
        assert!(controller.secondary_polling_active.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn shutdown_resets_cache_to_provided_datafile() {
        let host = Arc::new(TestHost::new());
        let provided = Datafile::empty("production");
        let mut options = opts("http://127.0.0.1:1").with_datafile(provided);
        options.stream.enabled = false;
        options.polling.enabled = false;
        let controller = Controller::new(options, host);
        controller.initialize().await.unwrap();
        controller.shutdown().await;
        assert_eq!(controller.state().await, ControllerState::Shutdown);
        let read = controller.read("req_1").await.unwrap();
        assert_eq!(read.datafile.environment, "production");
    }
}
