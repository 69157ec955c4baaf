//! The Usage Tracker: a batched, per-request-deduplicated NDJSON sink that
//! POSTs `FLAGS_CONFIG_READ` events to `{host}/v1/ingest`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::host::{Host, ENV_DEBUG, ENV_VERCEL_DEPLOYMENT_ID, ENV_VERCEL_REGION};
use crate::telemetry::dedup::RequestDedup;
use crate::telemetry::event::{UsageEvent, UsagePayload};

/// Batch flushes when this many events are buffered.
const MAX_BATCH_SIZE: usize = 2000;
/// Hard ceiling per in-flight stream of events; beyond this, new events are
/// dropped rather than queued (backpressure is lossy, not blocking).
const MAX_QUEUE_SIZE: usize = 1000;
/// Batch flushes after this much time even if under `MAX_BATCH_SIZE`.
const MAX_WAIT: Duration = Duration::from_secs(5);
/// How long a request nonce is remembered for dedup purposes.
const DEDUP_TTL: Duration = Duration::from_secs(60);

enum TrackerMessage {
    Event(UsageEvent),
    Flush(tokio::sync::oneshot::Sender<()>),
}

/// Public handle to the tracker; cheap to clone, all state lives in the
/// background task.
pub struct UsageTracker {
    host: Arc<dyn Host>,
    dedup: Arc<RequestDedup>,
    tx: mpsc::Sender<TrackerMessage>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl UsageTracker {
    /// Spawn the background batching task.
    pub fn new(host: Arc<dyn Host>, base_url: impl Into<String>, sdk_key: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let sdk_key = sdk_key.into();
        let dedup = Arc::new(RequestDedup::new(DEDUP_TTL));
        let (tx, rx) = mpsc::channel(MAX_QUEUE_SIZE);

        let worker = tokio::spawn(run_batcher(Arc::clone(&host), base_url, sdk_key, rx));

        Self {
            host,
            dedup,
            tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Record a read, deduplicated per request nonce. A no-op if this
    /// nonce has already been tracked (within the dedup TTL). Never blocks
    /// the caller; if the queue is saturated the event is dropped with a
    /// warning.
    pub fn track_read(&self, request_nonce: &str, payload_of: impl FnOnce() -> UsagePayload) {
        if !self.dedup.mark_first_seen(request_nonce, self.host.now()) {
            return;
        }
        let ts = chrono::Utc::now().timestamp_millis() as f64;
        let event = UsageEvent::config_read(ts, payload_of());
        if let Err(e) = self.tx.try_send(TrackerMessage::Event(event)) {
            tracing::warn!(error = %e, "usage tracker queue saturated, dropping event");
        }
    }

    /// Drain all buffered events and await the in-flight POST. Idempotent
    /// and safe to call repeatedly.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        if self.tx.send(TrackerMessage::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Register a best-effort flush on the host's termination signal.
    /// Intended to be spawned once per tracker instance.
    pub async fn flush_on_terminate(self: &Arc<Self>) {
        self.host.terminate_signal().await;
        self.flush().await;
    }
}

impl Drop for UsageTracker {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.worker.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

async fn run_batcher(
    host: Arc<dyn Host>,
    base_url: String,
    sdk_key: String,
    mut rx: mpsc::Receiver<TrackerMessage>,
) {
    let mut buffer: Vec<UsageEvent> = Vec::new();
    let mut wait_deadline: Option<tokio::time::Instant> = None;

    loop {
        let sleep = async {
            match wait_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(TrackerMessage::Event(event)) => {
                        if buffer.is_empty() {
                            wait_deadline = Some(tokio::time::Instant::now() + MAX_WAIT);
                        }
                        buffer.push(event);
                        if buffer.len() >= MAX_BATCH_SIZE {
                            flush_batch(&host, &base_url, &sdk_key, &mut buffer).await;
                            wait_deadline = None;
                        }
                    }
                    Some(TrackerMessage::Flush(done)) => {
                        flush_batch(&host, &base_url, &sdk_key, &mut buffer).await;
                        wait_deadline = None;
                        let _ = done.send(());
                    }
                    None => {
                        flush_batch(&host, &base_url, &sdk_key, &mut buffer).await;
                        return;
                    }
                }
            }
            _ = sleep => {
                flush_batch(&host, &base_url, &sdk_key, &mut buffer).await;
                wait_deadline = None;
            }
        }
    }
}

async fn flush_batch(host: &Arc<dyn Host>, base_url: &str, sdk_key: &str, buffer: &mut Vec<UsageEvent>) {
    if buffer.is_empty() {
        return;
    }
    let batch = std::mem::take(buffer);
    if let Err(e) = post_batch(host, base_url, sdk_key, &batch).await {
        tracing::warn!(error = %e, count = batch.len(), "usage tracker flush failed");
    }
}

async fn post_batch(
    host: &Arc<dyn Host>,
    base_url: &str,
    sdk_key: &str,
    batch: &[UsageEvent],
) -> Result<(), crate::core::error::FlagsError> {
    let client = host.http_client();
    let url = format!("{base_url}/v1/ingest");
    const MAX_ATTEMPTS: u32 = 3;

    for attempt in 0..MAX_ATTEMPTS {
        let mut req = client
            .post(&url)
            .bearer_auth(sdk_key)
            .header("User-Agent", crate::USER_AGENT)
            .json(&batch);
        if host.is_debug() {
            req = req.header("x-vercel-debug-ingest", "1");
        }

        match req.send().await {
            Ok(resp) if resp.status().is_success() => {
                if host.is_debug() {
                    let vercel_id = resp
                        .headers()
                        .get("x-vercel-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-");
                    tracing::debug!(status = %resp.status(), vercel_id, "ingest batch accepted");
                }
                return Ok(());
            }
            Ok(resp) if resp.status().is_client_error() => {
                tracing::warn!(status = %resp.status(), "ingest batch rejected, discarding");
                return Ok(());
            }
            Ok(resp) => {
                if attempt + 1 == MAX_ATTEMPTS {
                    return Err(crate::core::error::FlagsError::transport(format!(
                        "ingest failed with status {}",
                        resp.status()
                    )));
                }
            }
            Err(e) => {
                if attempt + 1 == MAX_ATTEMPTS {
                    return Err(e.into());
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    Ok(())
}

/// Build a `UsagePayload` using the host's deployment/region environment
/// variables. Exposed so the Controller's read path can construct the
/// payload without reaching into `Host` directly.
pub fn payload_from_host(
    host: &dyn Host,
    vercel_request_id: impl Into<String>,
    cache_status: crate::core::metrics::CacheStatus,
    cache_is_blocking: bool,
    cache_is_first_read: bool,
    duration: Duration,
    config_updated_at: Option<f64>,
    config_origin: crate::core::data::Source,
) -> UsagePayload {
    UsagePayload {
        deployment_id: host.env(ENV_VERCEL_DEPLOYMENT_ID),
        region: host.env(ENV_VERCEL_REGION),
        invocation_host: None,
        vercel_request_id: vercel_request_id.into(),
        cache_status,
        cache_is_blocking,
        cache_is_first_read,
        duration: duration.as_secs_f64() * 1000.0,
        config_updated_at,
        config_origin,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::Source;
    use crate::core::metrics::CacheStatus;
    use crate::host::TestHost;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn dedup_collapses_repeated_track_read_into_one_post() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/ingest"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let host = Arc::new(TestHost::new());
        let tracker = UsageTracker::new(host.clone(), server.uri(), "vf_test");
        for _ in 0..10 {
            tracker.track_read("req_1", || {
                payload_from_host(
                    host.as_ref(),
                    "req_1",
                    CacheStatus::Hit,
                    false,
                    true,
                    Duration::from_millis(1),
                    Some(1.0),
                    Source::InMemory,
                )
            });
        }
        tracker.flush().await;
    }

    #[tokio::test]
    async fn flush_is_idempotent_with_no_buffered_events() {
        let server = MockServer::start().await;
        let host = Arc::new(TestHost::new());
        let tracker = UsageTracker::new(host, server.uri(), "vf_test");
        tracker.flush().await;
        tracker.flush().await;
    }
}
