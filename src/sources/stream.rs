//! The Stream Source: a long-lived authenticated connection to the push
//! endpoint, with bounded exponential-backoff reconnect.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::core::error::{FlagsError, Result};
use crate::core::traits::SourceEventSender;
use crate::core::SourceEvent;
use crate::host::Host;
use crate::ndjson::{NdjsonReader, StreamMessage};

/// Reconnect attempts beyond this are abandoned permanently.
const MAX_RETRY_COUNT: u32 = 15;
/// Floor on the gap between successive connection attempts, so an instant
/// server close cannot drive a tight reconnect loop.
const MIN_INTER_ATTEMPT_GAP: Duration = Duration::from_millis(1000);

type ReadySignal = Arc<Mutex<Option<oneshot::Sender<Result<()>>>>>;

/// `retry_count` → backoff before the next attempt. `retry_count == 1` is
/// treated as zero-delay (first reconnect is immediate).
fn backoff(retry_count: u32) -> Duration {
    if retry_count <= 1 {
        return Duration::ZERO;
    }
    let base = 1000u64.saturating_mul(1u64 << (retry_count - 2).min(63));
    let capped = base.min(60_000);
    let jitter = rand::rng().random_range(0..1000);
    Duration::from_millis(capped + jitter)
}

/// Maintains a single outbound connection to `{host}/v1/stream`.
pub struct StreamSource {
    host: Arc<dyn Host>,
    base_url: String,
    sdk_key: String,
    cancelled: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamSource {
    /// Build a stream source for the given base URL and SDK key.
    pub fn new(host: Arc<dyn Host>, base_url: impl Into<String>, sdk_key: impl Into<String>) -> Self {
        Self {
            host,
            base_url: base_url.into(),
            sdk_key: sdk_key.into(),
            cancelled: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    /// Open a connection and drive it in the background, forwarding events
    /// over `events`. Resolves as soon as the *first* `datafile` message
    /// arrives (first-byte semantics — a TCP connect alone does not count)
    /// or rejects if aborted or rejected with 401 before any data arrives.
    pub async fn start(&self, events: SourceEventSender) -> Result<()> {
        self.cancelled.store(false, Ordering::SeqCst);
        let (ready_tx, ready_rx) = oneshot::channel();
        let ready: ReadySignal = Arc::new(Mutex::new(Some(ready_tx)));

        let host = Arc::clone(&self.host);
        let base_url = self.base_url.clone();
        let sdk_key = self.sdk_key.clone();
        let cancelled = Arc::clone(&self.cancelled);

        let handle = tokio::spawn(run_loop(host, base_url, sdk_key, cancelled, events, ready));
        *self.task.lock().await = Some(handle);

        match ready_rx.await {
            Ok(result) => result,
            Err(_) => Err(FlagsError::internal(
                "stream source task ended before signaling readiness",
            )),
        }
    }

    /// Abort the underlying connection and clear the cached task, so a
    /// subsequent `start()` opens a fresh connection.
    pub async fn stop(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
    }
}

async fn signal_ready(ready: &ReadySignal, result: Result<()>) {
    if let Some(tx) = ready.lock().await.take() {
        let _ = tx.send(result);
    }
}

async fn run_loop(
    host: Arc<dyn Host>,
    base_url: String,
    sdk_key: String,
    cancelled: Arc<AtomicBool>,
    events: SourceEventSender,
    ready: ReadySignal,
) {
    let retry_count = AtomicU32::new(0);
    let mut last_attempt: Option<std::time::Instant> = None;

    while !cancelled.load(Ordering::SeqCst) {
        if let Some(last) = last_attempt {
            let elapsed = host.now().saturating_duration_since(last);
            if elapsed < MIN_INTER_ATTEMPT_GAP {
                tokio::time::sleep(MIN_INTER_ATTEMPT_GAP - elapsed).await;
            }
        }
        last_attempt = Some(host.now());

        let attempt_count = retry_count.fetch_add(1, Ordering::SeqCst) + 1;
        let outcome = attempt_once(
            &host,
            &base_url,
            &sdk_key,
            attempt_count,
            &cancelled,
            &events,
            &retry_count,
            &ready,
        )
        .await;

        match outcome {
            AttemptOutcome::Ended => {}
            AttemptOutcome::Unauthorized => {
                signal_ready(&ready, Err(FlagsError::Unauthorized)).await;
                return;
            }
            AttemptOutcome::Failed(e) => {
                let _ = events.send(SourceEvent::Error(e.to_string())).await;
            }
        }

        let _ = events.send(SourceEvent::Disconnected).await;

        if cancelled.load(Ordering::SeqCst) {
            return;
        }
        if attempt_count >= MAX_RETRY_COUNT {
            signal_ready(
                &ready,
                Err(FlagsError::internal(
                    "stream source exceeded maximum reconnect attempts",
                )),
            )
            .await;
            return;
        }

        let delay = backoff(attempt_count);
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
    }
}

enum AttemptOutcome {
    /// The connection ended (with or without delivering data); the caller
    /// reconnects unless cancelled or out of retries.
    Ended,
    Unauthorized,
    Failed(FlagsError),
}

#[allow(clippy::too_many_arguments)]
async fn attempt_once(
    host: &Arc<dyn Host>,
    base_url: &str,
    sdk_key: &str,
    attempt_count: u32,
    cancelled: &Arc<AtomicBool>,
    events: &SourceEventSender,
    retry_count: &AtomicU32,
    ready: &ReadySignal,
) -> AttemptOutcome {
    let client = host.http_client();
    let url = format!("{base_url}/v1/stream");

    let response = client
        .get(&url)
        .bearer_auth(sdk_key)
        .header("User-Agent", crate::USER_AGENT)
        .header("X-Retry-Attempt", attempt_count.to_string())
        .send()
        .await;

    let response = match response {
        Ok(r) => r,
        Err(e) => return AttemptOutcome::Failed(FlagsError::from(e)),
    };

    if response.status() == reqwest::StatusCode::UNAUTHORIZED {
        return AttemptOutcome::Unauthorized;
    }
    if !response.status().is_success() {
        return AttemptOutcome::Failed(FlagsError::transport(format!(
            "stream connect failed with status {}",
            response.status()
        )));
    }

    let mut reader = NdjsonReader::new();
    let mut byte_stream = response.bytes_stream();
    let mut got_data = false;

    loop {
        if cancelled.load(Ordering::SeqCst) {
            return AttemptOutcome::Ended;
        }
        match byte_stream.next().await {
            Some(Ok(chunk)) => {
                for msg in reader.feed(&chunk) {
                    match msg {
                        StreamMessage::Ping => {
                            retry_count.store(0, Ordering::SeqCst);
                        }
                        StreamMessage::Datafile(datafile) => {
                            let first = !got_data;
                            got_data = true;
                            if first {
                                let _ = events.send(SourceEvent::Connected).await;
                                signal_ready(ready, Ok(())).await;
                            }
                            let _ = events.send(SourceEvent::Data(datafile)).await;
                        }
                    }
                }
            }
            Some(Err(e)) => {
                return AttemptOutcome::Failed(FlagsError::transport(e.to_string()));
            }
            None => {
                for msg in reader.flush() {
                    if let StreamMessage::Datafile(datafile) = msg {
                        let first = !got_data;
                        got_data = true;
                        if first {
                            let _ = events.send(SourceEvent::Connected).await;
                            signal_ready(ready, Ok(())).await;
                        }
                        let _ = events.send(SourceEvent::Data(datafile)).await;
                    }
                }
                if !got_data {
                    return AttemptOutcome::Failed(FlagsError::transport(
                        "stream ended with no data",
                    ));
                }
                return AttemptOutcome::Ended;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_count_one_has_zero_delay() {
        assert_eq!(backoff(1), Duration::ZERO);
        assert_eq!(backoff(0), Duration::ZERO);
    }

    #[test]
    fn backoff_grows_and_caps_at_sixty_seconds() {
        let d2 = backoff(2).as_millis();
        let d3 = backoff(3).as_millis();
        assert!(d2 < d3 || d2 <= d3 + 1000);
        let d_large = backoff(30).as_millis();
        assert!(d_large <= 61_000);
    }
}
