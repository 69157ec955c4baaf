//! The Polling Source: periodic `GET {host}/v1/datafile` at a fixed
//! interval, with retry/timeout delegated to the shared fetch helper.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::core::error::Result;
use crate::core::traits::SourceEventSender;
use crate::core::SourceEvent;
use crate::host::Host;
use crate::sources::fetch::fetch_datafile;

/// Periodic datafile poller.
///
/// `poll()` performs a single request; `start_interval()` only registers
/// the recurring timer — it does not poll immediately, so the Controller
/// can issue the first poll explicitly and have its init-timeout logic see
/// a real result rather than a timer tick.
pub struct PollingSource {
    host: Arc<dyn Host>,
    base_url: String,
    sdk_key: String,
    interval: Duration,
    cancelled: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollingSource {
    /// Build a polling source with the given interval.
    pub fn new(
        host: Arc<dyn Host>,
        base_url: impl Into<String>,
        sdk_key: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            host,
            base_url: base_url.into(),
            sdk_key: sdk_key.into(),
            interval,
            cancelled: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    /// Perform a single poll, returning the result directly (used by the
    /// Controller for the first, init-timeout-bound poll).
    pub async fn poll(&self) -> Result<crate::core::data::Datafile> {
        fetch_datafile(self.host.as_ref(), &self.base_url, &self.sdk_key).await
    }

    /// Register the recurring timer. Each subsequent tick emits `data` on
    /// success or `error` on failure; errors never tear down the interval.
    pub async fn start_interval(&self, events: SourceEventSender) {
        self.cancelled.store(false, Ordering::SeqCst);
        let host = Arc::clone(&self.host);
        let base_url = self.base_url.clone();
        let sdk_key = self.sdk_key.clone();
        let interval = self.interval;
        let cancelled = Arc::clone(&self.cancelled);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it, the
                                 // Controller already performed the initial poll
            loop {
                ticker.tick().await;
                if cancelled.load(Ordering::SeqCst) {
                    return;
                }
                match fetch_datafile(host.as_ref(), &base_url, &sdk_key).await {
                    Ok(datafile) => {
                        let _ = events.send(SourceEvent::Data(datafile)).await;
                    }
                    Err(e) => {
                        let _ = events.send(SourceEvent::Error(e.to_string())).await;
                    }
                }
            }
        });
        *self.task.lock().await = Some(handle);
    }

    /// Cancel the timer and any in-flight request.
    pub async fn stop(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::TestHost;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn poll_returns_fetched_datafile() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/datafile"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "environment": "production",
                "definitions": {},
                "segments": {},
            })))
            .mount(&server)
            .await;

        let host = Arc::new(TestHost::new());
        let source = PollingSource::new(host, server.uri(), "vf_test", Duration::from_millis(30_000));
        let df = source.poll().await.unwrap();
        assert_eq!(df.environment, "production");
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let host = Arc::new(TestHost::new());
        let source = PollingSource::new(
            host,
            "http://localhost",
            "vf_test",
            Duration::from_millis(30_000),
        );
        source.stop().await;
    }
}
