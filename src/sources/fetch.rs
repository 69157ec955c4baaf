//! One-shot authenticated datafile fetch, shared by the Polling Source and
//! `Controller::get_datafile`.

use std::time::Duration;

use rand::Rng;

use crate::core::data::Datafile;
use crate::core::error::{FlagsError, Result};
use crate::host::Host;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ATTEMPTS: u32 = 3;

/// `GET {host}/v1/datafile` with up to [`MAX_ATTEMPTS`] tries. 4xx other
/// than 429 is not retried; transport errors and 5xx/429 are retried with
/// `500 * 2^attempt + uniform(0, 500)` ms backoff between attempts.
pub async fn fetch_datafile(host: &dyn Host, base_url: &str, sdk_key: &str) -> Result<Datafile> {
    let client = host.http_client();
    let url = format!("{base_url}/v1/datafile");

    let mut last_err = FlagsError::internal("fetch_datafile: no attempts made");
    for attempt in 0..MAX_ATTEMPTS {
        let result = client
            .get(&url)
            .bearer_auth(sdk_key)
            .header("User-Agent", crate::USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status() == reqwest::StatusCode::UNAUTHORIZED => {
                return Err(FlagsError::Unauthorized);
            }
            Ok(resp) if resp.status().is_client_error() && resp.status().as_u16() != 429 => {
                return Err(FlagsError::transport(format!(
                    "fetch_datafile: non-retryable status {}",
                    resp.status()
                )));
            }
            Ok(resp) if resp.status().is_success() => {
                let datafile: Datafile = resp.json().await?;
                return Ok(datafile);
            }
            Ok(resp) => {
                last_err = FlagsError::transport(format!(
                    "fetch_datafile: retryable status {}",
                    resp.status()
                ));
            }
            Err(e) => {
                last_err = FlagsError::from(e);
            }
        }

        if attempt + 1 < MAX_ATTEMPTS {
            let backoff_ms = 500u64 * 2u64.pow(attempt) + rand::rng().random_range(0..500);
            tracing::debug!(attempt, backoff_ms, "retrying datafile fetch");
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        }
    }

    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::TestHost;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn non_retryable_4xx_fails_without_retrying() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/datafile"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let host = TestHost::new();
        let err = fetch_datafile(&host, &server.uri(), "vf_test")
            .await
            .unwrap_err();
        assert!(matches!(err, FlagsError::Transport(_)));
    }

    #[tokio::test]
    async fn unauthorized_short_circuits() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/datafile"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let host = TestHost::new();
        let err = fetch_datafile(&host, &server.uri(), "vf_test")
            .await
            .unwrap_err();
        assert!(matches!(err, FlagsError::Unauthorized));
    }

    #[tokio::test]
    async fn success_parses_datafile_body() {
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

        let host = TestHost::new();
        let df = fetch_datafile(&host, &server.uri(), "vf_test")
            .await
            .unwrap();
        assert_eq!(df.environment, "production");
    }
}
