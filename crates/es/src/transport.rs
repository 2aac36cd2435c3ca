use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use tracing::warn;

use crate::error::{Error, Result};

/// Connection-retry policy for HTTP requests to Elasticsearch.
///
/// The delay doubles after each retried connection error until it would
/// exceed `max`, at which point the last error surfaces. A zero `max`
/// disables retrying entirely.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    /// Delay before the first retry.
    pub initial: Duration,

    /// Retrying stops once the next delay would exceed this.
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

/// The HTTP seam the facade talks through.
///
/// Production uses [`HttpTransport`]; tests substitute an in-memory
/// implementation.
#[async_trait]
pub trait EsTransport: Send + Sync + 'static {
    /// Issues a GET and decodes the JSON body.
    async fn get_json(&self, path: &str) -> Result<Value>;

    /// PUTs a body to `/_cluster/settings`.
    async fn put_settings(&self, body: Value) -> Result<()>;
}

/// Options for configuring an [`HttpTransport`].
pub struct HttpTransportOptions {
    /// Base URL of the Elasticsearch HTTP endpoint.
    pub base_url: String,

    /// Connection-retry policy.
    pub backoff: Backoff,

    /// Per-request timeout.
    pub timeout: Duration,
}

/// Reqwest-backed transport with connection-error backoff.
pub struct HttpTransport {
    base_url: String,
    backoff: Backoff,
    client: reqwest::Client,
}

impl HttpTransport {
    /// Creates a new `HttpTransport`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(
        HttpTransportOptions {
            base_url,
            backoff,
            timeout,
        }: HttpTransportOptions,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            backoff,
            client,
        })
    }

    /// Sends a request, retrying connection errors per the backoff policy.
    /// Non-connection errors surface immediately.
    async fn execute(&self, method: Method, path: &str, body: Option<&Value>) -> Result<reqwest::Response> {
        let url = format!("{}{path}", self.base_url);
        let mut delay = self.backoff.initial;
        loop {
            let mut request = self.client.request(method.clone(), &url);
            if let Some(body) = body {
                request = request.json(body);
            }
            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        return Err(Error::Status {
                            status: status.as_u16(),
                            path: path.to_owned(),
                        });
                    }
                    return Ok(response);
                }
                Err(error) if is_connection_error(&error) && delay <= self.backoff.max => {
                    warn!(
                        %url,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "connection error, retrying: {error}"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }
}

fn is_connection_error(error: &reqwest::Error) -> bool {
    error.is_connect() || error.is_timeout()
}

#[async_trait]
impl EsTransport for HttpTransport {
    async fn get_json(&self, path: &str) -> Result<Value> {
        let response = self.execute(Method::GET, path, None).await?;
        Ok(response.json().await?)
    }

    async fn put_settings(&self, body: Value) -> Result<()> {
        self.execute(Method::PUT, "/_cluster/settings", Some(&body))
            .await?;
        Ok(())
    }
}
