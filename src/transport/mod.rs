use std::time::Duration;

use http::header::{HeaderMap, HeaderName, ACCEPT, AUTHORIZATION, CONTENT_TYPE};

use crate::error::ProxyError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const POOL_MAX_IDLE_PER_HOST: usize = 16;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(15);

pub static GOOG_API_KEY: HeaderName = HeaderName::from_static("x-goog-api-key");

/// Pooled HTTP client for upstream requests.
///
/// No total request timeout is configured: streamed generations are
/// open-ended and must not be cut off by the client layer.
pub struct UpstreamClient {
    client: reqwest::Client,
}

impl UpstreamClient {
    #[must_use]
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .tcp_nodelay(true)
            .connect_timeout(CONNECT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|err| {
                tracing::error!(error = %err, "failed to build configured HTTP client, falling back to defaults");
                reqwest::Client::new()
            });
        Self { client }
    }

    /// POST a generation request; the caller reads the response body as a
    /// stream.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Transport`] when the request cannot be executed.
    pub async fn post_stream(
        &self,
        url: &str,
        headers: HeaderMap,
        body: bytes::Bytes,
    ) -> Result<reqwest::Response, ProxyError> {
        self.client
            .post(url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|err| ProxyError::Transport(err.to_string()))
    }

    /// Forward an arbitrary request for the non-streaming passthrough path.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Transport`] when the request cannot be executed.
    pub async fn forward(
        &self,
        method: &http::Method,
        url: &str,
        headers: HeaderMap,
        body: Option<bytes::Bytes>,
    ) -> Result<reqwest::Response, ProxyError> {
        let mut request = self.client.request(method.clone(), url).headers(headers);
        if let Some(body) = body {
            request = request.body(body);
        }
        request
            .send()
            .await
            .map_err(|err| ProxyError::Transport(err.to_string()))
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy only the whitelisted client headers onto an upstream request:
/// authorization, API key, content type, and accept.
#[must_use]
pub fn whitelisted_headers(source: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for name in [&AUTHORIZATION, &GOOG_API_KEY, &CONTENT_TYPE, &ACCEPT] {
        if let Some(value) = source.get(name) {
            headers.insert(name.clone(), value.clone());
        }
    }
    headers
}
