use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt as _;
use http::{HeaderMap, HeaderName, HeaderValue};

use super::{Upstream, UpstreamError, UpstreamRequest, UpstreamResponse, join_url};

pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(300);

/// Sends attempts over HTTP with reqwest. The backend's `url` is the base and
/// the translated path is appended to it.
#[derive(Clone, Debug)]
pub struct HttpUpstream {
    client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new() -> Result<Self, UpstreamError> {
        Self::with_timeout(DEFAULT_UPSTREAM_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| UpstreamError::Other(format!("backend http client error: {err}")))?;
        Ok(Self { client })
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn backend_headers(request: &UpstreamRequest) -> Result<HeaderMap, UpstreamError> {
    let mut headers = request.headers.clone();
    for (name, value) in &request.backend.headers {
        let header_name = name
            .parse::<HeaderName>()
            .map_err(|_| UpstreamError::Other(format!("invalid header name: {name}")))?;
        let header_value = value
            .parse::<HeaderValue>()
            .map_err(|_| UpstreamError::Other(format!("invalid header value for {name}")))?;
        headers.insert(header_name, header_value);
    }
    if request.stream {
        headers.insert(
            http::header::ACCEPT,
            HeaderValue::from_static("text/event-stream"),
        );
    }
    Ok(headers)
}

fn map_reqwest_error(err: reqwest::Error) -> UpstreamError {
    if err.is_timeout() {
        UpstreamError::Timeout(err.to_string())
    } else if err.is_connect() {
        UpstreamError::Connect(err.to_string())
    } else if err.is_body() || err.is_decode() {
        UpstreamError::Io(err.to_string())
    } else {
        UpstreamError::Other(err.to_string())
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
        let base = request
            .backend
            .url
            .as_deref()
            .ok_or_else(|| UpstreamError::MissingUrl {
                backend: request.backend.name.clone(),
            })?;
        let url = join_url(base, &request.path);
        let headers = backend_headers(&request)?;

        tracing::debug!(backend = %request.backend.name, %url, stream = request.stream, "sending backend request");
        let response = self
            .client
            .post(url)
            .headers(headers)
            .body(request.body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(map_reqwest_error))
            .boxed();
        Ok(UpstreamResponse::new(status, headers, body))
    }
}
