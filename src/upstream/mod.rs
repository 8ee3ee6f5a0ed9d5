//! Outbound delivery of one attempt to one backend.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt as _;
use futures_util::stream::{self, BoxStream};
use http::{HeaderMap, StatusCode};
use thiserror::Error;

use crate::config::Backend;

#[cfg(feature = "http-upstream")]
mod http_client;

#[cfg(feature = "http-upstream")]
pub use http_client::{DEFAULT_UPSTREAM_TIMEOUT, HttpUpstream};

pub type ByteStream = BoxStream<'static, Result<Bytes, UpstreamError>>;

/// Failures before or while reading a backend response. All of them are
/// retryable as long as no response byte reached the client.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("backend connect failed: {0}")]
    Connect(String),
    #[error("backend timed out: {0}")]
    Timeout(String),
    #[error("backend i/o error: {0}")]
    Io(String),
    #[error("backend `{backend}` has no url")]
    MissingUrl { backend: String },
    #[error("backend request failed: {0}")]
    Other(String),
}

#[derive(Clone, Debug)]
pub struct UpstreamRequest {
    pub backend: Backend,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub stream: bool,
}

pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl UpstreamResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: ByteStream) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn from_bytes(status: StatusCode, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Self::new(
            status,
            HeaderMap::new(),
            stream::once(async move { Ok(body) }).boxed(),
        )
    }

    pub fn from_chunks<I>(status: StatusCode, chunks: I) -> Self
    where
        I: IntoIterator<Item = Result<Bytes, UpstreamError>>,
        I::IntoIter: Send + 'static,
    {
        Self::new(status, HeaderMap::new(), stream::iter(chunks).boxed())
    }
}

impl fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Upstream: Send + Sync {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError>;
}

/// Joins a backend base url and a translated request path. A base url that
/// already ends in the path's leading version segment is not repeated.
pub fn join_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let path = path.strip_prefix('/').unwrap_or(path);

    if let Some((version, rest)) = path.split_once('/') {
        if base.ends_with(&format!("/{version}")) {
            return format!("{base}/{rest}");
        }
    }
    format!("{base}/{path}")
}
