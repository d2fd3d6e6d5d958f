//! Transport seam for talking to range servers.
//!
//! [`Fetcher`] abstracts one HTTP round-trip so callers can inject their own
//! transport (custom timeouts, proxies, instrumentation). The default
//! [`HttpFetcher`] wraps a pooled [`reqwest::Client`] configured with the
//! library's standard timeouts.

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use http::StatusCode;

use crate::constants::DEFAULT_DIAL_KEEP_ALIVE;
use crate::constants::DEFAULT_DIAL_TIMEOUT;
use crate::constants::DEFAULT_MAX_IDLE_CONNS_PER_HOST;
use crate::constants::DEFAULT_QUERY_TIMEOUT;
use crate::error::FetchError;

/// One HTTP exchange with a range server, body fully read.
///
/// Reading the body to completion inside the fetcher is what returns the
/// connection to the pool for reuse, on every status code.
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    /// HTTP status of the response.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// The complete response body.
    pub body: Bytes,
}

/// A transport capable of the two wire methods the range protocol uses.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Issue a GET for a fully-formed range URI.
    async fn get(&self, uri: &str) -> Result<FetchedResponse, FetchError>;

    /// Issue a PUT to `endpoint` with an `application/x-www-form-urlencoded`
    /// body.
    async fn put_form(&self, endpoint: &str, body: String) -> Result<FetchedResponse, FetchError>;
}

/// Default fetcher backed by a pooled reqwest client.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Build a fetcher with the default transport timeouts.
    ///
    /// A client without a request timeout would leak in-flight requests
    /// against a buggy server or a poor network, so one is always set.
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_QUERY_TIMEOUT)
            .connect_timeout(DEFAULT_DIAL_TIMEOUT)
            .tcp_keepalive(DEFAULT_DIAL_KEEP_ALIVE)
            .pool_max_idle_per_host(DEFAULT_MAX_IDLE_CONNS_PER_HOST)
            .build()
            .expect("failed to create HTTP client");
        Self { client }
    }

    /// Wrap a caller-configured client (custom timeouts, transport, proxy).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn get(&self, uri: &str) -> Result<FetchedResponse, FetchError> {
        let response = self.client.get(uri).send().await?;
        read_response(response).await
    }

    async fn put_form(&self, endpoint: &str, body: String) -> Result<FetchedResponse, FetchError> {
        let response = self
            .client
            .put(endpoint)
            .header(http::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await?;
        read_response(response).await
    }
}

async fn read_response(response: reqwest::Response) -> Result<FetchedResponse, FetchError> {
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await?;
    Ok(FetchedResponse { status, headers, body })
}
