//! Range client: wire protocol, method fallback, retries across the pool.
//!
//! One query is resolved in two nested loops. The outer loop walks the
//! round-robin pool, re-issuing the query on retryable failures up to the
//! configured budget. The inner loop talks to a single server, switching
//! between GET and PUT when the server hints with 414 or 405; that switch is
//! internal to one outer attempt and never consumes the retry budget.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::HeaderMap;
use http::Method;
use http::StatusCode;
use tracing::debug;
use url::form_urlencoded;

use crate::constants::QUERY_LENGTH_THRESHOLD;
use crate::error::FetchError;
use crate::error::FetchErrorKind;
use crate::error::RangeError;
use crate::fetcher::FetchedResponse;
use crate::fetcher::Fetcher;
use crate::pool::RoundRobinPool;

/// Predicate deciding whether a failed query should be re-issued against the
/// next server in rotation.
pub type RetryPredicate = Arc<dyn Fn(&RangeError) -> bool + Send + Sync>;

/// The default retry policy.
///
/// Timeouts are always worth retrying. Connection-level failures (the
/// connection never got established, DNS resolution included) are worth
/// retrying only when another server could answer instead. Everything else
/// (non-200 statuses, range exceptions, parse failures) is returned to the
/// caller as-is.
pub fn default_retry_predicate(server_count: usize) -> RetryPredicate {
    Arc::new(move |err| match err {
        RangeError::Transport { source, .. } => match source.kind() {
            FetchErrorKind::Timeout => true,
            FetchErrorKind::Connect => server_count > 1,
            _ => false,
        },
        _ => false,
    })
}

/// Resolves range expressions against a pool of equivalent servers.
#[derive(Clone)]
pub struct RangeClient {
    fetcher: Arc<dyn Fetcher>,
    pool: Arc<RoundRobinPool>,
    retry_count: u32,
    retry_pause: Duration,
    retry_predicate: RetryPredicate,
}

impl RangeClient {
    pub(crate) fn new(
        fetcher: Arc<dyn Fetcher>,
        pool: Arc<RoundRobinPool>,
        retry_count: u32,
        retry_pause: Duration,
        retry_predicate: RetryPredicate,
    ) -> Self {
        Self {
            fetcher,
            pool,
            retry_count,
            retry_pause,
            retry_predicate,
        }
    }

    /// Resolve `expression` to its list of strings.
    ///
    /// Lines are split on LF and trimmed of surrounding whitespace. An empty
    /// response body yields an empty list.
    pub async fn query(&self, expression: &str) -> Result<Vec<String>, RangeError> {
        let response = self.query_with_retry(expression).await?;
        parse_lines(&response.body)
    }

    async fn query_with_retry(&self, expression: &str) -> Result<FetchedResponse, RangeError> {
        let mut attempts: u32 = 0;
        loop {
            match self.query_one_server(expression).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    if attempts == self.retry_count || !(self.retry_predicate)(&err) {
                        return Err(err);
                    }
                    attempts += 1;
                    debug!(attempt = attempts, error = %err, "retrying range query");
                    if self.retry_pause > Duration::ZERO {
                        tokio::time::sleep(self.retry_pause).await;
                    }
                }
            }
        }
    }

    /// Send the query to the next server in rotation, with the GET/PUT
    /// method fallback.
    ///
    /// PUT is preferred up front for queries whose URI would exceed the
    /// long-URI threshold. A 414 switches to PUT and a 405 switches to GET,
    /// once each at most: two tries total, no oscillation.
    async fn query_one_server(&self, expression: &str) -> Result<FetchedResponse, RangeError> {
        let server = self.pool.next();
        let endpoint = format!("http://{server}/range/list");
        let escaped: String = form_urlencoded::byte_serialize(expression.as_bytes()).collect();
        let uri = format!("{endpoint}?{escaped}");

        let mut method = if uri.len() > QUERY_LENGTH_THRESHOLD {
            Method::PUT
        } else {
            Method::GET
        };

        let mut status_err: Option<RangeError> = None;
        for _ in 0..2 {
            let result = if method == Method::GET {
                self.fetcher.get(&uri).await
            } else {
                self.fetcher.put_form(&endpoint, format!("query={escaped}")).await
            };
            let response = result.map_err(|source| classify_fetch_error(server, source))?;

            let status = response.status;
            if status == StatusCode::OK {
                if let Some(message) = range_exception(&response.headers) {
                    return Err(RangeError::RangeException { message });
                }
                return Ok(response);
            } else if status == StatusCode::URI_TOO_LONG {
                method = Method::PUT;
                status_err = Some(status_not_ok(status));
            } else if status == StatusCode::METHOD_NOT_ALLOWED {
                method = Method::GET;
                status_err = Some(status_not_ok(status));
            } else {
                return Err(status_not_ok(status));
            }
        }

        Err(status_err.expect("method fallback exits with a recorded status error"))
    }
}

/// Body-read failures are parse exceptions; everything else is transport.
fn classify_fetch_error(server: &str, source: FetchError) -> RangeError {
    if source.kind() == FetchErrorKind::Body {
        RangeError::ParseResponse { source }
    } else {
        RangeError::Transport {
            server: server.to_string(),
            source,
        }
    }
}

/// The `RangeException` header, when present and non-empty. Lookup is
/// case-insensitive, as header names are.
fn range_exception(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("RangeException")?;
    let message = String::from_utf8_lossy(value.as_bytes()).into_owned();
    if message.is_empty() { None } else { Some(message) }
}

fn status_not_ok(status: StatusCode) -> RangeError {
    RangeError::StatusNotOk {
        status: status.to_string(),
        code: status.as_u16(),
    }
}

fn parse_lines(body: &Bytes) -> Result<Vec<String>, RangeError> {
    let text = std::str::from_utf8(body).map_err(|err| RangeError::ParseResponse {
        source: FetchError::new(FetchErrorKind::Body, err),
    })?;
    Ok(text.lines().map(|line| line.trim().to_string()).collect())
}
