//! Error types for range queries.
//!
//! Every variant is cloneable: classified errors can be cached as values
//! (a range exception lives in the result cache for a few minutes), so the
//! taxonomy must survive being stored and handed to multiple callers.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use snafu::Snafu;

/// Classification of a transport-level failure, consumed by retry
/// predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// The request exceeded the transport's deadline.
    Timeout,
    /// The connection could not be established, including DNS resolution
    /// failures.
    Connect,
    /// The response body could not be read or decoded.
    Body,
    /// Any other transport failure.
    Other,
}

/// A transport-level failure produced by a [`Fetcher`](crate::Fetcher).
///
/// Carries a [`FetchErrorKind`] so the retry layer can classify without
/// downcasting the source.
#[derive(Debug, Clone)]
pub struct FetchError {
    kind: FetchErrorKind,
    source: Arc<dyn StdError + Send + Sync>,
}

impl FetchError {
    /// Wrap `source` with an explicit classification.
    pub fn new(kind: FetchErrorKind, source: impl StdError + Send + Sync + 'static) -> Self {
        Self {
            kind,
            source: Arc::new(source),
        }
    }

    /// The transport classification of this failure.
    pub fn kind(&self) -> FetchErrorKind {
        self.kind
    }

    /// Whether the failure was a deadline expiry.
    pub fn is_timeout(&self) -> bool {
        self.kind == FetchErrorKind::Timeout
    }

    /// Whether the failure happened before a connection was established.
    pub fn is_connect(&self) -> bool {
        self.kind == FetchErrorKind::Connect
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl StdError for FetchError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            FetchErrorKind::Timeout
        } else if err.is_connect() {
            FetchErrorKind::Connect
        } else if err.is_body() || err.is_decode() {
            FetchErrorKind::Body
        } else {
            FetchErrorKind::Other
        };
        Self {
            kind,
            source: Arc::new(err),
        }
    }
}

/// Errors surfaced by range queries and querier construction.
#[derive(Debug, Clone, Snafu)]
pub enum RangeError {
    /// The network round-trip itself failed. Retried across the pool when
    /// the retry predicate allows, then surfaced raw.
    #[snafu(display("transport error from {server}: {source}"))]
    Transport {
        /// Address of the server that failed to answer.
        server: String,
        source: FetchError,
    },

    /// The server answered with a non-200 status after method-switch
    /// exhaustion.
    #[snafu(display("range server returned {status}"))]
    StatusNotOk {
        /// Human-readable status line, e.g. `500 Internal Server Error`.
        status: String,
        /// Numeric status code.
        code: u16,
    },

    /// The server rejected the expression via the `RangeException` response
    /// header. Dataset-level: identical on every peer, so cached briefly.
    #[snafu(display("RangeException: {message}"))]
    RangeException { message: String },

    /// The response body could not be read.
    #[snafu(display("cannot parse response: {source}"))]
    ParseResponse { source: FetchError },

    /// Construction was attempted with an empty server list.
    #[snafu(display("cannot create querier without at least one range server address"))]
    NoServers,

    /// The querier or its cache has been closed.
    #[snafu(display("querier is closed"))]
    Closed,
}

impl RangeError {
    /// Whether this is an upstream semantic rejection (as opposed to a
    /// transport- or server-specific failure).
    pub fn is_range_exception(&self) -> bool {
        matches!(self, RangeError::RangeException { .. })
    }
}
