//! Querier configuration and construction.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;

use crate::caching_client::CacheConfig;
use crate::caching_client::CachingClient;
use crate::client::RangeClient;
use crate::client::RetryPredicate;
use crate::client::default_retry_predicate;
use crate::error::RangeError;
use crate::fetcher::Fetcher;
use crate::fetcher::HttpFetcher;
use crate::pool::RoundRobinPool;

/// A resolver of range expressions, cached or not.
#[async_trait]
pub trait Querier: Send + Sync {
    /// Resolve `expression` to its list of strings.
    async fn query(&self, expression: &str) -> Result<Vec<String>, RangeError>;

    /// Release cached state and background work. Queries after `close`
    /// fail.
    async fn close(&self) -> Result<(), RangeError>;
}

#[async_trait]
impl Querier for RangeClient {
    async fn query(&self, expression: &str) -> Result<Vec<String>, RangeError> {
        RangeClient::query(self, expression).await
    }

    async fn close(&self) -> Result<(), RangeError> {
        Ok(())
    }
}

#[async_trait]
impl Querier for CachingClient {
    async fn query(&self, expression: &str) -> Result<Vec<String>, RangeError> {
        CachingClient::query(self, expression).await
    }

    async fn close(&self) -> Result<(), RangeError> {
        CachingClient::close(self).await
    }
}

/// Everything needed to construct a querier.
///
/// All durations treat `Duration::ZERO` as "disabled". TTL, TTE and the
/// version heartbeat work together: TTL keeps hot keys from being re-asked
/// needlessly, TTE bounds how long a response may be served when the
/// servers are unreachable, and the heartbeat replaces TTL wholesale where
/// the servers advertise dataset generations via `%version`.
#[derive(Clone, Default)]
pub struct QuerierConfig {
    /// Range server addresses (`host` or `host:port`). At least one is
    /// required.
    pub servers: Vec<String>,

    /// Additional attempts on retryable errors. Zero never retries.
    pub retry_count: u32,

    /// Pause between attempts.
    pub retry_pause: Duration,

    /// Which errors are worth re-issuing against the next server. Defaults
    /// to [`default_retry_predicate`].
    pub retry_predicate: Option<RetryPredicate>,

    /// TTL: how long good responses stay fresh. Zero disables caching of
    /// freshness (see [`new_querier`] for when the cache is built at all).
    pub ttl: Duration,

    /// TTE: how long good responses may be served at all, even when
    /// re-fetches keep failing. Zero = never expire.
    pub tte: Duration,

    /// Period of the `%version` heartbeat. Non-zero forces `ttl` to zero
    /// and defaults `tte` to four hours.
    pub check_version_periodicity: Duration,

    /// Custom transport. Defaults to [`HttpFetcher`] with the standard
    /// timeouts; wrap a configured [`reqwest::Client`] with
    /// [`HttpFetcher::with_client`] to tune timeouts or proxying.
    pub fetcher: Option<Arc<dyn Fetcher>>,
}

/// Build a querier from `config`.
///
/// When every cache option is zero the querier is a plain [`RangeClient`];
/// otherwise it is a [`CachingClient`], and construction must happen within
/// a Tokio runtime because it spawns the background refresh loop.
pub fn new_querier(config: QuerierConfig) -> Result<Box<dyn Querier>, RangeError> {
    let QuerierConfig {
        servers,
        retry_count,
        retry_pause,
        retry_predicate,
        ttl,
        tte,
        check_version_periodicity,
        fetcher,
    } = config;

    let pool = Arc::new(RoundRobinPool::new(servers)?);
    let retry_predicate =
        retry_predicate.unwrap_or_else(|| default_retry_predicate(pool.server_count()));
    let fetcher = fetcher.unwrap_or_else(|| Arc::new(HttpFetcher::new()));
    let client = RangeClient::new(fetcher, pool, retry_count, retry_pause, retry_predicate);

    if ttl == Duration::ZERO && tte == Duration::ZERO && check_version_periodicity == Duration::ZERO
    {
        return Ok(Box::new(client));
    }

    Ok(Box::new(CachingClient::new(
        client,
        CacheConfig {
            stale: ttl,
            expiry: tte,
            check_version_periodicity,
        },
    )))
}

/// Resolve several expressions concurrently and return the sorted union of
/// their lines. The first error encountered wins.
pub async fn multi_query(
    querier: &dyn Querier,
    expressions: &[String],
) -> Result<Vec<String>, RangeError> {
    let results = join_all(expressions.iter().map(|expression| querier.query(expression))).await;
    let mut union = BTreeSet::new();
    for result in results {
        union.extend(result?);
    }
    Ok(union.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_server_list_is_rejected() {
        let err = new_querier(QuerierConfig::default()).map(|_| ()).unwrap_err();
        assert!(matches!(err, RangeError::NoServers));
    }

    #[tokio::test]
    async fn zero_cache_options_build_a_plain_client() {
        // Succeeds without spawning anything; nothing to close.
        let querier = new_querier(QuerierConfig {
            servers: vec!["range1.example.com".into()],
            ..QuerierConfig::default()
        })
        .unwrap();
        querier.close().await.unwrap();
    }
}
