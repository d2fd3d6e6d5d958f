//! Client library for the range expression service.
//!
//! A range server maps a query expression (e.g. `%cluster:role`) to an
//! ordered list of strings, typically hostnames. This crate resolves such
//! expressions against a pool of equivalent servers and memoizes the
//! responses:
//!
//! - round-robin rotation with retries on transient transport failures
//! - GET or PUT per query, switching on the server's 414/405 status hints
//! - a stale-while-revalidate TTL/TTE cache with single-flight lookups
//! - an optional background loop that follows the server's `%version`
//!   heartbeat and selectively refreshes or evicts cached keys
//!
//! # Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//!
//! use range_client::QuerierConfig;
//! use range_client::new_querier;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let querier = new_querier(QuerierConfig {
//!         servers: vec![
//!             "range1.example.com".to_string(),
//!             "range2.example.com".to_string(),
//!         ],
//!         retry_count: 2,
//!         retry_pause: Duration::from_secs(5),
//!         ttl: Duration::from_secs(30),
//!         tte: Duration::from_secs(15 * 60),
//!         ..QuerierConfig::default()
//!     })?;
//!
//!     for host in querier.query("%mycluster").await? {
//!         println!("{host}");
//!     }
//!
//!     // Always close: it stops the refresh loop and drops the caches.
//!     querier.close().await?;
//!     Ok(())
//! }
//! ```

mod caching_client;
mod client;
mod config;
mod constants;
mod error;
mod fetcher;
mod pool;

pub mod proxy;
pub mod store;

pub use caching_client::CachingClient;
pub use client::RangeClient;
pub use client::RetryPredicate;
pub use client::default_retry_predicate;
pub use config::Querier;
pub use config::QuerierConfig;
pub use config::multi_query;
pub use config::new_querier;
pub use error::FetchError;
pub use error::FetchErrorKind;
pub use error::RangeError;
pub use fetcher::FetchedResponse;
pub use fetcher::Fetcher;
pub use fetcher::HttpFetcher;
pub use pool::RoundRobinPool;
