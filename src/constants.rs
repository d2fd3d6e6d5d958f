//! Protocol and cache tuning constants.

use std::time::Duration;

/// Maximum URI length for an outgoing GET query.
///
/// Queries whose full URI would exceed this are sent as PUT instead, with
/// the expression carried in the request body.
pub const QUERY_LENGTH_THRESHOLD: usize = 4096;

/// How long a query may remain in flight before automatic cancellation,
/// when no custom HTTP client is provided.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection-establishment timeout for the default HTTP client.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP keep-alive for the default HTTP client's connections.
pub const DEFAULT_DIAL_KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Idle connections retained per host by the default HTTP client.
pub const DEFAULT_MAX_IDLE_CONNS_PER_HOST: usize = 1;

/// Stale stamp applied to cached range exceptions.
///
/// Range exceptions are dataset-level: every peer gives the same answer, so
/// the error is cached briefly rather than re-asked across the pool.
pub const BAD_STALE_DURATION: Duration = Duration::from_secs(60);

/// Expiry stamp applied to cached range exceptions.
pub const BAD_EXPIRY_DURATION: Duration = Duration::from_secs(5 * 60);

/// Expiry imposed when `%version` polling is enabled without an explicit
/// TTE, so once-touched keys cannot accumulate on the heap forever.
pub const DEFAULT_VERSION_EXPIRY: Duration = Duration::from_secs(4 * 60 * 60);

/// Capacity of the refresh queue used by the background sweep.
///
/// Bounded so that refreshing a large key set trickles requests upstream
/// instead of storming every server at once. Must be at least 1: the sweep
/// enqueues while the refresher drains.
pub const REFRESH_QUEUE_CAPACITY: usize = 64;

/// Stand-in period for a disabled timer in the refresh loop, long enough
/// that the no-op wakeups cost nothing.
pub const DISABLED_TICK_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);
