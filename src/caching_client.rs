//! Caching querier: memoizes range responses and keeps them warm.
//!
//! Two stores cooperate. The result cache holds query responses under the
//! configured TTL/TTE; the last-access map records when each expression was
//! last demanded by a caller. A background loop watches the server's
//! `%version` heartbeat and, on dataset advance, deletes keys nobody asked
//! for recently while re-fetching the ones still in demand, so a fleet of
//! clients converges on the new dataset without stampeding it.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::SystemTime;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio::time::interval_at;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::client::RangeClient;
use crate::constants::BAD_EXPIRY_DURATION;
use crate::constants::BAD_STALE_DURATION;
use crate::constants::DEFAULT_VERSION_EXPIRY;
use crate::constants::DISABLED_TICK_PERIOD;
use crate::constants::REFRESH_QUEUE_CAPACITY;
use crate::error::RangeError;
use crate::store::Lookup;
use crate::store::LookupOutcome;
use crate::store::StoreConfig;
use crate::store::TimedValue;
use crate::store::TimedValueStore;

/// Cache behavior for a [`CachingClient`]. `Duration::ZERO` disables the
/// respective feature.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CacheConfig {
    /// TTL for good responses.
    pub stale: Duration,
    /// TTE for good responses.
    pub expiry: Duration,
    /// Period of the `%version` heartbeat.
    pub check_version_periodicity: Duration,
}

impl CacheConfig {
    /// Apply the construction rules.
    ///
    /// With version polling on, the dataset version drives freshness, so
    /// time-based staleness is switched off; and if nothing would ever expire
    /// entries, a default expiry bounds the heap.
    fn resolve(mut self) -> Self {
        if self.check_version_periodicity > Duration::ZERO {
            self.stale = Duration::ZERO;
            if self.expiry == Duration::ZERO {
                self.expiry = DEFAULT_VERSION_EXPIRY;
            }
        }
        self
    }

    fn gc_period(&self) -> Duration {
        // No point sweeping a store whose entries never expire.
        if self.expiry > Duration::ZERO {
            self.expiry
        } else {
            Duration::ZERO
        }
    }
}

struct Shared {
    client: RangeClient,
    cache: TimedValueStore<Vec<String>>,
    last_access: TimedValueStore<SystemTime>,
    config: CacheConfig,
}

/// A querier that resolves through a TTL/TTE cache and keeps it refreshed
/// in the background.
pub struct CachingClient {
    shared: Arc<Shared>,
    halt: CancellationToken,
    run_task: Mutex<Option<JoinHandle<()>>>,
}

impl CachingClient {
    /// Must be called within a Tokio runtime: construction spawns the
    /// refresh loop, which runs until [`close`](Self::close).
    pub(crate) fn new(client: RangeClient, config: CacheConfig) -> Self {
        let config = config.resolve();

        let cache = TimedValueStore::new(
            StoreConfig {
                good_stale: config.stale,
                good_expiry: config.expiry,
                gc_period: config.gc_period(),
            },
            make_lookup(client.clone()),
        );
        let last_access = TimedValueStore::plain();

        let shared = Arc::new(Shared {
            client,
            cache,
            last_access,
            config,
        });
        let halt = CancellationToken::new();
        let task = tokio::spawn(run(Arc::clone(&shared), halt.clone()));
        Self {
            shared,
            halt,
            run_task: Mutex::new(Some(task)),
        }
    }

    /// Resolve `expression`, preferring the cache.
    ///
    /// The last-access stamp is written before the cache is consulted, so
    /// any key present in the result cache has a demand record at least as
    /// recent as its lookup.
    pub async fn query(&self, expression: &str) -> Result<Vec<String>, RangeError> {
        self.shared.last_access.store(expression, SystemTime::now());
        self.shared.cache.query(expression).await
    }

    /// Halt the refresh loop, wait for it, and close both stores.
    pub async fn close(&self) -> Result<(), RangeError> {
        self.halt.cancel();
        let task = self
            .run_task
            .lock()
            .expect("run task lock poisoned")
            .take();
        if let Some(task) = task
            && task.await.is_err()
        {
            warn!("refresh loop aborted");
        }
        self.shared.cache.close().await;
        self.shared.last_access.close().await;
        Ok(())
    }
}

/// The cache-miss path: ask upstream, deciding what is cacheable.
fn make_lookup(client: RangeClient) -> Lookup<Vec<String>> {
    Arc::new(move |expression: String| {
        let client = client.clone();
        Box::pin(async move {
            match client.query(&expression).await {
                Ok(lines) => Ok(LookupOutcome::Value(lines)),
                Err(err @ RangeError::RangeException { .. }) => {
                    // Every peer would reject this expression the same way;
                    // cache the rejection briefly so the retry layer stops
                    // re-asking.
                    let now = SystemTime::now();
                    Ok(LookupOutcome::Timed(TimedValue::error(
                        err,
                        now + BAD_STALE_DURATION,
                        now + BAD_EXPIRY_DURATION,
                    )))
                }
                // Transport and status errors may be server-specific: leave
                // them uncached so the next caller tries again.
                Err(err) => Err(err),
            }
        })
    })
}

async fn run(shared: Arc<Shared>, halt: CancellationToken) {
    let version_period = effective(shared.config.check_version_periodicity);
    let stale_period = effective(shared.config.stale);

    // First fire one full period from now, like a plain timer.
    let mut version_tick = interval_at(Instant::now() + version_period, version_period);
    version_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut stale_tick = interval_at(Instant::now() + stale_period, stale_period);
    stale_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut last_version: i64 = 0;

    loop {
        tokio::select! {
            _ = halt.cancelled() => break,
            _ = version_tick.tick() => {
                if shared.config.check_version_periodicity > Duration::ZERO
                    && let Err(err) = check_version(&shared, &mut last_version).await
                {
                    // Heartbeat failures are tolerable; keep serving cache.
                    warn!(error = %err, "%version check failed");
                }
            }
            _ = stale_tick.tick() => {
                if shared.config.stale > Duration::ZERO {
                    let cutoff = SystemTime::now() - shared.config.expiry;
                    refresh_before(&shared, cutoff).await;
                }
            }
        }
    }
}

/// A disabled timer still needs a period; make it long enough that the
/// no-op wakeups cost nothing.
fn effective(period: Duration) -> Duration {
    if period > Duration::ZERO {
        period
    } else {
        DISABLED_TICK_PERIOD
    }
}

/// Poll `%version` and refresh on dataset advance.
async fn check_version(shared: &Shared, last_version: &mut i64) -> Result<(), RangeError> {
    // Straight to the client: the heartbeat must observe the live dataset.
    let lines = shared.client.query("%version").await?;
    if lines.len() != 1 {
        warn!(lines = lines.len(), "%version returned unexpected line count");
        return Ok(());
    }
    let version: i64 = match lines[0].parse() {
        Ok(version) => version,
        Err(err) => {
            warn!(value = %lines[0], error = %err, "cannot parse %version");
            return Ok(());
        }
    };
    if version > *last_version {
        // The version is the epoch instant the dataset went live; keys not
        // demanded within one TTL of it are no longer worth holding.
        let activated = SystemTime::UNIX_EPOCH + Duration::from_secs(version as u64);
        let cutoff = activated
            .checked_sub(shared.config.stale)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        debug!(version, "dataset version advanced");
        refresh_before(shared, cutoff).await;
        *last_version = version;
    }
    Ok(())
}

/// Drop keys last demanded before `cutoff`; re-fetch the rest.
///
/// Cached errors are dropped outright; a new dataset may well heal them.
/// Refreshes trickle through a bounded queue and a single drainer so a
/// large cache cannot storm the servers.
async fn refresh_before(shared: &Shared, cutoff: SystemTime) {
    let (queue, mut drain) = mpsc::channel::<String>(REFRESH_QUEUE_CAPACITY);

    let cache = shared.cache.clone();
    let refresher = tokio::spawn(async move {
        while let Some(key) = drain.recv().await {
            cache.update(&key).await;
        }
    });

    let mut to_refresh = Vec::new();
    shared.cache.range(|key, entry| {
        if entry.err().is_some() {
            shared.cache.delete(key);
        } else {
            match shared.last_access.load(key) {
                Some(at) if at < cutoff => shared.cache.delete(key),
                Some(_) => to_refresh.push(key.to_string()),
                // No demand on record for this key; drop it rather than
                // refresh on nobody's behalf.
                None => shared.cache.delete(key),
            }
        }
    });

    for key in to_refresh {
        if queue.send(key).await.is_err() {
            break;
        }
    }
    drop(queue);
    if refresher.await.is_err() {
        warn!("refresher task aborted");
    }
}
