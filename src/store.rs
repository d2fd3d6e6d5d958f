//! Timed-value store: a concurrent single-flight cache with
//! stale-while-revalidate semantics.
//!
//! Each entry carries two wall-clock stamps. Before `stale_at` the entry is
//! fresh and served as-is. Between `stale_at` and `expiry_at` it is stale:
//! still served immediately, but a background refresh is scheduled if none
//! is already in flight. At `expiry_at` the entry stops being served and the
//! next caller pays for a synchronous lookup.
//!
//! Every key owns a single-flight gate. Callers that miss concurrently on
//! the same key queue on the gate and the winner's lookup fills the entry
//! for all of them; at most one upstream request per key is in flight at any
//! instant. Lookups for distinct keys are independent.
//!
//! A store built with [`TimedValueStore::plain`] has no lookup and no
//! durations: entries never go stale, never expire, and are only touched
//! through [`store`](TimedValueStore::store) / [`load`](TimedValueStore::load).
//! That makes it a concurrent map, which is what the caching client's
//! last-access bookkeeping needs.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::SystemTime;

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::RangeError;

/// A cached value, or a cached classified error, with freshness stamps.
#[derive(Debug, Clone)]
pub struct TimedValue<T> {
    value: Option<T>,
    err: Option<RangeError>,
    stale_at: Option<SystemTime>,
    expiry_at: Option<SystemTime>,
}

impl<T> TimedValue<T> {
    /// A value with no stamps: never stale, never expires.
    pub fn new(value: T) -> Self {
        Self {
            value: Some(value),
            err: None,
            stale_at: None,
            expiry_at: None,
        }
    }

    /// An entry carrying `err` in place of a value, served until
    /// `expiry_at`. This is how upstream semantic errors are cached with
    /// deadlines shorter than the store's good durations.
    pub fn error(err: RangeError, stale_at: SystemTime, expiry_at: SystemTime) -> Self {
        Self {
            value: None,
            err: Some(err),
            stale_at: Some(stale_at),
            expiry_at: Some(expiry_at),
        }
    }

    fn good(value: T, now: SystemTime, stale: Duration, expiry: Duration) -> Self {
        Self {
            value: Some(value),
            err: None,
            stale_at: (stale > Duration::ZERO).then(|| now + stale),
            expiry_at: (expiry > Duration::ZERO).then(|| now + expiry),
        }
    }

    /// The cached value, when this entry carries one.
    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// The cached error, when this entry carries one.
    pub fn err(&self) -> Option<&RangeError> {
        self.err.as_ref()
    }

    /// Whether the entry is eligible for asynchronous refresh.
    pub fn is_stale(&self, now: SystemTime) -> bool {
        self.stale_at.is_some_and(|at| now >= at)
    }

    /// Whether the entry must no longer be served.
    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.expiry_at.is_some_and(|at| now >= at)
    }
}

impl<T: Clone> TimedValue<T> {
    fn to_result(&self) -> Result<T, RangeError> {
        match &self.err {
            Some(err) => Err(err.clone()),
            None => Ok(self
                .value
                .clone()
                .expect("timed value carries either a value or an error")),
        }
    }
}

/// What a lookup produced.
pub enum LookupOutcome<T> {
    /// A plain value; the store stamps it with its good durations.
    Value(T),
    /// A fully-stamped entry stored verbatim.
    Timed(TimedValue<T>),
}

/// Future returned by a lookup callback.
pub type LookupFuture<T> = Pin<Box<dyn Future<Output = Result<LookupOutcome<T>, RangeError>> + Send>>;

/// Async lookup invoked on miss, expiry, and refresh.
///
/// A plain `Err` is never cached: it propagates to the caller that paid for
/// the lookup, and a refresh that fails this way keeps the old entry.
pub type Lookup<T> = Arc<dyn Fn(String) -> LookupFuture<T> + Send + Sync>;

/// Durations governing entries the lookup reports as good.
/// `Duration::ZERO` disables the respective bound.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreConfig {
    /// Good entries become refresh-eligible after this long. ZERO = never
    /// stale.
    pub good_stale: Duration,
    /// Good entries stop being served after this long. ZERO = never expire.
    pub good_expiry: Duration,
    /// Period of the background sweep that drops expired entries. ZERO = no
    /// sweep.
    pub gc_period: Duration,
}

struct Slot<T> {
    /// Single-flight gate; held across the lookup await, so it lives behind
    /// its own `Arc` for owned guards.
    gate: Arc<AsyncMutex<()>>,
    cell: RwLock<Option<TimedValue<T>>>,
}

impl<T> Slot<T> {
    fn empty() -> Self {
        Self {
            gate: Arc::new(AsyncMutex::new(())),
            cell: RwLock::new(None),
        }
    }
}

struct StoreInner<T> {
    config: StoreConfig,
    lookup: Option<Lookup<T>>,
    slots: Mutex<HashMap<String, Arc<Slot<T>>>>,
    closed: AtomicBool,
    gc: CancellationToken,
    gc_task: Mutex<Option<JoinHandle<()>>>,
}

/// Concurrent key → [`TimedValue`] map with single-flight lookups.
///
/// Cheap to clone; clones share state.
pub struct TimedValueStore<T> {
    inner: Arc<StoreInner<T>>,
}

impl<T> Clone for TimedValueStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> TimedValueStore<T> {
    /// A store with staleness semantics driven by `lookup`.
    ///
    /// Must be called within a Tokio runtime when `config.gc_period` is
    /// non-zero: the sweep task is spawned here and runs until
    /// [`close`](Self::close).
    pub fn new(config: StoreConfig, lookup: Lookup<T>) -> Self {
        Self::build(config, Some(lookup))
    }

    /// A store with no lookup and no durations: a plain concurrent map.
    pub fn plain() -> Self {
        Self::build(StoreConfig::default(), None)
    }

    fn build(config: StoreConfig, lookup: Option<Lookup<T>>) -> Self {
        let store = Self {
            inner: Arc::new(StoreInner {
                config,
                lookup,
                slots: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                gc: CancellationToken::new(),
                gc_task: Mutex::new(None),
            }),
        };
        if config.gc_period > Duration::ZERO {
            let task = tokio::spawn(run_gc(Arc::clone(&store.inner), config.gc_period));
            *store.inner.gc_task.lock().expect("gc task lock poisoned") = Some(task);
        }
        store
    }

    /// The current value for `key` under the staleness rules.
    ///
    /// Fresh entries return immediately. Stale-but-valid entries return
    /// immediately and schedule one asynchronous refresh. Missing or expired
    /// entries invoke the lookup synchronously, with concurrent callers for
    /// the same key collapsed onto a single flight.
    ///
    /// # Panics
    ///
    /// Panics if the store was built without a lookup (see
    /// [`plain`](Self::plain)).
    pub async fn query(&self, key: &str) -> Result<T, RangeError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RangeError::Closed);
        }
        let slot = self.slot(key);

        let now = SystemTime::now();
        if let Some(entry) = read_entry(&slot, now) {
            if entry.is_stale(now) {
                self.spawn_refresh(key.to_string(), Arc::clone(&slot));
            }
            return entry.to_result();
        }

        // Miss or expired: collapse concurrent callers onto one flight.
        let _flight = slot.gate.clone().lock_owned().await;
        if let Some(entry) = read_entry(&slot, SystemTime::now()) {
            // Another caller filled the entry while we queued on the gate.
            return entry.to_result();
        }
        let entry = self.lookup_entry(key).await?;
        write_entry(&slot, entry.clone());
        entry.to_result()
    }

    /// Re-invoke the lookup for `key` and replace the stored entry with the
    /// outcome, waiting for completion. Missing keys and plain lookup errors
    /// leave the store unchanged.
    pub async fn update(&self, key: &str) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        let Some(slot) = self.existing_slot(key) else {
            return;
        };
        let _flight = slot.gate.clone().lock_owned().await;
        match self.lookup_entry(key).await {
            Ok(entry) => write_entry(&slot, entry),
            Err(err) => {
                debug!(key = %key, error = %err, "refresh lookup failed; keeping existing entry");
            }
        }
    }

    /// Insert `value` with no staleness stamps, bypassing the lookup.
    pub fn store(&self, key: &str, value: T) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        let slot = self.slot(key);
        write_entry(&slot, TimedValue::new(value));
    }

    /// The raw value for `key`, ignoring staleness, without lookup.
    pub fn load(&self, key: &str) -> Option<T> {
        let slot = self.existing_slot(key)?;
        let cell = slot.cell.read().expect("slot cell lock poisoned");
        cell.as_ref().and_then(|entry| entry.value.clone())
    }

    /// Remove `key` and its entry.
    pub fn delete(&self, key: &str) {
        self.inner
            .slots
            .lock()
            .expect("slot map lock poisoned")
            .remove(key);
    }

    /// Visit a snapshot of all populated entries. The visitor is free to
    /// delete keys, including the one it is visiting, while iterating.
    pub fn range<F>(&self, mut visitor: F)
    where
        F: FnMut(&str, &TimedValue<T>),
    {
        let snapshot: Vec<(String, TimedValue<T>)> = {
            let slots = self.inner.slots.lock().expect("slot map lock poisoned");
            slots
                .iter()
                .filter_map(|(key, slot)| {
                    let cell = slot.cell.read().expect("slot cell lock poisoned");
                    cell.as_ref().map(|entry| (key.clone(), entry.clone()))
                })
                .collect()
        };
        for (key, entry) in &snapshot {
            visitor(key, entry);
        }
    }

    /// Number of keys present, populated or not.
    pub fn len(&self) -> usize {
        self.inner.slots.lock().expect("slot map lock poisoned").len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the background sweep and drop all entries. Subsequent queries
    /// return [`RangeError::Closed`]; writes no-op.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.gc.cancel();
        let task = self
            .inner
            .gc_task
            .lock()
            .expect("gc task lock poisoned")
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.inner
            .slots
            .lock()
            .expect("slot map lock poisoned")
            .clear();
    }

    fn slot(&self, key: &str) -> Arc<Slot<T>> {
        let mut slots = self.inner.slots.lock().expect("slot map lock poisoned");
        Arc::clone(
            slots
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Slot::empty())),
        )
    }

    fn existing_slot(&self, key: &str) -> Option<Arc<Slot<T>>> {
        let slots = self.inner.slots.lock().expect("slot map lock poisoned");
        slots.get(key).cloned()
    }

    /// Kick off one asynchronous refresh for a stale entry, unless a flight
    /// for this key is already up.
    fn spawn_refresh(&self, key: String, slot: Arc<Slot<T>>) {
        let Ok(flight) = slot.gate.clone().try_lock_owned() else {
            return;
        };
        let store = self.clone();
        tokio::spawn(async move {
            let _flight = flight;
            match store.lookup_entry(&key).await {
                Ok(entry) => write_entry(&slot, entry),
                Err(err) => {
                    // The stale value keeps being served until expiry.
                    debug!(key = %key, error = %err, "background refresh failed");
                }
            }
        });
    }

    async fn lookup_entry(&self, key: &str) -> Result<TimedValue<T>, RangeError> {
        let lookup = Arc::clone(
            self.inner
                .lookup
                .as_ref()
                .expect("query requires a store built with a lookup"),
        );
        match lookup(key.to_string()).await? {
            LookupOutcome::Value(value) => Ok(TimedValue::good(
                value,
                SystemTime::now(),
                self.inner.config.good_stale,
                self.inner.config.good_expiry,
            )),
            LookupOutcome::Timed(entry) => Ok(entry),
        }
    }
}

fn read_entry<T: Clone>(slot: &Slot<T>, now: SystemTime) -> Option<TimedValue<T>> {
    let cell = slot.cell.read().expect("slot cell lock poisoned");
    match cell.as_ref() {
        Some(entry) if !entry.is_expired(now) => Some(entry.clone()),
        _ => None,
    }
}

fn write_entry<T>(slot: &Slot<T>, entry: TimedValue<T>) {
    *slot.cell.write().expect("slot cell lock poisoned") = Some(entry);
}

async fn run_gc<T>(inner: Arc<StoreInner<T>>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = inner.gc.cancelled() => break,
            _ = ticker.tick() => {
                let now = SystemTime::now();
                let mut slots = inner.slots.lock().expect("slot map lock poisoned");
                let before = slots.len();
                slots.retain(|_, slot| {
                    let cell = slot.cell.read().expect("slot cell lock poisoned");
                    // Unpopulated slots stay: a lookup may be in flight.
                    !cell.as_ref().is_some_and(|entry| entry.is_expired(now))
                });
                let removed = before - slots.len();
                if removed > 0 {
                    debug!(removed, "swept expired entries");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn counting_lookup(
        calls: Arc<AtomicUsize>,
        delay: Duration,
    ) -> Lookup<Vec<String>> {
        Arc::new(move |key: String| {
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if delay > Duration::ZERO {
                    tokio::time::sleep(delay).await;
                }
                Ok(LookupOutcome::Value(vec![format!("host-for-{key}")]))
            })
        })
    }

    fn failing_lookup(calls: Arc<AtomicUsize>) -> Lookup<Vec<String>> {
        Arc::new(move |_key: String| {
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RangeError::StatusNotOk {
                    status: "503 Service Unavailable".into(),
                    code: 503,
                })
            })
        })
    }

    fn store_with(
        good_stale: Duration,
        good_expiry: Duration,
        lookup: Lookup<Vec<String>>,
    ) -> TimedValueStore<Vec<String>> {
        TimedValueStore::new(
            StoreConfig {
                good_stale,
                good_expiry,
                gc_period: Duration::ZERO,
            },
            lookup,
        )
    }

    #[tokio::test]
    async fn fresh_entries_are_served_without_lookup() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = store_with(
            Duration::from_secs(60),
            Duration::from_secs(300),
            counting_lookup(Arc::clone(&calls), Duration::ZERO),
        );

        let first = store.query("%q").await.unwrap();
        let second = store.query("%q").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_collapse_to_one_flight() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = store_with(
            Duration::from_secs(60),
            Duration::from_secs(300),
            counting_lookup(Arc::clone(&calls), Duration::from_millis(200)),
        );

        let tasks: Vec<_> = (0..100)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.query("%q").await })
            })
            .collect();
        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap().unwrap());
        }
        assert!(results.iter().all(|lines| lines == &results[0]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_entries_serve_old_value_and_refresh_in_background() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = store_with(
            Duration::from_millis(50),
            Duration::from_secs(300),
            counting_lookup(Arc::clone(&calls), Duration::ZERO),
        );

        let first = store.query("%q").await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        // Stale window: served immediately from cache...
        let second = store.query("%q").await.unwrap();
        assert_eq!(first, second);

        // ...while the refresh lands shortly after.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn expired_entries_block_on_a_fresh_fetch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = store_with(
            Duration::from_millis(10),
            Duration::from_millis(20),
            counting_lookup(Arc::clone(&calls), Duration::ZERO),
        );

        store.query("%q").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        store.query("%q").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn plain_errors_are_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = store_with(
            Duration::from_secs(60),
            Duration::from_secs(300),
            failing_lookup(Arc::clone(&calls)),
        );

        assert!(store.query("%q").await.is_err());
        assert!(store.query("%q").await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn timed_outcomes_are_stored_verbatim() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counting = Arc::clone(&calls);
        let lookup: Lookup<Vec<String>> = Arc::new(move |_key: String| {
            let calls = Arc::clone(&counting);
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let now = SystemTime::now();
                Ok(LookupOutcome::Timed(TimedValue::error(
                    RangeError::RangeException {
                        message: "NOCLUSTER".into(),
                    },
                    now + Duration::from_secs(60),
                    now + Duration::from_secs(300),
                )))
            })
        });
        let store = store_with(Duration::from_secs(1), Duration::from_secs(2), lookup);

        let err = store.query("%bad").await.unwrap_err();
        assert!(err.is_range_exception());
        // The cached error answers repeat callers without another lookup.
        let err = store.query("%bad").await.unwrap_err();
        assert!(err.is_range_exception());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn update_replaces_the_entry_in_place() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = store_with(
            Duration::from_secs(60),
            Duration::from_secs(300),
            counting_lookup(Arc::clone(&calls), Duration::ZERO),
        );

        store.query("%q").await.unwrap();
        store.update("%q").await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Unknown keys are left alone.
        store.update("%other").await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn raw_store_and_load_skip_staleness() {
        let store: TimedValueStore<SystemTime> = TimedValueStore::plain();
        let stamp = SystemTime::now();
        store.store("%q", stamp);
        assert_eq!(store.load("%q"), Some(stamp));
        assert_eq!(store.load("%missing"), None);
        store.delete("%q");
        assert_eq!(store.load("%q"), None);
    }

    #[tokio::test]
    async fn range_permits_deleting_the_visited_key() {
        let store: TimedValueStore<SystemTime> = TimedValueStore::plain();
        store.store("a", SystemTime::now());
        store.store("b", SystemTime::now());

        let mut seen = Vec::new();
        store.range(|key, _entry| {
            seen.push(key.to_string());
            store.delete(key);
        });
        seen.sort();
        assert_eq!(seen, ["a", "b"]);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn gc_sweeps_expired_entries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = TimedValueStore::new(
            StoreConfig {
                good_stale: Duration::from_millis(5),
                good_expiry: Duration::from_millis(10),
                gc_period: Duration::from_millis(20),
            },
            counting_lookup(Arc::clone(&calls), Duration::ZERO),
        );

        store.query("%q").await.unwrap();
        assert_eq!(store.len(), 1);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.len(), 0);
        store.close().await;
    }

    #[tokio::test]
    async fn closed_stores_refuse_queries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = store_with(
            Duration::from_secs(60),
            Duration::from_secs(300),
            counting_lookup(Arc::clone(&calls), Duration::ZERO),
        );
        store.query("%q").await.unwrap();
        store.close().await;

        assert!(matches!(store.query("%q").await, Err(RangeError::Closed)));
        assert_eq!(store.len(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
