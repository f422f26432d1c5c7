//! Decides when pools get (re)fetched and makes sure that a pool is never
//! fetched twice at the same time.
//!
//! Every scheduling pass evaluates the refresh policy for the requested keys
//! and claims a slot in the in-flight set for each key that is due. The
//! evaluation and the claim happen under the same lock, so concurrent passes
//! can't both start a fetch for one key. The fetches themselves run as
//! independent tokio tasks that don't hold any lock while waiting on the data
//! source. When a fetch settles its outcome is committed to the store and the
//! slot is released, even if the fetcher failed, timed out or panicked.
//!
//! Fetches can't be cancelled. A fetch whose result nobody waits for anymore
//! still runs to completion and gets committed. If the runtime drops a fetch
//! task before it settles, the key is committed as `Invalid` so a later pass
//! can fetch it again.

use {
    crate::{
        clock::Clock,
        fetcher::{FetchRequest, Pool, PoolFetching},
        key::CacheKey,
        store::{CacheEntry, CacheStore, PoolStatus},
    },
    anyhow::{Result, anyhow},
    futures::FutureExt,
    prometheus::{Histogram, IntCounter, IntCounterVec, IntGauge},
    std::{
        collections::HashSet,
        panic::AssertUnwindSafe,
        sync::{Arc, Mutex},
        time::{Duration, Instant},
    },
    tracing::Instrument,
};

/// Per caller knobs deciding when a settled entry becomes stale.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RefreshPolicy {
    /// Refetch once per key whenever the chain advanced past the block at
    /// which the previous fetch was started.
    pub refresh_on_block: bool,
    /// Refetch entries that settled longer than this ago.
    pub ttl: Option<Duration>,
    /// Delay refetching failed entries by `failure_backoff * 2^(n - 1)` after
    /// `n` consecutive failures. Without it failed entries are retried as
    /// eagerly as any other entry.
    pub failure_backoff: Option<Duration>,
}

impl RefreshPolicy {
    /// Whether a fetch should be started for an entry that currently has no
    /// fetch in flight.
    pub fn is_due(&self, entry: &CacheEntry, now: Instant, block: u64) -> bool {
        if entry.status == PoolStatus::Idle {
            return true;
        }
        if self.is_backing_off(entry, now) {
            return false;
        }
        let expired = match (self.ttl, entry.last_resolved_at) {
            (Some(ttl), Some(resolved_at)) => now.saturating_duration_since(resolved_at) > ttl,
            _ => false,
        };
        let new_block =
            self.refresh_on_block && entry.last_fetch_started_at_block != Some(block);
        expired || new_block
    }

    fn is_backing_off(&self, entry: &CacheEntry, now: Instant) -> bool {
        let (Some(base), Some(resolved_at)) = (self.failure_backoff, entry.last_resolved_at) else {
            return false;
        };
        if entry.status != PoolStatus::Invalid || entry.consecutive_failures == 0 {
            return false;
        }
        let exponent = (entry.consecutive_failures - 1).min(16);
        now.saturating_duration_since(resolved_at) < base.saturating_mul(1 << exponent)
    }
}

pub struct FetchCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<CacheStore>,
    clock: Arc<dyn Clock>,
    fetcher: Arc<dyn PoolFetching>,
    fetch_timeout: Option<Duration>,
    in_flight: Mutex<HashSet<CacheKey>>,
    metrics: &'static Metrics,
}

impl FetchCoordinator {
    pub fn new(
        store: Arc<CacheStore>,
        clock: Arc<dyn Clock>,
        fetcher: Arc<dyn PoolFetching>,
        fetch_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                clock,
                fetcher,
                fetch_timeout,
                in_flight: Default::default(),
                metrics: Metrics::get(),
            }),
        }
    }

    /// Starts a fetch for every request whose key is due and not in flight.
    /// `fetcher` replaces the default fetcher for the fetches started by this
    /// pass. Returns the number of started fetches.
    ///
    /// Fetches run on the tokio runtime of the caller. Without one nothing is
    /// started.
    pub fn schedule(
        &self,
        requests: impl IntoIterator<Item = FetchRequest>,
        policy: &RefreshPolicy,
        fetcher: Option<&Arc<dyn PoolFetching>>,
    ) -> usize {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("not scheduling pool fetches outside of a tokio runtime");
            return 0;
        };
        let now = self.inner.clock.now();
        let block = self.inner.clock.block_number();

        let started = {
            let mut in_flight = self.inner.in_flight.lock().unwrap();
            let mut started = Vec::new();
            for request in requests {
                if in_flight.contains(&request.key) {
                    self.inner.metrics.pool_cache_deduplicated_requests.inc();
                    continue;
                }
                if !policy.is_due(&self.inner.store.get(&request.key), now, block) {
                    continue;
                }
                in_flight.insert(request.key);
                self.inner.store.set_loading(&request.key, block);
                started.push(request);
            }
            self.inner
                .metrics
                .pool_cache_in_flight
                .set(in_flight.len().try_into().unwrap_or(i64::MAX));
            started
        };

        if !started.is_empty() {
            tracing::debug!(fetches = started.len(), block, "starting pool fetches");
        }
        let count = started.len();
        let fetcher = fetcher.unwrap_or(&self.inner.fetcher);
        // Every claimed slot gets its guard before anything is spawned.
        let started = started
            .into_iter()
            .map(|request| (self.settlement(request.key), request))
            .collect::<Vec<_>>();
        for (settlement, request) in started {
            let span =
                tracing::debug_span!("pool_fetch", key = %request.key, address = %request.address);
            let fetcher = fetcher.clone();
            let task = async move {
                let mut settlement = settlement;
                let outcome = settlement.0.fetch(fetcher.as_ref(), &request).await;
                settlement.2 = Some(outcome);
            };
            runtime.spawn(task.instrument(span));
        }
        count
    }

    /// Number of fetches currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.lock().unwrap().len()
    }

    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.inner.in_flight.lock().unwrap().contains(key)
    }

    /// Guard owning a claimed in-flight slot. When dropped it commits the
    /// outcome stored in it, or `Invalid` if the fetch never finished, and
    /// then releases the slot.
    fn settlement(&self, key: CacheKey) -> Settlement {
        scopeguard::guard((self.inner.clone(), key, None), |(inner, key, outcome)| {
            inner.commit(
                &key,
                outcome.unwrap_or_else(|| Err(anyhow!("fetch cancelled"))),
            );
            inner.release(&key);
        })
    }
}

type Settlement = scopeguard::ScopeGuard<
    (Arc<Inner>, CacheKey, Option<Result<Option<Pool>>>),
    fn((Arc<Inner>, CacheKey, Option<Result<Option<Pool>>>)),
>;

impl Inner {
    async fn fetch(&self, fetcher: &dyn PoolFetching, request: &FetchRequest) -> Result<Option<Pool>> {
        let _timer = self.metrics.pool_cache_fetch_time.start_timer();
        // Calling the fetcher inside the future also catches panics that
        // happen before its future is created.
        let fetch = AssertUnwindSafe(async { fetcher.fetch(request).await }).catch_unwind();
        let result = match self.fetch_timeout {
            Some(timeout) => tokio::time::timeout(timeout, fetch)
                .await
                .map_err(|_| anyhow!("fetch timed out after {timeout:?}"))?,
            None => fetch.await,
        };
        result.unwrap_or_else(|_| Err(anyhow!("fetcher panicked")))
    }

    fn commit(&self, key: &CacheKey, outcome: Result<Option<Pool>>) {
        let status = match outcome {
            Ok(Some(pool)) => {
                self.store.set_resolved(key, pool);
                PoolStatus::Exists
            }
            Ok(None) => {
                tracing::debug!("pool does not exist");
                self.store.set_absent(key);
                PoolStatus::NotExists
            }
            Err(err) => {
                tracing::warn!(?err, "failed to fetch pool");
                self.store.set_invalid(key, format!("{err:#}"));
                PoolStatus::Invalid
            }
        };
        self.metrics
            .pool_cache_fetches
            .with_label_values(&[status.as_str()])
            .inc();
    }

    fn release(&self, key: &CacheKey) {
        let mut in_flight = self.in_flight.lock().unwrap();
        in_flight.remove(key);
        self.metrics
            .pool_cache_in_flight
            .set(in_flight.len().try_into().unwrap_or(i64::MAX));
    }
}

#[derive(prometheus_metric_storage::MetricStorage)]
struct Metrics {
    /// Settled pool fetches by outcome.
    #[metric(labels("result"))]
    pool_cache_fetches: IntCounterVec,

    /// Time it takes to fetch a pool.
    #[metric(buckets(0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1., 2.5, 5., 10.))]
    pool_cache_fetch_time: Histogram,

    /// Number of pool fetches currently in flight.
    pool_cache_in_flight: IntGauge,

    /// Requested keys that were not fetched because a fetch was already in
    /// flight.
    pool_cache_deduplicated_requests: IntCounter,
}

impl Metrics {
    fn get() -> &'static Self {
        Metrics::instance(observe::metrics::get_storage_registry()).unwrap()
    }
}
