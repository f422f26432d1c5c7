//! Entry point for consumers: maps pool queries to their cached state and
//! schedules whatever needs (re)fetching.

use {
    crate::{
        address::{AddressDeriving, AddressResolver},
        clock::Clock,
        coordinator::{FetchCoordinator, RefreshPolicy},
        fetcher::{FetchRequest, Pool, PoolFetching},
        key::{CacheKey, ChainId, FeeTier, Token},
        store::{CacheEntry, CacheStore, PoolStatus},
    },
    alloy_primitives::Address,
    prometheus::IntCounterVec,
    std::{fmt::Debug, sync::Arc, time::Duration},
    tokio::sync::watch,
};

/// A requested pool. Any part may be missing while the consumer is still
/// collecting input; such queries resolve to `Invalid`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PoolQuery {
    pub chain_id: Option<ChainId>,
    pub token_a: Option<Token>,
    pub token_b: Option<Token>,
    pub tier: Option<FeeTier>,
}

impl PoolQuery {
    pub fn new(chain_id: ChainId, token_a: Token, token_b: Token, tier: FeeTier) -> Self {
        Self {
            chain_id: Some(chain_id),
            token_a: Some(token_a),
            token_b: Some(token_b),
            tier: Some(tier),
        }
    }

    pub fn key(&self) -> Option<CacheKey> {
        CacheKey::canonicalize(
            self.chain_id,
            self.token_a.as_ref(),
            self.token_b.as_ref(),
            self.tier,
        )
    }

    fn fetch_request(&self, key: CacheKey, address: Address) -> Option<FetchRequest> {
        let (token_a, token_b) = (self.token_a.as_ref()?, self.token_b.as_ref()?);
        let (token0, token1) = if token_a.sorts_before(token_b) {
            (token_a, token_b)
        } else {
            (token_b, token_a)
        };
        Some(FetchRequest {
            key,
            address,
            token0: token0.clone(),
            token1: token1.clone(),
            tier: key.tier(),
        })
    }
}

/// Per call knobs of [`PoolCache::resolve_all`].
#[derive(Clone)]
pub struct QueryOptions {
    /// If false the call only reads the cache and never starts a fetch.
    pub enabled: bool,
    pub refresh_on_block: bool,
    pub ttl: Option<Duration>,
    /// Used instead of the cache's fetcher for fetches started by this call.
    pub fetcher: Option<Arc<dyn PoolFetching>>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            refresh_on_block: false,
            ttl: None,
            fetcher: None,
        }
    }
}

impl Debug for QueryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryOptions")
            .field("enabled", &self.enabled)
            .field("refresh_on_block", &self.refresh_on_block)
            .field("ttl", &self.ttl)
            .field("fetcher", &self.fetcher.as_ref().map(|_| "custom"))
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct PoolQueryResult {
    pub status: PoolStatus,
    /// Only set if `status` is `Exists`.
    pub pool: Option<Arc<Pool>>,
}

impl PoolQueryResult {
    fn invalid() -> Self {
        Self {
            status: PoolStatus::Invalid,
            pool: None,
        }
    }
}

impl From<CacheEntry> for PoolQueryResult {
    fn from(entry: CacheEntry) -> Self {
        Self {
            status: entry.status,
            pool: entry.pool,
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PoolCacheConfig {
    /// Default for [`QueryOptions::refresh_on_block`].
    pub refresh_on_block: bool,
    /// Default for [`QueryOptions::ttl`].
    pub ttl: Option<Duration>,
    /// Fetches taking longer than this settle as `Invalid`.
    pub fetch_timeout: Option<Duration>,
    /// See [`RefreshPolicy::failure_backoff`].
    pub failure_backoff: Option<Duration>,
}

pub struct PoolCache {
    config: PoolCacheConfig,
    addresses: AddressResolver,
    store: Arc<CacheStore>,
    coordinator: FetchCoordinator,
    metrics: &'static Metrics,
}

impl PoolCache {
    pub fn new(
        config: PoolCacheConfig,
        deriver: Arc<dyn AddressDeriving>,
        fetcher: Arc<dyn PoolFetching>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = Arc::new(CacheStore::new(clock.clone()));
        let coordinator =
            FetchCoordinator::new(store.clone(), clock, fetcher, config.fetch_timeout);
        Self {
            config,
            addresses: AddressResolver::new(deriver),
            store,
            coordinator,
            metrics: Metrics::get(),
        }
    }

    /// Query options with the configured defaults.
    pub fn options(&self) -> QueryOptions {
        QueryOptions {
            refresh_on_block: self.config.refresh_on_block,
            ttl: self.config.ttl,
            ..Default::default()
        }
    }

    /// Returns the cached state of every query, in the order of the queries,
    /// and starts fetches for the ones that are due.
    ///
    /// Newly started fetches are reported as `Loading`. Fetches only start
    /// when called from within a tokio runtime.
    pub fn resolve_all(&self, queries: &[PoolQuery], options: &QueryOptions) -> Vec<PoolQueryResult> {
        let (_, results) = self.resolve(queries, options);
        self.count(&results);
        results
    }

    /// Like [`Self::resolve_all`] but waits until none of the queried pools
    /// is `Loading` anymore.
    pub async fn resolve_all_settled(
        &self,
        queries: &[PoolQuery],
        options: &QueryOptions,
    ) -> Vec<PoolQueryResult> {
        let mut updates = self.store.subscribe();
        let (keys, mut results) = self.resolve(queries, options);
        while results
            .iter()
            .any(|result| result.status == PoolStatus::Loading)
        {
            if updates.changed().await.is_err() {
                break;
            }
            results = self.read(&keys);
        }
        self.count(&results);
        results
    }

    /// Notified after every change to the cache. Consumers re-run their
    /// queries when it fires.
    pub fn updates(&self) -> watch::Receiver<u64> {
        self.store.subscribe()
    }

    /// Number of pool fetches currently in flight.
    pub fn in_flight(&self) -> usize {
        self.coordinator.in_flight()
    }

    /// Schedules the due fetches of one call and reads the resulting state.
    fn resolve(
        &self,
        queries: &[PoolQuery],
        options: &QueryOptions,
    ) -> (Vec<Option<CacheKey>>, Vec<PoolQueryResult>) {
        let keys = queries.iter().map(PoolQuery::key).collect::<Vec<_>>();
        let requests = self.fetch_requests(queries, &keys);
        if options.enabled {
            let policy = RefreshPolicy {
                refresh_on_block: options.refresh_on_block,
                ttl: options.ttl,
                failure_backoff: self.config.failure_backoff,
            };
            self.coordinator
                .schedule(requests, &policy, options.fetcher.as_ref());
        }
        let results = self.read(&keys);
        (keys, results)
    }

    /// Resolves the addresses of all valid keys. Keys whose address can't be
    /// derived are recorded as `Invalid` and never fetched.
    fn fetch_requests(&self, queries: &[PoolQuery], keys: &[Option<CacheKey>]) -> Vec<FetchRequest> {
        let mut requests = Vec::new();
        for (query, key) in queries.iter().zip(keys) {
            let Some(key) = key else {
                continue;
            };
            match self.addresses.resolve(key) {
                Ok(address) => requests.extend(query.fetch_request(*key, address)),
                Err(err) => {
                    if self.store.get(key).status != PoolStatus::Invalid {
                        tracing::debug!(%key, ?err, "unable to derive pool address");
                        self.store.set_invalid(key, err.to_string());
                    }
                }
            }
        }
        requests
    }

    fn read(&self, keys: &[Option<CacheKey>]) -> Vec<PoolQueryResult> {
        let mut entries = self.store.snapshot(keys.iter().flatten()).into_iter();
        keys.iter()
            .map(|key| match key {
                Some(_) => entries
                    .next()
                    .map(PoolQueryResult::from)
                    .unwrap_or_else(PoolQueryResult::invalid),
                None => PoolQueryResult::invalid(),
            })
            .collect()
    }

    fn count(&self, results: &[PoolQueryResult]) {
        for result in results {
            self.metrics
                .pool_cache_query_results
                .with_label_values(&[result.status.as_str()])
                .inc();
        }
    }
}

#[derive(prometheus_metric_storage::MetricStorage)]
struct Metrics {
    /// Returned query results by status.
    #[metric(labels("status"))]
    pool_cache_query_results: IntCounterVec,
}

impl Metrics {
    fn get() -> &'static Self {
        Metrics::instance(observe::metrics::get_storage_registry()).unwrap()
    }
}
