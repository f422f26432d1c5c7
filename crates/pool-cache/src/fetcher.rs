use {
    crate::key::{CacheKey, FeeTier, Token},
    alloy_primitives::{Address, U256},
    anyhow::Result,
};

/// State of a concentrated liquidity pool as returned by the data source.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Pool {
    pub address: Address,
    pub token0: Token,
    pub token1: Token,
    pub tier: FeeTier,
    pub sqrt_price_x96: U256,
    pub liquidity: u128,
    pub tick: i32,
}

/// Everything a fetcher needs to know to load one pool.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FetchRequest {
    pub key: CacheKey,
    /// Address of the pool contract.
    pub address: Address,
    /// The token with the lower address.
    pub token0: Token,
    pub token1: Token,
    pub tier: FeeTier,
}

/// Loads the state of a pool from an external data source (node, subgraph,
/// ...).
///
/// Implementations are responsible for their own timeouts. A fetch that never
/// settles keeps its key in flight forever unless the cache is configured
/// with a fetch timeout.
#[cfg_attr(any(test, feature = "test-util"), mockall::automock)]
#[async_trait::async_trait]
pub trait PoolFetching: Send + Sync {
    /// Returns `Ok(None)` if it is known for certain that the pool does not
    /// exist (e.g. no contract deployed at the address) and an error if the
    /// state could not be determined.
    async fn fetch(&self, request: &FetchRequest) -> Result<Option<Pool>>;
}
