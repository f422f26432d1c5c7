//! Cache of on-chain liquidity pool state.
//!
//! Consumers ask for pools by token pair and fee tier through
//! [`PoolCache::resolve_all`]. The cache derives each pool's address, fetches
//! its state through a [`PoolFetching`] implementation and keeps it fresh
//! based on wall clock time and block progress, while never fetching the same
//! pool twice at once.

pub mod address;
pub mod arguments;
pub mod clock;
pub mod coordinator;
pub mod current_block;
pub mod fetcher;
pub mod key;
pub mod query;
pub mod store;

pub use {
    address::{AddressDeriving, AddressError, Create2Deriver, PoolDeployment},
    clock::{ChainClock, Clock},
    fetcher::{FetchRequest, Pool, PoolFetching},
    key::{CacheKey, ChainId, FeeTier, Token},
    query::{PoolCache, PoolCacheConfig, PoolQuery, PoolQueryResult, QueryOptions},
    store::PoolStatus,
};
