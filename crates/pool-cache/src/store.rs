//! Table of the latest committed state of every requested pool.
//!
//! Every write replaces a whole [`CacheEntry`] while holding the table's
//! mutex, so readers either see the entry before or after a write, never a
//! mix. The mutex is never held across an `.await`.

use {
    crate::{clock::Clock, fetcher::Pool, key::CacheKey},
    std::{
        collections::HashMap,
        sync::{Arc, Mutex},
        time::Instant,
    },
    tokio::sync::watch,
};

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum PoolStatus {
    /// Never fetched.
    #[default]
    Idle,
    Loading,
    Exists,
    /// The data source confirmed that there is no such pool.
    NotExists,
    /// Fetching failed or the query can't identify a pool.
    Invalid,
}

impl PoolStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Exists => "exists",
            Self::NotExists => "not_exists",
            Self::Invalid => "invalid",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct CacheEntry {
    pub status: PoolStatus,
    /// Only set if `status` is `Exists`.
    pub pool: Option<Arc<Pool>>,
    /// Only set if `status` is `Invalid`.
    pub error: Option<String>,
    /// When the last fetch attempt settled.
    pub last_resolved_at: Option<Instant>,
    /// Block at which the last fetch attempt was started.
    pub last_fetch_started_at_block: Option<u64>,
    /// Number of fetch attempts in a row that ended `Invalid`.
    pub consecutive_failures: u32,
}

pub struct CacheStore {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    clock: Arc<dyn Clock>,
    commits: watch::Sender<u64>,
}

impl CacheStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Default::default(),
            clock,
            commits: watch::Sender::new(0),
        }
    }

    /// Latest committed entry of the key; a default `Idle` entry if the key
    /// was never fetched.
    pub fn get(&self, key: &CacheKey) -> CacheEntry {
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Entries of all keys, read under a single lock acquisition.
    pub fn snapshot<'a>(&self, keys: impl IntoIterator<Item = &'a CacheKey>) -> Vec<CacheEntry> {
        let entries = self.entries.lock().unwrap();
        keys.into_iter()
            .map(|key| entries.get(key).cloned().unwrap_or_default())
            .collect()
    }

    /// Marks a fetch as started at `block`. Keeps nothing of the previous
    /// payload or error. Does nothing if the entry is already `Loading`.
    pub fn set_loading(&self, key: &CacheKey, block: u64) {
        self.try_update(key, |entry| {
            if entry.status == PoolStatus::Loading {
                return false;
            }
            entry.status = PoolStatus::Loading;
            entry.pool = None;
            entry.error = None;
            entry.last_fetch_started_at_block = Some(block);
            true
        });
    }

    pub fn set_resolved(&self, key: &CacheKey, pool: Pool) {
        let now = self.clock.now();
        let pool = Arc::new(pool);
        self.update(key, |entry| {
            entry.status = PoolStatus::Exists;
            entry.pool = Some(pool);
            entry.error = None;
            entry.last_resolved_at = Some(now);
            entry.consecutive_failures = 0;
        });
    }

    pub fn set_absent(&self, key: &CacheKey) {
        let now = self.clock.now();
        self.update(key, |entry| {
            entry.status = PoolStatus::NotExists;
            entry.pool = None;
            entry.error = None;
            entry.last_resolved_at = Some(now);
            entry.consecutive_failures = 0;
        });
    }

    pub fn set_invalid(&self, key: &CacheKey, message: impl Into<String>) {
        let now = self.clock.now();
        let message = message.into();
        self.update(key, |entry| {
            entry.status = PoolStatus::Invalid;
            entry.pool = None;
            entry.error = Some(message);
            entry.last_resolved_at = Some(now);
            entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        });
    }

    /// Receiver that is notified after every committed write. The value is
    /// the number of writes so far.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.commits.subscribe()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update(&self, key: &CacheKey, write: impl FnOnce(&mut CacheEntry)) {
        self.try_update(key, |entry| {
            write(entry);
            true
        });
    }

    /// Applies `write` to the entry of the key. Nothing is committed if it
    /// returns false.
    fn try_update(&self, key: &CacheKey, write: impl FnOnce(&mut CacheEntry) -> bool) {
        {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries.entry(*key).or_default();
            // Build the new entry aside and swap it in so a panic in `write`
            // can't leave a half updated entry behind.
            let mut updated = entry.clone();
            if !write(&mut updated) {
                return;
            }
            *entry = updated;
        }
        self.commits.send_modify(|commits| *commits += 1);
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            clock::ManualClock,
            key::{FeeTier, Token},
        },
        alloy_primitives::{Address, U256},
        std::time::Duration,
        testlib::tokens,
    };

    fn key() -> CacheKey {
        CacheKey::canonicalize(
            Some(1),
            Some(&Token::new(1, tokens::WETH, 18)),
            Some(&Token::new(1, tokens::USDC, 6)),
            Some(FeeTier::Low),
        )
        .unwrap()
    }

    fn pool(liquidity: u128) -> Pool {
        Pool {
            address: Address::repeat_byte(1),
            token0: Token::new(1, tokens::USDC, 6),
            token1: Token::new(1, tokens::WETH, 18),
            tier: FeeTier::Low,
            sqrt_price_x96: U256::from(1u128 << 96),
            liquidity,
            tick: 0,
        }
    }

    #[test]
    fn unknown_key_is_idle() {
        let store = CacheStore::new(Arc::new(ManualClock::new(0)));
        let entry = store.get(&key());
        assert_eq!(entry.status, PoolStatus::Idle);
        assert!(entry.pool.is_none());
        assert!(entry.last_resolved_at.is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn transitions_through_fetch_lifecycle() {
        let clock = Arc::new(ManualClock::new(0));
        let store = CacheStore::new(clock.clone());
        let key = key();

        store.set_loading(&key, 10);
        store.set_loading(&key, 10);
        let entry = store.get(&key);
        assert_eq!(entry.status, PoolStatus::Loading);
        assert_eq!(entry.last_fetch_started_at_block, Some(10));
        assert_eq!(store.len(), 1);

        clock.advance(Duration::from_secs(1));
        store.set_resolved(&key, pool(1000));
        let entry = store.get(&key);
        assert_eq!(entry.status, PoolStatus::Exists);
        assert_eq!(entry.pool.unwrap().liquidity, 1000);
        assert_eq!(entry.last_resolved_at, Some(clock.now()));
        // Settling doesn't touch the block the fetch started at.
        assert_eq!(entry.last_fetch_started_at_block, Some(10));

        store.set_loading(&key, 11);
        assert!(store.get(&key).pool.is_none());

        store.set_absent(&key);
        let entry = store.get(&key);
        assert_eq!(entry.status, PoolStatus::NotExists);
        assert!(entry.pool.is_none());
    }

    #[test]
    fn repeated_loading_is_a_no_op() {
        let store = CacheStore::new(Arc::new(ManualClock::new(0)));
        let mut commits = store.subscribe();
        let key = key();

        store.set_loading(&key, 10);
        store.set_loading(&key, 11);

        assert_eq!(store.get(&key).last_fetch_started_at_block, Some(10));
        assert_eq!(*commits.borrow_and_update(), 1);
    }

    #[test]
    fn counts_consecutive_failures() {
        let store = CacheStore::new(Arc::new(ManualClock::new(0)));
        let key = key();

        store.set_invalid(&key, "boom");
        store.set_invalid(&key, "boom again");
        let entry = store.get(&key);
        assert_eq!(entry.status, PoolStatus::Invalid);
        assert_eq!(entry.error.as_deref(), Some("boom again"));
        assert_eq!(entry.consecutive_failures, 2);

        store.set_resolved(&key, pool(1));
        let entry = store.get(&key);
        assert_eq!(entry.consecutive_failures, 0);
        assert!(entry.error.is_none());
    }

    #[test]
    fn refresh_does_not_mutate_previous_payload() {
        let store = CacheStore::new(Arc::new(ManualClock::new(0)));
        let key = key();

        store.set_resolved(&key, pool(1));
        let before = store.get(&key).pool.unwrap();
        store.set_resolved(&key, pool(2));

        assert_eq!(before.liquidity, 1);
        assert_eq!(store.get(&key).pool.unwrap().liquidity, 2);
    }

    #[test]
    fn notifies_subscribers_on_commit() {
        let store = CacheStore::new(Arc::new(ManualClock::new(0)));
        let mut commits = store.subscribe();
        assert!(!commits.has_changed().unwrap());

        store.set_loading(&key(), 1);
        assert!(commits.has_changed().unwrap());
        assert_eq!(*commits.borrow_and_update(), 1);
    }
}
