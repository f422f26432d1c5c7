//! Canonical cache keys for pool lookups.
//!
//! A pool is identified by its chain, its two tokens and its fee tier. Callers
//! may submit the tokens in either order, so the key always stores the token
//! with the lower address first. Two logically identical requests therefore
//! share a single cache slot.

use {
    alloy_primitives::Address,
    std::{
        cmp::Ordering,
        fmt::{self, Display, Formatter},
    },
    thiserror::Error,
};

pub type ChainId = u64;

/// An ERC20 token on a specific chain.
///
/// Pools order their tokens by address only, see [`Token::sorts_before`].
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Token {
    pub chain_id: ChainId,
    pub address: Address,
    pub decimals: u8,
    pub symbol: Option<String>,
}

impl Token {
    pub fn new(chain_id: ChainId, address: Address, decimals: u8) -> Self {
        Self {
            chain_id,
            address,
            decimals,
            symbol: None,
        }
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    /// Whether this token sorts before `other` in a pool.
    pub fn sorts_before(&self, other: &Token) -> bool {
        self.address < other.address
    }
}

/// Fee levels a pool can be deployed with. The discriminant is the fee in
/// hundredths of a basis point, the unit pool contracts use.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum FeeTier {
    Lowest = 100,
    Low = 500,
    Medium = 3000,
    High = 10000,
}

impl FeeTier {
    pub const ALL: [FeeTier; 4] = [Self::Lowest, Self::Low, Self::Medium, Self::High];

    /// Fee in hundredths of a basis point (`3000` is 0.3%).
    pub fn fee(self) -> u32 {
        self as u32
    }

    pub fn tick_spacing(self) -> i32 {
        match self {
            Self::Lowest => 1,
            Self::Low => 10,
            Self::Medium => 60,
            Self::High => 200,
        }
    }
}

#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
#[error("unsupported fee tier {0}")]
pub struct UnsupportedFeeTier(pub u32);

impl TryFrom<u32> for FeeTier {
    type Error = UnsupportedFeeTier;

    fn try_from(fee: u32) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|tier| tier.fee() == fee)
            .ok_or(UnsupportedFeeTier(fee))
    }
}

impl Display for FeeTier {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fee())
    }
}

/// Order independent identifier of a pool. `token0` is always the token with
/// the lower address and the two tokens are never equal.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CacheKey {
    chain_id: ChainId,
    token0: Address,
    token1: Address,
    tier: FeeTier,
}

impl CacheKey {
    /// Builds the key for a pool query. Returns `None` if any part is missing,
    /// both tokens are the same, or a token lives on a different chain.
    pub fn canonicalize(
        chain_id: Option<ChainId>,
        token_a: Option<&Token>,
        token_b: Option<&Token>,
        tier: Option<FeeTier>,
    ) -> Option<Self> {
        let (chain_id, token_a, token_b, tier) = (chain_id?, token_a?, token_b?, tier?);
        if token_a.chain_id != chain_id || token_b.chain_id != chain_id {
            return None;
        }
        let (token0, token1) = match token_a.address.cmp(&token_b.address) {
            Ordering::Less => (token_a.address, token_b.address),
            Ordering::Equal => return None,
            Ordering::Greater => (token_b.address, token_a.address),
        };
        Some(Self {
            chain_id,
            token0,
            token1,
            tier,
        })
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    /// The lower and the higher token address.
    pub fn tokens(&self) -> (Address, Address) {
        (self.token0, self.token1)
    }

    pub fn tier(&self) -> FeeTier {
        self.tier
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.chain_id, self.token0, self.token1, self.tier
        )
    }
}
