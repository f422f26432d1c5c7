//! Mapping of cache keys to the address of the pool contract that has to be
//! queried.
//!
//! Pool addresses are a pure function of the key (CREATE2 deployments), so
//! resolved addresses are cached for the lifetime of the process and never
//! invalidated.

use {
    crate::key::{CacheKey, ChainId},
    alloy_primitives::{Address, B256, address, b256, keccak256},
    std::{
        collections::HashMap,
        sync::{Arc, Mutex},
    },
    thiserror::Error,
};

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum AddressError {
    #[error("no pool deployment known for chain {0}")]
    UnsupportedChain(ChainId),
}

/// Computes the pool address for a key.
#[cfg_attr(any(test, feature = "test-util"), mockall::automock)]
pub trait AddressDeriving: Send + Sync {
    fn derive(&self, key: &CacheKey) -> Result<Address, AddressError>;
}

/// Pool factory of a chain together with the hash of the pool init code.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PoolDeployment {
    pub factory: Address,
    pub init_code_digest: B256,
}

/// Uniswap V3 factory, deployed at the same address on all supported chains.
pub const UNISWAP_V3_FACTORY: Address = address!("1F98431c8aD98523631AE4a59f267346ea31F984");
pub const UNISWAP_V3_INIT_CODE_DIGEST: B256 =
    b256!("e34f199b19b2b4f47f68442619d555527d244f78a3297ea89325f843f87b8b54");

/// Derives pool addresses the way Uniswap V3 style factories deploy them.
#[derive(Clone, Debug, Default)]
pub struct Create2Deriver {
    deployments: HashMap<ChainId, PoolDeployment>,
}

impl Create2Deriver {
    pub fn new(deployments: HashMap<ChainId, PoolDeployment>) -> Self {
        Self { deployments }
    }

    /// Canonical Uniswap V3 deployments on mainnet, Optimism, Polygon and
    /// Arbitrum.
    pub fn uniswap_v3() -> Self {
        let deployment = PoolDeployment {
            factory: UNISWAP_V3_FACTORY,
            init_code_digest: UNISWAP_V3_INIT_CODE_DIGEST,
        };
        Self::new(
            [1, 10, 137, 42161]
                .into_iter()
                .map(|chain| (chain, deployment))
                .collect(),
        )
    }

    /// Adds or replaces the deployment of a chain.
    pub fn with_deployment(mut self, chain_id: ChainId, deployment: PoolDeployment) -> Self {
        self.deployments.insert(chain_id, deployment);
        self
    }
}

impl AddressDeriving for Create2Deriver {
    fn derive(&self, key: &CacheKey) -> Result<Address, AddressError> {
        let deployment = self
            .deployments
            .get(&key.chain_id())
            .ok_or(AddressError::UnsupportedChain(key.chain_id()))?;
        let (token0, token1) = key.tokens();

        // keccak256(abi.encode(token0, token1, fee))
        let salt = {
            let mut buffer = [0u8; 96];
            buffer[12..32].copy_from_slice(token0.as_slice());
            buffer[44..64].copy_from_slice(token1.as_slice());
            buffer[92..96].copy_from_slice(&key.tier().fee().to_be_bytes());
            keccak256(buffer)
        };
        Ok(create2_target_address(
            deployment.factory,
            &salt,
            &deployment.init_code_digest,
        ))
    }
}

fn create2_target_address(creator: Address, salt: &B256, init_code_digest: &B256) -> Address {
    let mut preimage = [0xff; 85];
    preimage[1..21].copy_from_slice(creator.as_slice());
    preimage[21..53].copy_from_slice(salt.as_slice());
    preimage[53..85].copy_from_slice(init_code_digest.as_slice());
    Address::from_slice(&keccak256(preimage)[12..])
}

/// Memoizing front of an [`AddressDeriving`] strategy.
pub struct AddressResolver {
    deriver: Arc<dyn AddressDeriving>,
    resolved: Mutex<HashMap<CacheKey, Address>>,
}

impl AddressResolver {
    pub fn new(deriver: Arc<dyn AddressDeriving>) -> Self {
        Self {
            deriver,
            resolved: Default::default(),
        }
    }

    /// Returns the pool address for the key. Only successful derivations are
    /// cached; failures are returned as is and derived again on the next
    /// call.
    pub fn resolve(&self, key: &CacheKey) -> Result<Address, AddressError> {
        if let Some(address) = self.resolved.lock().unwrap().get(key) {
            return Ok(*address);
        }
        // Derivation is pure so racing callers compute the same value and the
        // lock doesn't have to be held while hashing.
        let address = self.deriver.derive(key)?;
        self.resolved.lock().unwrap().insert(*key, address);
        Ok(address)
    }

    pub fn len(&self) -> usize {
        self.resolved.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
