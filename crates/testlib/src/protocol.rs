//! Mainnet addresses of Uniswap V3 pools, useful to check address derivation
//! against deployed contracts.

use alloy_primitives::{Address, address};

/// `USDC/WETH` pool with a 0.05% fee.
pub const UNISWAP_V3_USDC_WETH_500: Address = address!("88e6A0c2dDD26FEEb64F039a2c41296FcB3f5640");

/// `USDC/WETH` pool with a 0.3% fee.
pub const UNISWAP_V3_USDC_WETH_3000: Address =
    address!("8ad599c3A0ff1De082011EFDDc58f1908eb6e6D8");
