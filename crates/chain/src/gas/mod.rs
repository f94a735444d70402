//! Gas strategy abstraction.
//!
//! Two pricing models are supported: Legacy (single `gas_price`) and
//! EIP-1559 (`max_fee_per_gas` + `max_priority_fee_per_gas`). The execution
//! service fetches params once per attempt, applies the configured price
//! buffer with [`GasParams::bumped`] and stamps them onto the request.
//!
//! ```rust,ignore
//! use liquidation_engine_chain::gas::{create_gas_strategy, GasPricing};
//!
//! let strategy = create_gas_strategy(GasPricing::Eip1559, 2.0, 200.0);
//! let params = strategy.fetch_params(&provider).await?.bumped(1_000);
//! ```

mod eip1559;
mod legacy;

pub use eip1559::Eip1559GasStrategy;
pub use legacy::LegacyGasStrategy;

use crate::error::ChainResult;
use crate::provider::ProviderManager;
use alloy::rpc::types::TransactionRequest;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Gas pricing model of the target chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GasPricing {
    #[default]
    Legacy,
    Eip1559,
}

/// Gas parameters fetched from the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GasParams {
    /// Legacy gas pricing (pre-EIP-1559).
    Legacy {
        /// Gas price in wei.
        gas_price: u128,
    },
    /// EIP-1559 gas pricing.
    Eip1559 {
        /// Maximum fee per gas in wei.
        max_fee_per_gas: u128,
        /// Maximum priority fee per gas in wei.
        max_priority_fee_per_gas: u128,
        /// Current base fee (for reference).
        base_fee: u128,
    },
}

impl GasParams {
    /// Get the effective gas price for estimation purposes.
    pub fn effective_gas_price(&self) -> u128 {
        match self {
            GasParams::Legacy { gas_price } => *gas_price,
            GasParams::Eip1559 {
                max_fee_per_gas, ..
            } => *max_fee_per_gas,
        }
    }

    /// Raise the price fields by `bps` basis points (1_000 = +10%), rounding up.
    pub fn bumped(&self, bps: u32) -> Self {
        let bump = |v: u128| -> u128 {
            let scaled = v.saturating_mul(10_000 + bps as u128);
            scaled / 10_000 + u128::from(scaled % 10_000 != 0)
        };
        match self {
            GasParams::Legacy { gas_price } => GasParams::Legacy {
                gas_price: bump(*gas_price),
            },
            GasParams::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
                base_fee,
            } => GasParams::Eip1559 {
                max_fee_per_gas: bump(*max_fee_per_gas),
                max_priority_fee_per_gas: bump(*max_priority_fee_per_gas),
                base_fee: *base_fee,
            },
        }
    }
}

/// Trait for gas pricing strategies.
///
/// Implementations query the chain through the shared [`ProviderManager`], so
/// the usual RPC deadline applies to fee lookups as well.
#[async_trait]
pub trait GasStrategy: Send + Sync + Debug {
    /// Fetch current gas parameters.
    async fn fetch_params(&self, provider: &ProviderManager) -> ChainResult<GasParams>;

    /// Apply gas parameters to a transaction request.
    fn apply_gas(&self, tx: &mut TransactionRequest, params: &GasParams);

    /// Get the strategy name for logging/debugging.
    fn strategy_name(&self) -> &'static str;
}

/// Create a gas strategy from configuration.
///
/// # Arguments
/// * `pricing` - Legacy or EIP-1559
/// * `priority_fee_gwei` - Tip for EIP-1559; ignored for Legacy
/// * `max_gas_price_gwei` - Hard cap applied to the fetched price
pub fn create_gas_strategy(
    pricing: GasPricing,
    priority_fee_gwei: f64,
    max_gas_price_gwei: f64,
) -> Box<dyn GasStrategy> {
    let cap = (max_gas_price_gwei * 1e9) as u128;
    match pricing {
        GasPricing::Eip1559 => Box::new(
            Eip1559GasStrategy::new((priority_fee_gwei * 1e9) as u128, 2.0).with_max_fee_cap(cap),
        ),
        GasPricing::Legacy => Box::new(LegacyGasStrategy::new(1_000_000_000, cap)),
    }
}
