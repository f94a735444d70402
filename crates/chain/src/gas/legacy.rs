//! Legacy gas pricing strategy (pre-EIP-1559).

use super::{GasParams, GasStrategy};
use crate::error::ChainResult;
use crate::provider::ProviderManager;
use alloy::network::TransactionBuilder;
use alloy::rpc::types::TransactionRequest;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Legacy gas pricing strategy.
///
/// Uses a single `gas_price` field. The last observed price is cached so the
/// sender can log it without another round trip.
#[derive(Debug)]
pub struct LegacyGasStrategy {
    /// Floor gas price in wei.
    min_gas_price: u128,
    /// Maximum gas price in wei.
    max_gas_price: u128,
    /// Cached gas price.
    cached_gas_price: AtomicU64,
}

impl LegacyGasStrategy {
    /// Create a new Legacy gas strategy.
    pub fn new(min_gas_price: u128, max_gas_price: u128) -> Self {
        Self {
            min_gas_price,
            max_gas_price,
            cached_gas_price: AtomicU64::new(min_gas_price as u64),
        }
    }

    /// Get the cached gas price.
    pub fn cached_gas_price(&self) -> u128 {
        self.cached_gas_price.load(Ordering::Relaxed) as u128
    }

    /// Clamp into `[min, max]` and cache.
    pub fn update_cache(&self, gas_price: u128) -> u128 {
        let clamped = gas_price.max(self.min_gas_price).min(self.max_gas_price);
        self.cached_gas_price.store(clamped as u64, Ordering::Relaxed);
        clamped
    }
}

#[async_trait]
impl GasStrategy for LegacyGasStrategy {
    async fn fetch_params(&self, provider: &ProviderManager) -> ChainResult<GasParams> {
        let observed = provider.gas_price().await?;
        let gas_price = self.update_cache(observed);
        debug!(observed = observed, applied = gas_price, "Legacy gas price fetched");

        Ok(GasParams::Legacy { gas_price })
    }

    fn apply_gas(&self, tx: &mut TransactionRequest, params: &GasParams) {
        match params {
            GasParams::Legacy { gas_price } => {
                tx.set_gas_price(*gas_price);
            }
            GasParams::Eip1559 { max_fee_per_gas, .. } => {
                tx.set_gas_price(*max_fee_per_gas);
            }
        }
    }

    fn strategy_name(&self) -> &'static str {
        "Legacy"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::Address;

    #[test]
    fn test_legacy_cache_clamps() {
        let strategy = LegacyGasStrategy::new(1_000_000_000, 10_000_000_000);

        assert_eq!(strategy.update_cache(5_000_000_000), 5_000_000_000);
        assert_eq!(strategy.cached_gas_price(), 5_000_000_000);

        assert_eq!(strategy.update_cache(20_000_000_000), 10_000_000_000);
        assert_eq!(strategy.update_cache(1), 1_000_000_000);
    }

    #[test]
    fn test_legacy_apply_gas() {
        let strategy = LegacyGasStrategy::new(1_000_000_000, 10_000_000_000);
        let mut tx = TransactionRequest::default().with_to(Address::ZERO);

        let params = GasParams::Legacy {
            gas_price: 5_000_000_000,
        };

        strategy.apply_gas(&mut tx, &params);
        assert_eq!(tx.gas_price(), Some(5_000_000_000));
    }
}
