//! EIP-1559 gas pricing strategy.

use super::{GasParams, GasStrategy};
use crate::error::{ChainError, ChainResult};
use crate::provider::ProviderManager;
use alloy::eips::BlockNumberOrTag;
use alloy::network::TransactionBuilder;
use alloy::providers::Provider;
use alloy::rpc::types::TransactionRequest;
use async_trait::async_trait;

/// EIP-1559 gas pricing strategy.
///
/// `max_fee = base_fee * multiplier + priority_fee`, capped at `max_fee_cap`.
#[derive(Debug)]
pub struct Eip1559GasStrategy {
    /// Default priority fee (tip) in wei.
    default_priority_fee: u128,
    /// Multiplier for max_fee relative to base_fee.
    max_fee_multiplier: f64,
    /// Maximum allowed max_fee_per_gas in wei.
    max_fee_cap: u128,
}

impl Eip1559GasStrategy {
    /// Create a new EIP-1559 gas strategy.
    pub fn new(default_priority_fee: u128, max_fee_multiplier: f64) -> Self {
        Self {
            default_priority_fee,
            max_fee_multiplier,
            max_fee_cap: 500_000_000_000,
        }
    }

    /// Create with a custom max fee cap.
    pub fn with_max_fee_cap(mut self, cap: u128) -> Self {
        self.max_fee_cap = cap;
        self
    }

    fn calculate_max_fee(&self, base_fee: u128, priority_fee: u128) -> u128 {
        let max_fee = ((base_fee as f64) * self.max_fee_multiplier) as u128 + priority_fee;
        max_fee.min(self.max_fee_cap)
    }
}

#[async_trait]
impl GasStrategy for Eip1559GasStrategy {
    async fn fetch_params(&self, provider: &ProviderManager) -> ChainResult<GasParams> {
        let rpc = provider.reader();

        let block = provider
            .timed("eth_getBlockByNumber", async {
                rpc.get_block_by_number(BlockNumberOrTag::Latest).await
            })
            .await?
            .ok_or_else(|| ChainError::Rpc {
                op: "eth_getBlockByNumber",
                message: "latest block unavailable".into(),
            })?;

        let base_fee = block
            .header
            .base_fee_per_gas
            .map(u128::from)
            .ok_or_else(|| ChainError::Rpc {
                op: "eth_getBlockByNumber",
                message: "latest block has no base fee".into(),
            })?;

        // A node without the tip endpoint still has a usable base fee
        let priority_fee = provider
            .timed(
                "eth_maxPriorityFeePerGas",
                rpc.get_max_priority_fee_per_gas(),
            )
            .await
            .unwrap_or(self.default_priority_fee);

        Ok(GasParams::Eip1559 {
            max_fee_per_gas: self.calculate_max_fee(base_fee, priority_fee),
            max_priority_fee_per_gas: priority_fee,
            base_fee,
        })
    }

    fn apply_gas(&self, tx: &mut TransactionRequest, params: &GasParams) {
        match params {
            GasParams::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
                ..
            } => {
                tx.set_max_fee_per_gas(*max_fee_per_gas);
                tx.set_max_priority_fee_per_gas(*max_priority_fee_per_gas);
            }
            GasParams::Legacy { gas_price } => {
                tx.set_max_fee_per_gas(*gas_price);
                tx.set_max_priority_fee_per_gas(self.default_priority_fee.min(*gas_price));
            }
        }
    }

    fn strategy_name(&self) -> &'static str {
        "EIP-1559"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::Address;

    #[test]
    fn test_eip1559_max_fee_calculation() {
        let strategy = Eip1559GasStrategy::new(2_000_000_000, 2.0);

        // 30 * 2.0 + 2 = 62 gwei
        let max_fee = strategy.calculate_max_fee(30_000_000_000, 2_000_000_000);
        assert_eq!(max_fee, 62_000_000_000);
    }

    #[test]
    fn test_eip1559_max_fee_cap() {
        let strategy =
            Eip1559GasStrategy::new(2_000_000_000, 10.0).with_max_fee_cap(100_000_000_000);

        let max_fee = strategy.calculate_max_fee(30_000_000_000, 2_000_000_000);
        assert_eq!(max_fee, 100_000_000_000);
    }

    #[test]
    fn test_eip1559_apply_gas() {
        let strategy = Eip1559GasStrategy::new(2_000_000_000, 1.5);
        let mut tx = TransactionRequest::default().with_to(Address::ZERO);

        let params = GasParams::Eip1559 {
            max_fee_per_gas: 50_000_000_000,
            max_priority_fee_per_gas: 2_000_000_000,
            base_fee: 30_000_000_000,
        };

        strategy.apply_gas(&mut tx, &params);
        assert_eq!(tx.max_fee_per_gas, Some(50_000_000_000));
        assert_eq!(tx.max_priority_fee_per_gas, Some(2_000_000_000));
    }
}
