//! Liquidation candidates and per-cycle bookkeeping.

use crate::health::HealthMetrics;
use crate::profit::{LiquidationPlan, ProfitEstimate};
use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use liquidation_engine_chain::{MarketMetadata, PositionRef, RawPosition};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What the liquidator pays with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "token", rename_all = "lowercase")]
pub enum RepayAsset {
    /// Native token (margin execution fee)
    Native,
    /// ERC-20 debt token
    Token(Address),
}

/// A position verified liquidatable on chain, ready for the risk pipeline.
#[derive(Debug, Clone)]
pub struct LiquidationCandidate {
    pub position: PositionRef,
    pub key: B256,
    pub raw: RawPosition,
    pub market: MarketMetadata,
    pub metrics: HealthMetrics,
    pub repay_asset: RepayAsset,
    /// In the repay asset's smallest unit
    pub repay_amount: U256,
    pub debt_token: Address,
    pub collateral_token: Address,
    /// Margin: USD·1e30 to close. Lending: zero.
    pub size_delta: U256,
    pub size_usd: f64,
    pub profit: ProfitEstimate,
    pub native_price_usd: f64,
    /// The index flagged this position as liquidatable (advisory only)
    pub index_flagged: bool,
    pub discovered_at: DateTime<Utc>,
}

impl LiquidationCandidate {
    pub fn new(
        position: PositionRef,
        raw: RawPosition,
        market: MarketMetadata,
        metrics: HealthMetrics,
        plan: LiquidationPlan,
        native_price_usd: f64,
        index_flagged: bool,
    ) -> Self {
        Self {
            key: position.key(),
            size_usd: metrics.size_value_usd,
            position,
            raw,
            market,
            metrics,
            repay_asset: plan.repay_asset,
            repay_amount: plan.repay_amount,
            debt_token: plan.debt_token,
            collateral_token: plan.collateral_token,
            size_delta: plan.size_delta,
            profit: plan.estimate,
            native_price_usd,
            index_flagged,
            discovered_at: Utc::now(),
        }
    }

    pub fn account(&self) -> Address {
        self.position.account()
    }
}

/// Lifecycle of a position within one cycle. Nothing carries over between cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStage {
    Indexed,
    VerifiedHealthy,
    VerifiedLiquidatable,
    ExecutionAttempted,
    Succeeded,
    Failed,
}

impl fmt::Display for PositionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Indexed => "indexed",
            Self::VerifiedHealthy => "verified_healthy",
            Self::VerifiedLiquidatable => "verified_liquidatable",
            Self::ExecutionAttempted => "execution_attempted",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Stage counters for one monitor cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub indexed: usize,
    pub verified_healthy: usize,
    pub verified_liquidatable: usize,
    pub execution_attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Rejected by the risk pipeline
    pub rejected: usize,
    /// Dropped before verification (unresolvable, skipped market, RPC error)
    pub skipped: usize,
    /// Index said liquidatable, chain said healthy
    pub mismatches: usize,
    pub realized_pnl_usd: f64,
}

impl CycleReport {
    pub fn record(&mut self, stage: PositionStage) {
        match stage {
            PositionStage::Indexed => self.indexed += 1,
            PositionStage::VerifiedHealthy => self.verified_healthy += 1,
            PositionStage::VerifiedLiquidatable => self.verified_liquidatable += 1,
            PositionStage::ExecutionAttempted => self.execution_attempted += 1,
            PositionStage::Succeeded => self.succeeded += 1,
            PositionStage::Failed => self.failed += 1,
        }
    }

    pub fn count(&self, stage: PositionStage) -> usize {
        match stage {
            PositionStage::Indexed => self.indexed,
            PositionStage::VerifiedHealthy => self.verified_healthy,
            PositionStage::VerifiedLiquidatable => self.verified_liquidatable,
            PositionStage::ExecutionAttempted => self.execution_attempted,
            PositionStage::Succeeded => self.succeeded,
            PositionStage::Failed => self.failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_report_counts() {
        let mut report = CycleReport::default();
        for stage in [
            PositionStage::Indexed,
            PositionStage::Indexed,
            PositionStage::VerifiedLiquidatable,
            PositionStage::ExecutionAttempted,
            PositionStage::Succeeded,
        ] {
            report.record(stage);
        }
        assert_eq!(report.count(PositionStage::Indexed), 2);
        assert_eq!(report.count(PositionStage::Succeeded), 1);
        assert_eq!(report.count(PositionStage::Failed), 0);
    }

    #[test]
    fn test_repay_asset_serde() {
        let json = serde_json::to_string(&RepayAsset::Native).unwrap();
        assert_eq!(json, r#"{"type":"native"}"#);
        let token = RepayAsset::Token(Address::with_last_byte(7));
        let back: RepayAsset = serde_json::from_str(&serde_json::to_string(&token).unwrap()).unwrap();
        assert_eq!(back, token);
        assert_eq!(PositionStage::VerifiedHealthy.to_string(), "verified_healthy");
    }
}
