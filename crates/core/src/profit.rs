//! Liquidation sizing and profit estimation.

use crate::health::{token_value_usd, HealthError, HealthMetrics};
use crate::position::RepayAsset;
use crate::u256_math::{self, base_value_wad, mul_div, pow10, BPS_DENOMINATOR};
use alloy::primitives::{Address, U256};
use liquidation_engine_chain::{
    AssetBalance, DebtMarket, DebtPositionState, ExecutionMode, MarginPositionState,
    MarketMetadata, PriceTable, ProtocolKind, RawPosition,
};
use std::fmt;

/// Below this health factor the full debt may be repaid (0.95 WAD).
const FULL_CLOSE_HF_WAD: U256 = U256::from_limbs([950_000_000_000_000_000, 0, 0, 0]);

/// Profit estimate for a liquidation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProfitEstimate {
    /// Liquidation bonus (lending) or fee (margin) captured
    pub gross_profit: f64,
    /// Estimated gas plus execution fee, USD
    pub gas_cost: f64,
    /// Collateral swap slippage in flash-loan mode, USD
    pub slippage_cost: f64,
    pub net_profit: f64,
    pub liquidation_bonus_pct: f64,
}

impl ProfitEstimate {
    /// Check if the liquidation is profitable given a minimum threshold.
    pub fn is_profitable(&self, min_profit: f64) -> bool {
        self.net_profit >= min_profit
    }
}

impl fmt::Display for ProfitEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gross=${:.2} ({}% bonus) - gas=${:.2} - slippage=${:.2} = net=${:.2}",
            self.gross_profit,
            self.liquidation_bonus_pct,
            self.gas_cost,
            self.slippage_cost,
            self.net_profit
        )
    }
}

/// Cost inputs for one planning pass.
#[derive(Debug, Clone, Copy)]
pub struct CostInputs {
    pub gas_price_wei: u128,
    /// Expected gas of the liquidation transaction itself
    pub liquidation_gas: u64,
    /// Gas the keeper is paid for (margin execution fee)
    pub keeper_gas: u64,
    pub native_price_usd: f64,
    /// Margin liquidation fee on remaining collateral
    pub margin_fee_bps: u32,
    pub slippage_bps: u32,
    pub mode: ExecutionMode,
}

/// What to repay and what to expect back.
#[derive(Debug, Clone, PartialEq)]
pub struct LiquidationPlan {
    pub repay_asset: RepayAsset,
    pub repay_amount: U256,
    pub debt_token: Address,
    pub collateral_token: Address,
    pub size_delta: U256,
    pub estimate: ProfitEstimate,
}

/// Size a liquidation and estimate its profit.
pub fn plan_liquidation(
    raw: &RawPosition,
    market: &MarketMetadata,
    prices: &PriceTable,
    metrics: &HealthMetrics,
    costs: &CostInputs,
) -> Result<LiquidationPlan, HealthError> {
    match (raw, market) {
        (RawPosition::Margin(position), MarketMetadata::Margin(_)) => {
            Ok(plan_margin(position, metrics, costs))
        }
        (RawPosition::Debt(position), MarketMetadata::Debt(market)) => {
            plan_debt(position, market, prices, metrics, costs)
        }
        _ => Err(HealthError::ModelMismatch),
    }
}

/// Keeper fee attached to a margin liquidation order.
pub fn execution_fee(gas_price_wei: u128, keeper_gas: u64) -> U256 {
    U256::from(gas_price_wei).saturating_mul(U256::from(keeper_gas))
}

fn gas_cost_usd(costs: &CostInputs) -> f64 {
    let wei = execution_fee(costs.gas_price_wei, costs.liquidation_gas);
    u256_math::wei_to_usd(wei, costs.native_price_usd)
}

fn plan_margin(
    position: &MarginPositionState,
    metrics: &HealthMetrics,
    costs: &CostInputs,
) -> LiquidationPlan {
    let fee = execution_fee(costs.gas_price_wei, costs.keeper_gas);
    let gross = metrics.collateral_value_usd * costs.margin_fee_bps as f64 / 10_000.0;
    let gas = gas_cost_usd(costs) + u256_math::wei_to_usd(fee, costs.native_price_usd);

    LiquidationPlan {
        repay_asset: RepayAsset::Native,
        repay_amount: fee,
        debt_token: position.index_token,
        collateral_token: position.collateral_token,
        size_delta: position.size_in_usd,
        estimate: ProfitEstimate {
            gross_profit: gross,
            gas_cost: gas,
            slippage_cost: 0.0,
            net_profit: gross - gas,
            liquidation_bonus_pct: costs.margin_fee_bps as f64 / 100.0,
        },
    }
}

fn largest<'a>(
    balances: &'a [AssetBalance],
    prices: &PriceTable,
    use_max: bool,
    eligible: impl Fn(&AssetBalance) -> bool,
) -> Result<Option<(&'a AssetBalance, U256)>, HealthError> {
    let mut best: Option<(&AssetBalance, U256)> = None;
    for balance in balances.iter().filter(|b| !b.amount.is_zero() && eligible(b)) {
        let price = prices
            .get(&balance.asset)
            .ok_or(HealthError::MissingPrice {
                token: balance.asset,
            })?;
        let price = if use_max { price.max } else { price.min };
        let value = base_value_wad(balance.amount, price, balance.decimals);
        if best.map_or(true, |(_, v)| value > v) {
            best = Some((balance, value));
        }
    }
    Ok(best)
}

fn plan_debt(
    position: &DebtPositionState,
    market: &DebtMarket,
    prices: &PriceTable,
    metrics: &HealthMetrics,
    costs: &CostInputs,
) -> Result<LiquidationPlan, HealthError> {
    let collateral = largest(&position.collaterals, prices, false, |b| {
        market
            .reserve(&b.asset)
            .is_some_and(|r| r.usage_as_collateral_enabled && r.liquidation_threshold_bps > 0)
    })?;
    let debt = largest(&position.debts, prices, true, |_| true)?;

    let (Some((collateral, collateral_value)), Some((debt, _))) = (collateral, debt) else {
        return Ok(LiquidationPlan {
            repay_asset: RepayAsset::Native,
            repay_amount: U256::ZERO,
            debt_token: Address::ZERO,
            collateral_token: Address::ZERO,
            size_delta: U256::ZERO,
            estimate: ProfitEstimate::default(),
        });
    };

    let bonus_bps = market
        .reserve(&collateral.asset)
        .map_or(0, |r| r.liquidation_bonus_bps);

    let full_close = matches!(metrics.health_factor_wad, Some(hf) if hf < FULL_CLOSE_HF_WAD);
    let mut repay_amount = if full_close {
        debt.amount
    } else {
        debt.amount / U256::from(2u8)
    };

    let debt_price = prices
        .get(&debt.asset)
        .ok_or(HealthError::MissingPrice { token: debt.asset })?
        .max;
    let mut repay_value = base_value_wad(repay_amount, debt_price, debt.decimals);
    let bonus_factor = BPS_DENOMINATOR + U256::from(bonus_bps);
    let mut seize_value = mul_div(repay_value, bonus_factor, BPS_DENOMINATOR);

    // Cannot seize more than the account holds of the chosen collateral
    if seize_value > collateral_value {
        seize_value = collateral_value;
        let capped = mul_div(collateral_value, BPS_DENOMINATOR, bonus_factor);
        repay_amount = mul_div(repay_amount, capped, repay_value);
        repay_value = capped;
    }

    let gross = u256_math::wad_to_f64(seize_value.saturating_sub(repay_value));
    let slippage = match costs.mode {
        ExecutionMode::FlashLoan => {
            u256_math::wad_to_f64(seize_value) * costs.slippage_bps as f64 / 10_000.0
        }
        ExecutionMode::WalletFunded => 0.0,
    };
    let gas = gas_cost_usd(costs);

    Ok(LiquidationPlan {
        repay_asset: RepayAsset::Token(debt.asset),
        repay_amount,
        debt_token: debt.asset,
        collateral_token: collateral.asset,
        size_delta: U256::ZERO,
        estimate: ProfitEstimate {
            gross_profit: gross,
            gas_cost: gas,
            slippage_cost: slippage,
            net_profit: gross - gas - slippage,
            liquidation_bonus_pct: bonus_bps as f64 / 100.0,
        },
    })
}

/// USD per whole native token, read from the protocol-scale price table.
pub fn native_price_usd(kind: ProtocolKind, prices: &PriceTable, native_token: Address) -> f64 {
    prices
        .get(&native_token)
        .map_or(0.0, |p| token_value_usd(kind, pow10(18), p.min, 18))
}
