//! Position health calculator.
//!
//! One entry point, [`evaluate`], maps a raw protocol snapshot plus prices and
//! protocol parameters to a common [`HealthMetrics`]. All arithmetic stays in
//! the protocol's fixed-point scale; `f64` only appears in the output.
//!
//! # Margin model
//!
//! ```text
//! remaining     = max(collateral - fees, 0)
//! value (1e30)  = remaining * collateralPrice.min
//! minCollateral = sizeUsd * maintenanceMargin / WAD
//! HF            = value / minCollateral        (inf when minCollateral == 0)
//! ```
//!
//! # Collateralized-debt model
//!
//! ```text
//! HF = sum(collateral_i * price_i.min * threshold_i) / sum(debt_j * price_j.max)
//! ```

use crate::u256_math::{self, base_value_wad, mul_div, pow10, BPS_DENOMINATOR, WAD};
use alloy::primitives::{Address, U256};
use liquidation_engine_chain::{
    DebtPositionState, MarginPositionState, MarketMetadata, PriceTable, ProtocolKind,
    RawPosition, TokenPrice,
};
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HealthError {
    #[error("missing price for token {token}")]
    MissingPrice { token: Address },

    #[error("no liquidation threshold for collateral asset {asset}")]
    MissingThreshold { asset: Address },

    #[error("position model does not match protocol parameters")]
    ModelMismatch,
}

/// Protocol risk parameters, derived from live market metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolParams {
    Margin {
        /// `minCollateralFactor`, WAD-scaled
        maintenance_margin_wad: U256,
    },
    Debt {
        /// Liquidation threshold per reserve; 0 for reserves not usable as collateral
        liquidation_thresholds_bps: HashMap<Address, u16>,
    },
}

impl ProtocolParams {
    pub fn from_market(market: &MarketMetadata) -> Self {
        match market {
            MarketMetadata::Margin(m) => Self::Margin {
                maintenance_margin_wad: m.min_collateral_factor_wad,
            },
            MarketMetadata::Debt(m) => Self::Debt {
                liquidation_thresholds_bps: m
                    .reserves
                    .iter()
                    .map(|r| {
                        let threshold = if r.usage_as_collateral_enabled {
                            r.liquidation_threshold_bps
                        } else {
                            0
                        };
                        (r.asset, threshold)
                    })
                    .collect(),
            },
        }
    }
}

/// Derived health of one position. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetrics {
    /// `f64::INFINITY` when there is nothing to be liquidated against
    pub health_factor: f64,
    /// Index (margin) or collateral (debt) price in USD per whole token
    pub liquidation_price: Option<f64>,
    pub leverage: f64,
    pub collateral_value_usd: f64,
    pub size_value_usd: f64,
    pub unrealized_pnl_usd: f64,
    /// Exact WAD health factor; `None` means infinite
    #[serde(skip)]
    pub health_factor_wad: Option<U256>,
}

impl HealthMetrics {
    /// The authoritative liquidation signal.
    pub fn is_liquidatable(&self) -> bool {
        matches!(self.health_factor_wad, Some(hf) if hf < WAD)
    }
}

/// Evaluate a raw snapshot. Pure and deterministic.
pub fn evaluate(
    raw: &RawPosition,
    prices: &PriceTable,
    params: &ProtocolParams,
) -> Result<HealthMetrics, HealthError> {
    match (raw, params) {
        (
            RawPosition::Margin(position),
            ProtocolParams::Margin {
                maintenance_margin_wad,
            },
        ) => evaluate_margin(position, prices, *maintenance_margin_wad),
        (
            RawPosition::Debt(position),
            ProtocolParams::Debt {
                liquidation_thresholds_bps,
            },
        ) => evaluate_debt(position, prices, liquidation_thresholds_bps),
        _ => Err(HealthError::ModelMismatch),
    }
}

fn require_price(prices: &PriceTable, token: Address) -> Result<TokenPrice, HealthError> {
    prices
        .get(&token)
        .copied()
        .ok_or(HealthError::MissingPrice { token })
}

fn ratio_f64(numerator: U256, denominator: U256) -> f64 {
    if denominator.is_zero() {
        return f64::INFINITY;
    }
    u256_math::wad_to_f64(mul_div(numerator, WAD, denominator))
}

fn evaluate_margin(
    position: &MarginPositionState,
    prices: &PriceTable,
    maintenance_margin_wad: U256,
) -> Result<HealthMetrics, HealthError> {
    let collateral_price = require_price(prices, position.collateral_token)?;
    let index_price = require_price(prices, position.index_token)?;

    let remaining = position.collateral_amount.saturating_sub(position.fees_owed);
    let collateral_value = remaining.saturating_mul(collateral_price.min);
    let min_collateral = mul_div(position.size_in_usd, maintenance_margin_wad, WAD);

    let health_factor_wad = if min_collateral.is_zero() {
        None
    } else {
        Some(mul_div(collateral_value, WAD, min_collateral))
    };

    // Longs are marked at the bid, shorts at the ask
    let mark = if position.is_long {
        index_price.min
    } else {
        index_price.max
    };
    let size_at_mark = position.size_in_tokens.saturating_mul(mark);
    let pnl = u256_math::usd30_to_f64(size_at_mark) - u256_math::usd30_to_f64(position.size_in_usd);
    let unrealized_pnl_usd = if position.is_long { pnl } else { -pnl };

    let liquidation_price = margin_liquidation_price(
        position,
        mark,
        collateral_value,
        min_collateral,
    );

    Ok(HealthMetrics {
        health_factor: health_factor_wad.map_or(f64::INFINITY, u256_math::wad_to_f64),
        liquidation_price,
        leverage: ratio_f64(position.size_in_usd, collateral_value),
        collateral_value_usd: u256_math::usd30_to_f64(collateral_value),
        size_value_usd: u256_math::usd30_to_f64(position.size_in_usd),
        unrealized_pnl_usd,
        health_factor_wad,
    })
}

/// Mark price shifted by the collateral buffer spread over the position's
/// tokens, in the adverse direction.
fn margin_liquidation_price(
    position: &MarginPositionState,
    mark: U256,
    collateral_value: U256,
    min_collateral: U256,
) -> Option<f64> {
    if position.size_in_tokens.is_zero() {
        return None;
    }

    let (buffer, healthy) = if collateral_value >= min_collateral {
        (collateral_value - min_collateral, true)
    } else {
        (min_collateral - collateral_value, false)
    };
    let move_per_unit = buffer / position.size_in_tokens;

    // Long loses when price falls; an unhealthy long already sits above its
    // liquidation price.
    let adverse_down = position.is_long == healthy;
    let per_unit = if adverse_down {
        mark.saturating_sub(move_per_unit)
    } else {
        mark.saturating_add(move_per_unit)
    };

    Some(u256_math::usd30_to_f64(per_unit) * 10f64.powi(position.index_decimals as i32))
}

fn evaluate_debt(
    position: &DebtPositionState,
    prices: &PriceTable,
    thresholds: &HashMap<Address, u16>,
) -> Result<HealthMetrics, HealthError> {
    let mut collateral_wad = U256::ZERO;
    let mut adjusted_wad = U256::ZERO;
    let mut backing = Vec::with_capacity(position.collaterals.len());

    for balance in position.collaterals.iter().filter(|b| !b.amount.is_zero()) {
        let threshold = *thresholds
            .get(&balance.asset)
            .ok_or(HealthError::MissingThreshold {
                asset: balance.asset,
            })?;
        if threshold == 0 {
            continue;
        }
        let price = require_price(prices, balance.asset)?;
        let value = base_value_wad(balance.amount, price.min, balance.decimals);
        collateral_wad = collateral_wad.saturating_add(value);
        adjusted_wad = adjusted_wad
            .saturating_add(mul_div(value, U256::from(threshold), BPS_DENOMINATOR));
        backing.push(price.min);
    }

    let mut debt_wad = U256::ZERO;
    for balance in position.debts.iter().filter(|b| !b.amount.is_zero()) {
        let price = require_price(prices, balance.asset)?;
        debt_wad = debt_wad.saturating_add(base_value_wad(balance.amount, price.max, balance.decimals));
    }

    let health_factor_wad = if debt_wad.is_zero() {
        None
    } else {
        Some(mul_div(adjusted_wad, WAD, debt_wad))
    };
    let health_factor = health_factor_wad.map_or(f64::INFINITY, u256_math::wad_to_f64);

    // Only meaningful when a single asset backs the debt
    let liquidation_price = match (backing.as_slice(), health_factor_wad) {
        ([price], Some(hf)) if !hf.is_zero() => {
            Some(u256_math::to_f64(mul_div(*price, WAD, hf), u256_math::BASE_DECIMALS))
        }
        _ => None,
    };

    let leverage = if collateral_wad > debt_wad {
        ratio_f64(collateral_wad, collateral_wad - debt_wad)
    } else {
        f64::INFINITY
    };

    Ok(HealthMetrics {
        health_factor,
        liquidation_price,
        leverage,
        collateral_value_usd: u256_math::wad_to_f64(collateral_wad),
        size_value_usd: u256_math::wad_to_f64(debt_wad),
        unrealized_pnl_usd: 0.0,
        health_factor_wad,
    })
}

/// Value of `amount` token units at a protocol-scale price, in USD.
pub fn token_value_usd(kind: ProtocolKind, amount: U256, price: U256, decimals: u8) -> f64 {
    match kind {
        ProtocolKind::Margin => u256_math::usd30_to_f64(amount.saturating_mul(price)),
        ProtocolKind::Lending => {
            u256_math::wad_to_f64(base_value_wad(amount, price, decimals))
        }
    }
}

/// USD per whole token for a protocol-scale price.
pub fn whole_token_usd(kind: ProtocolKind, price: U256, decimals: u8) -> f64 {
    token_value_usd(kind, pow10(decimals), price, decimals)
}
