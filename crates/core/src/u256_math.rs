//! Fixed-point U256 helpers.
//!
//! Three scales are in play and never mixed inside one computation:
//! - margin USD: 1e30 per smallest token unit (`USD_30`)
//! - ratios (health factor, collateral factors): WAD, 1e18
//! - lending base currency: 1e8 per whole token (`BASE_8`)
//!
//! Conversion to `f64` is for reporting only and happens at the edges.

use alloy::primitives::U256;

pub use liquidation_engine_chain::WAD;

/// Basis points denominator (10000 = 100%)
pub const BPS_DENOMINATOR: U256 = U256::from_limbs([10_000, 0, 0, 0]);

/// Decimals of margin USD amounts.
pub const USD_DECIMALS: u8 = 30;

/// Decimals of lending base-currency prices.
pub const BASE_DECIMALS: u8 = 8;

/// Wei per gwei.
pub const GWEI: u128 = 1_000_000_000;

/// 10^exp as U256.
#[inline]
pub fn pow10(exp: u8) -> U256 {
    U256::from(10u64).pow(U256::from(exp))
}

/// `a * b / d`, falling back to `a / d * b` when the product overflows.
/// Returns `U256::MAX` for `d == 0`.
#[inline]
pub fn mul_div(a: U256, b: U256, d: U256) -> U256 {
    if d.is_zero() {
        return U256::MAX;
    }
    match a.checked_mul(b) {
        Some(product) => product / d,
        None => (a / d).saturating_mul(b),
    }
}

/// value * (10000 - bps) / 10000
#[inline]
pub fn apply_bps_down(value: U256, bps: u32) -> U256 {
    let factor = U256::from(10_000u32.saturating_sub(bps));
    mul_div(value, factor, BPS_DENOMINATOR)
}

/// value * (10000 + bps) / 10000, rounded up.
///
/// `apply_bps_up(1000, 2000) == 1200`
#[inline]
pub fn apply_bps_up(value: U256, bps: u32) -> U256 {
    let factor = U256::from(10_000u64 + bps as u64);
    let scaled = value.saturating_mul(factor);
    let (q, r) = scaled.div_rem(BPS_DENOMINATOR);
    if r.is_zero() {
        q
    } else {
        q + U256::from(1u8)
    }
}

/// Convert a fixed-point value with `decimals` decimals to f64.
pub fn to_f64(value: U256, decimals: u8) -> f64 {
    let divisor = pow10(decimals);
    let (whole, frac) = value.div_rem(divisor);
    u256_as_f64(whole) + u256_as_f64(frac) / u256_as_f64(divisor)
}

/// Lossy U256 -> f64 (exact up to 2^53).
pub fn u256_as_f64(value: U256) -> f64 {
    let limbs = value.as_limbs();
    let mut out = 0.0f64;
    for limb in limbs.iter().rev() {
        out = out * 18_446_744_073_709_551_616.0 + *limb as f64;
    }
    out
}

/// WAD -> f64.
#[inline]
pub fn wad_to_f64(wad: U256) -> f64 {
    to_f64(wad, 18)
}

/// Margin USD (1e30) -> f64 dollars.
#[inline]
pub fn usd30_to_f64(usd: U256) -> f64 {
    to_f64(usd, USD_DECIMALS)
}

/// f64 -> WAD. Negative inputs clamp to zero.
pub fn f64_to_wad(value: f64) -> U256 {
    if value <= 0.0 || !value.is_finite() {
        return U256::ZERO;
    }
    U256::from((value * 1e18) as u128)
}

/// Gwei ceiling -> wei, rounded to the nearest wei.
pub fn gwei_to_wei(gwei: f64) -> u128 {
    if gwei <= 0.0 || !gwei.is_finite() {
        return 0;
    }
    (gwei * GWEI as f64).round() as u128
}

/// Value of `amount` (token units, `decimals`) at a base-currency price
/// (1e8 per whole token), expressed in WAD.
///
/// `1000 USDC (6 decimals) at 1e8 == 1000 * WAD`
pub fn base_value_wad(amount: U256, price: U256, decimals: u8) -> U256 {
    if amount.is_zero() || price.is_zero() {
        return U256::ZERO;
    }
    let adjustment = 18i32 - decimals as i32 - BASE_DECIMALS as i32;
    if adjustment >= 0 {
        amount
            .saturating_mul(price)
            .saturating_mul(pow10(adjustment as u8))
    } else {
        mul_div(amount, price, pow10((-adjustment) as u8))
    }
}

/// Native-token cost in USD for `wei` at `native_price_usd` per whole token.
pub fn wei_to_usd(wei: U256, native_price_usd: f64) -> f64 {
    to_f64(wei, 18) * native_price_usd
}

/// USD -> wei of the native token at `native_price_usd`.
pub fn usd_to_wei(usd: f64, native_price_usd: f64) -> U256 {
    if native_price_usd <= 0.0 {
        return U256::ZERO;
    }
    f64_to_wad(usd / native_price_usd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_bps() {
        let value = U256::from(1000u64);
        assert_eq!(apply_bps_down(value, 100), U256::from(990u64));
        assert_eq!(apply_bps_up(value, 2000), U256::from(1200u64));
        // 7 * 1.1 = 7.7 rounds up
        assert_eq!(apply_bps_up(U256::from(7u64), 1000), U256::from(8u64));
    }

    #[test]
    fn test_base_value_wad() {
        // 1000 USDC (6 decimals) at $1.00
        let usd = base_value_wad(U256::from(1_000_000_000u64), U256::from(100_000_000u64), 6);
        assert_eq!(usd, U256::from(1000u64) * WAD);

        // 1.5 ETH at $2000
        let usd = base_value_wad(
            U256::from(1_500_000_000_000_000_000u128),
            U256::from(200_000_000_000u64),
            18,
        );
        assert_eq!(usd, U256::from(3000u64) * WAD);
    }

    #[test]
    fn test_to_f64_scales() {
        assert_eq!(wad_to_f64(U256::from(1000u64) * WAD), 1000.0);
        assert_eq!(usd30_to_f64(U256::from(5u64) * pow10(29)), 0.5);
        assert!((to_f64(U256::from(123_456_789u64), 8) - 1.23456789).abs() < 1e-12);
    }

    #[test]
    fn test_mul_div_overflow_fallback() {
        let big = U256::MAX / U256::from(2u64);
        let result = mul_div(big, U256::from(4u64), U256::from(4u64));
        assert!(result > U256::ZERO);
        assert_eq!(mul_div(U256::from(1u64), U256::from(1u64), U256::ZERO), U256::MAX);
    }

    #[test]
    fn test_gwei_to_wei() {
        assert_eq!(gwei_to_wei(5.0), 5_000_000_000);
        assert_eq!(gwei_to_wei(5.0000001), 5_000_000_100);
        assert_eq!(gwei_to_wei(-1.0), 0);
    }

    #[test]
    fn test_wei_usd_round_trip() {
        let wei = usd_to_wei(3.0, 3000.0);
        assert_eq!(wei, U256::from(1_000_000_000_000_000u64));
        assert!((wei_to_usd(wei, 3000.0) - 3.0).abs() < 1e-9);
    }
}
