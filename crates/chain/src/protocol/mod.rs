//! Protocol abstraction layer.
//!
//! Two position models are supported behind one trait:
//!
//! - margin (GMX-v2 style perpetual markets): a position is keyed by
//!   `(account, market, collateralToken, isLong)` and is liquidatable when its
//!   remaining collateral drops below `size * minCollateralFactor`.
//! - lending (AAVE V3 and forks): an account holds several collateral and
//!   debt reserves and is liquidatable when its health factor drops below 1.
//!
//! # Architecture
//!
//! [`LiquidationProtocol`] exposes the reads the engine needs (market
//! metadata, raw position state, the protocol's own liquidatability verdict)
//! and builds the liquidation call. Amounts stay in the protocol's fixed-point
//! scale; conversion happens in the health calculator.
//!
//! ```rust,ignore
//! let market = protocol.market_metadata(position.market_id()).await?;
//! if let Some(raw) = protocol.fetch_position(&position, &market).await? {
//!     let verdict = protocol.check_liquidatable(&position, &market, &prices).await?;
//! }
//! ```

#[cfg(feature = "lending")]
mod lending;
#[cfg(feature = "margin")]
mod margin;

#[cfg(feature = "lending")]
pub use lending::{LendingConfig, LendingProtocol};
#[cfg(feature = "margin")]
pub use margin::{MarginConfig, MarginProtocol};

use crate::error::{ChainError, ChainResult};
use crate::provider::{BatchCall, ProviderManager};
use crate::signer::TxCall;
use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use alloy::sol_types::SolValue;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt::Debug;
use tracing::debug;

/// Which position model a protocol uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Margin,
    Lending,
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Margin => "margin",
            Self::Lending => "lending",
        }
    }
}

/// How the liquidation is funded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Debt is repaid from a flash loan inside the liquidator contract.
    #[default]
    FlashLoan,
    /// Debt (or execution fee) is paid from the signer's wallet.
    WalletFunded,
}

/// Identity of a position as the protocol addresses it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PositionRef {
    Margin {
        account: Address,
        market: Address,
        collateral_token: Address,
        is_long: bool,
    },
    Debt {
        account: Address,
        pool: Address,
    },
}

impl PositionRef {
    /// Canonical position key.
    ///
    /// Margin: `keccak256(abi.encode(account, market, collateralToken, isLong))`.
    /// Debt: the account left-padded to 32 bytes.
    pub fn key(&self) -> B256 {
        match self {
            Self::Margin {
                account,
                market,
                collateral_token,
                is_long,
            } => keccak256((*account, *market, *collateral_token, *is_long).abi_encode()),
            Self::Debt { account, .. } => account.into_word(),
        }
    }

    pub fn account(&self) -> Address {
        match self {
            Self::Margin { account, .. } | Self::Debt { account, .. } => *account,
        }
    }

    /// Market (margin) or pool (lending) the position lives in.
    pub fn market_id(&self) -> Address {
        match self {
            Self::Margin { market, .. } => *market,
            Self::Debt { pool, .. } => *pool,
        }
    }

    pub fn kind(&self) -> ProtocolKind {
        match self {
            Self::Margin { .. } => ProtocolKind::Margin,
            Self::Debt { .. } => ProtocolKind::Lending,
        }
    }
}

/// Raw margin position. USD amounts are 1e30-scaled; token amounts are in
/// the token's smallest unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarginPositionState {
    pub account: Address,
    pub market: Address,
    pub collateral_token: Address,
    pub index_token: Address,
    pub is_long: bool,
    pub size_in_usd: U256,
    pub size_in_tokens: U256,
    pub collateral_amount: U256,
    /// Accrued borrowing and funding fees, in collateral token units
    pub fees_owed: U256,
    pub index_decimals: u8,
}

/// Balance of one reserve inside a lending account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetBalance {
    pub asset: Address,
    pub amount: U256,
    pub decimals: u8,
}

/// Raw lending account: reserves supplied as collateral and reserves borrowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebtPositionState {
    pub account: Address,
    pub collaterals: SmallVec<[AssetBalance; 4]>,
    pub debts: SmallVec<[AssetBalance; 4]>,
}

/// Snapshot of a position in its protocol's own representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawPosition {
    Margin(MarginPositionState),
    Debt(DebtPositionState),
}

impl RawPosition {
    pub fn account(&self) -> Address {
        match self {
            Self::Margin(p) => p.account,
            Self::Debt(p) => p.account,
        }
    }
}

/// Token price as a `{min, max}` band.
///
/// Margin markets quote USD·1e30 per smallest token unit; lending oracles
/// quote base currency·1e8 per whole token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPrice {
    pub min: U256,
    pub max: U256,
}

impl TokenPrice {
    /// Single-point price (oracles without a spread).
    pub fn flat(price: U256) -> Self {
        Self {
            min: price,
            max: price,
        }
    }
}

/// Prices keyed by token address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriceTable {
    prices: HashMap<Address, TokenPrice>,
}

impl PriceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, token: Address, price: TokenPrice) {
        self.prices.insert(token, price);
    }

    pub fn get(&self, token: &Address) -> Option<&TokenPrice> {
        self.prices.get(token)
    }

    /// Price or [`ChainError::MissingPrice`].
    pub fn require(&self, token: Address) -> ChainResult<TokenPrice> {
        self.prices
            .get(&token)
            .copied()
            .ok_or(ChainError::MissingPrice { token })
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Address, &TokenPrice)> {
        self.prices.iter()
    }
}

impl FromIterator<(Address, TokenPrice)> for PriceTable {
    fn from_iter<I: IntoIterator<Item = (Address, TokenPrice)>>(iter: I) -> Self {
        Self {
            prices: iter.into_iter().collect(),
        }
    }
}

/// Static market configuration for a margin market.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarginMarket {
    pub market: Address,
    pub index_token: Address,
    pub long_token: Address,
    pub short_token: Address,
    pub index_decimals: u8,
    /// Live `minCollateralFactor`, WAD-scaled
    pub min_collateral_factor_wad: U256,
}

/// Risk configuration of one lending reserve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveInfo {
    pub asset: Address,
    pub decimals: u8,
    pub liquidation_threshold_bps: u16,
    /// Bonus in basis points over par (500 = 5%)
    pub liquidation_bonus_bps: u16,
    pub usage_as_collateral_enabled: bool,
}

/// Reserve list of a lending pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebtMarket {
    pub pool: Address,
    pub reserves: Vec<ReserveInfo>,
}

impl DebtMarket {
    pub fn reserve(&self, asset: &Address) -> Option<&ReserveInfo> {
        self.reserves.iter().find(|r| &r.asset == asset)
    }
}

/// Market metadata, fetched lazily and cached per market id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarketMetadata {
    Margin(MarginMarket),
    Debt(DebtMarket),
}

/// The protocol's own answer to "can this position be liquidated now?".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnchainVerdict {
    pub liquidatable: bool,
    /// WAD-scaled health factor when the protocol exposes one
    pub health_factor_wad: Option<U256>,
    pub reason: Option<String>,
}

/// Everything needed to build a liquidation call.
#[derive(Debug, Clone)]
pub struct LiquidationRequest {
    pub position: PositionRef,
    pub mode: ExecutionMode,
    pub collateral_asset: Address,
    pub debt_asset: Address,
    /// Debt to repay (lending) in debt token units
    pub debt_to_cover: U256,
    /// Slippage floor for the flash-loan swap
    pub min_amount_out: U256,
    pub swap_data: Bytes,
    /// Native fee attached to keeper-executed orders (margin)
    pub execution_fee: U256,
    /// Position size to close (margin), USD·1e30
    pub size_delta_usd: U256,
    /// Receives seized collateral and fee refunds
    pub receiver: Address,
}

/// Protocol adapter used by the engine.
#[async_trait]
pub trait LiquidationProtocol: Send + Sync + Debug {
    /// Protocol identifier (e.g. "gmx-v2", "aave-v3").
    fn protocol_id(&self) -> &str;

    fn kind(&self) -> ProtocolKind;

    /// Provider backing this adapter.
    fn provider(&self) -> &ProviderManager;

    /// Fetch static market configuration.
    async fn market_metadata(&self, market: Address) -> ChainResult<MarketMetadata>;

    /// Fetch the raw position; `None` when the position no longer exists.
    async fn fetch_position(
        &self,
        position: &PositionRef,
        market: &MarketMetadata,
    ) -> ChainResult<Option<RawPosition>>;

    /// Authoritative liquidatability read.
    async fn check_liquidatable(
        &self,
        position: &PositionRef,
        market: &MarketMetadata,
        prices: &PriceTable,
    ) -> ChainResult<OnchainVerdict>;

    /// Prices straight from the protocol oracle, if it has one.
    async fn oracle_prices(&self, tokens: &[Address]) -> ChainResult<PriceTable>;

    /// Encode the liquidation transaction.
    fn build_liquidation(&self, request: &LiquidationRequest) -> ChainResult<TxCall>;

    /// Batched form of [`LiquidationProtocol::check_liquidatable`].
    fn verdict_call(
        &self,
        position: &PositionRef,
        market: &MarketMetadata,
        prices: &PriceTable,
    ) -> ChainResult<BatchCall>;

    /// Decode the return data of [`LiquidationProtocol::verdict_call`].
    fn decode_verdict(&self, data: &Bytes) -> ChainResult<OnchainVerdict>;

    /// Check many positions through Multicall3, one round trip per batch.
    async fn scan_batch(
        &self,
        positions: &[(PositionRef, MarketMetadata)],
        prices: &PriceTable,
    ) -> ChainResult<Vec<ChainResult<OnchainVerdict>>> {
        let mut results = Vec::with_capacity(positions.len());
        let mut calls = Vec::with_capacity(positions.len());
        let mut slots = Vec::with_capacity(positions.len());

        for (position, market) in positions {
            match self.verdict_call(position, market, prices) {
                Ok(call) => {
                    slots.push(Some(calls.len()));
                    calls.push(call);
                }
                Err(e) => {
                    slots.push(None);
                    results.push(Some(Err(e)));
                    continue;
                }
            }
            results.push(None);
        }

        let returned = self.provider().aggregate(&calls).await?;
        debug!(
            protocol = self.protocol_id(),
            positions = positions.len(),
            calls = calls.len(),
            "Scanned batch"
        );

        Ok(results
            .into_iter()
            .zip(slots)
            .map(|(early, slot)| match (early, slot) {
                (Some(err), _) => err,
                (None, Some(i)) => match returned.get(i).cloned().flatten() {
                    Some(data) => self.decode_verdict(&data),
                    None => Err(ChainError::CallReverted {
                        op: "aggregate3",
                        message: "sub-call reverted".into(),
                    }),
                },
                (None, None) => Err(ChainError::Decode {
                    op: "aggregate3",
                    message: "missing batch slot".into(),
                }),
            })
            .collect())
    }
}

/// WAD (1e18).
pub const WAD: U256 = U256::from_limbs([1_000_000_000_000_000_000, 0, 0, 0]);

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    #[test]
    fn test_margin_key_deterministic() {
        let position = PositionRef::Margin {
            account: address!("1111111111111111111111111111111111111111"),
            market: address!("2222222222222222222222222222222222222222"),
            collateral_token: address!("3333333333333333333333333333333333333333"),
            is_long: true,
        };

        let mut encoded = Vec::new();
        encoded.extend_from_slice(&[0u8; 12]);
        encoded.extend_from_slice(&[0x11; 20]);
        encoded.extend_from_slice(&[0u8; 12]);
        encoded.extend_from_slice(&[0x22; 20]);
        encoded.extend_from_slice(&[0u8; 12]);
        encoded.extend_from_slice(&[0x33; 20]);
        let mut flag = [0u8; 32];
        flag[31] = 1;
        encoded.extend_from_slice(&flag);

        assert_eq!(position.key(), keccak256(&encoded));
        assert_eq!(position.key(), position.clone().key());
    }

    #[test]
    fn test_margin_key_depends_on_direction() {
        let long = PositionRef::Margin {
            account: Address::repeat_byte(1),
            market: Address::repeat_byte(2),
            collateral_token: Address::repeat_byte(3),
            is_long: true,
        };
        let short = PositionRef::Margin {
            account: Address::repeat_byte(1),
            market: Address::repeat_byte(2),
            collateral_token: Address::repeat_byte(3),
            is_long: false,
        };
        assert_ne!(long.key(), short.key());
    }

    #[test]
    fn test_debt_key_is_padded_account() {
        let account = Address::repeat_byte(0xab);
        let position = PositionRef::Debt {
            account,
            pool: Address::ZERO,
        };
        let key = position.key();
        assert_eq!(&key[..12], &[0u8; 12]);
        assert_eq!(&key[12..], account.as_slice());
    }

    #[test]
    fn test_price_table_require() {
        let token = Address::repeat_byte(5);
        let table: PriceTable = [(token, TokenPrice::flat(U256::from(100u64)))]
            .into_iter()
            .collect();

        assert_eq!(table.require(token).unwrap().min, U256::from(100u64));
        assert!(matches!(
            table.require(Address::ZERO),
            Err(ChainError::MissingPrice { .. })
        ));
    }

    #[test]
    fn test_execution_mode_serde() {
        let mode: ExecutionMode = serde_json::from_str("\"wallet_funded\"").unwrap();
        assert_eq!(mode, ExecutionMode::WalletFunded);
        assert_eq!(ExecutionMode::default(), ExecutionMode::FlashLoan);
    }

    #[test]
    fn test_wad_constant() {
        assert_eq!(WAD, U256::from(10u64).pow(U256::from(18u64)));
    }
}
