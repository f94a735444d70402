//! AAVE V3 lending protocol (and forks).
//!
//! Account state is read per reserve from the PoolDataProvider, batched
//! through Multicall3. The Pool's `getUserAccountData` health factor is the
//! authoritative liquidatability signal.

use super::{
    AssetBalance, DebtMarket, DebtPositionState, ExecutionMode, LiquidationProtocol,
    LiquidationRequest, MarketMetadata, OnchainVerdict, PositionRef, PriceTable, ProtocolKind,
    RawPosition, ReserveInfo, TokenPrice, WAD,
};
use crate::error::{ChainError, ChainResult};
use crate::provider::{BatchCall, ProviderManager};
use crate::signer::TxCall;
use alloy::primitives::{Address, Bytes, U256};
use alloy::sol;
use alloy::sol_types::SolCall;
use async_trait::async_trait;
use smallvec::SmallVec;
use tracing::{debug, warn};

sol! {
    #[sol(rpc)]
    interface IPool {
        function getUserAccountData(address user) external view returns (
            uint256 totalCollateralBase,
            uint256 totalDebtBase,
            uint256 availableBorrowsBase,
            uint256 currentLiquidationThreshold,
            uint256 ltv,
            uint256 healthFactor
        );

        function getReservesList() external view returns (address[] memory reserves);

        function liquidationCall(
            address collateralAsset,
            address debtAsset,
            address user,
            uint256 debtToCover,
            bool receiveAToken
        ) external;
    }

    interface IPoolDataProvider {
        function getReserveConfigurationData(address asset) external view returns (
            uint256 decimals,
            uint256 ltv,
            uint256 liquidationThreshold,
            uint256 liquidationBonus,
            uint256 reserveFactor,
            bool usageAsCollateralEnabled,
            bool borrowingEnabled,
            bool stableBorrowRateEnabled,
            bool isActive,
            bool isFrozen
        );

        function getUserReserveData(address asset, address user) external view returns (
            uint256 currentATokenBalance,
            uint256 currentStableDebt,
            uint256 currentVariableDebt,
            uint256 principalStableDebt,
            uint256 scaledVariableDebt,
            uint256 stableBorrowRate,
            uint256 liquidityRate,
            uint40 stableRateLastUpdated,
            bool usageAsCollateralEnabled
        );
    }

    #[sol(rpc)]
    interface IAaveOracle {
        function getAssetsPrices(address[] calldata assets) external view returns (uint256[] memory prices);
    }

    /// Flash-loan liquidator contract
    interface ILiquidator {
        function liquidate(
            address _user,
            address _collateral,
            address _debt,
            uint256 _debtAmount,
            uint256 _minAmountOut,
            bytes calldata _swapData
        ) external returns (uint256);
    }
}

/// Lending protocol addresses.
#[derive(Debug, Clone)]
pub struct LendingConfig {
    pub protocol_id: String,
    pub pool: Address,
    pub data_provider: Address,
    pub oracle: Address,
    /// Flash-loan liquidator contract (required for flash-loan mode)
    pub liquidator: Option<Address>,
}

impl Default for LendingConfig {
    fn default() -> Self {
        Self {
            protocol_id: "aave-v3".to_string(),
            pool: Address::ZERO,
            data_provider: Address::ZERO,
            oracle: Address::ZERO,
            liquidator: None,
        }
    }
}

/// AAVE V3 protocol adapter.
#[derive(Debug)]
pub struct LendingProtocol {
    config: LendingConfig,
    provider: ProviderManager,
}

impl LendingProtocol {
    /// Create a new AAVE V3 protocol adapter.
    pub fn new(config: LendingConfig, provider: ProviderManager) -> Self {
        Self { config, provider }
    }

    fn debt_market<'a>(&self, market: &'a MarketMetadata) -> ChainResult<&'a DebtMarket> {
        match market {
            MarketMetadata::Debt(m) => Ok(m),
            MarketMetadata::Margin(_) => Err(ChainError::Unsupported {
                protocol: "lending",
                message: "margin market metadata passed to lending adapter".into(),
            }),
        }
    }
}

fn decode_error(op: &'static str, e: impl std::fmt::Display) -> ChainError {
    ChainError::Decode {
        op,
        message: e.to_string(),
    }
}

/// Aave stores the bonus as 10000 + bonus (10500 = 5%).
fn bonus_over_par(raw: U256) -> u16 {
    let raw = raw.saturating_to::<u64>();
    raw.saturating_sub(10_000).min(u16::MAX as u64) as u16
}

fn reserve_from(asset: Address, ret: IPoolDataProvider::getReserveConfigurationDataReturn) -> ReserveInfo {
    ReserveInfo {
        asset,
        decimals: ret.decimals.saturating_to::<u8>(),
        liquidation_threshold_bps: ret.liquidationThreshold.saturating_to::<u16>(),
        liquidation_bonus_bps: bonus_over_par(ret.liquidationBonus),
        usage_as_collateral_enabled: ret.usageAsCollateralEnabled,
    }
}

fn verdict_from(ret: IPool::getUserAccountDataReturn) -> OnchainVerdict {
    let has_debt = !ret.totalDebtBase.is_zero();
    let liquidatable = has_debt && ret.healthFactor < WAD;
    OnchainVerdict {
        liquidatable,
        health_factor_wad: has_debt.then_some(ret.healthFactor),
        reason: (!has_debt).then(|| "no debt".to_string()),
    }
}

#[async_trait]
impl LiquidationProtocol for LendingProtocol {
    fn protocol_id(&self) -> &str {
        &self.config.protocol_id
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Lending
    }

    fn provider(&self) -> &ProviderManager {
        &self.provider
    }

    async fn market_metadata(&self, market: Address) -> ChainResult<MarketMetadata> {
        let rpc = self.provider.reader();
        let pool = IPool::new(self.config.pool, &rpc);
        let list = pool.getReservesList();
        let assets = self.provider.timed("getReservesList", list.call()).await?.reserves;

        let calls: Vec<BatchCall> = assets
            .iter()
            .map(|asset| BatchCall {
                target: self.config.data_provider,
                calldata: Bytes::from(
                    IPoolDataProvider::getReserveConfigurationDataCall { asset: *asset }.abi_encode(),
                ),
            })
            .collect();
        let returned = self.provider.aggregate(&calls).await?;

        let mut reserves = Vec::with_capacity(assets.len());
        for (asset, data) in assets.into_iter().zip(returned) {
            let Some(data) = data else {
                warn!(asset = %asset, "Reserve configuration read reverted, skipping reserve");
                continue;
            };
            let ret = IPoolDataProvider::getReserveConfigurationDataCall::abi_decode_returns(&data, true)
                .map_err(|e| decode_error("getReserveConfigurationData", e))?;
            reserves.push(reserve_from(asset, ret));
        }

        debug!(pool = %market, reserves = reserves.len(), "Lending market metadata fetched");

        Ok(MarketMetadata::Debt(DebtMarket {
            pool: market,
            reserves,
        }))
    }

    async fn fetch_position(
        &self,
        position: &PositionRef,
        market: &MarketMetadata,
    ) -> ChainResult<Option<RawPosition>> {
        let market = self.debt_market(market)?;
        let account = position.account();

        let calls: Vec<BatchCall> = market
            .reserves
            .iter()
            .map(|r| BatchCall {
                target: self.config.data_provider,
                calldata: Bytes::from(
                    IPoolDataProvider::getUserReserveDataCall {
                        asset: r.asset,
                        user: account,
                    }
                    .abi_encode(),
                ),
            })
            .collect();
        let returned = self.provider.aggregate(&calls).await?;

        let mut collaterals: SmallVec<[AssetBalance; 4]> = SmallVec::new();
        let mut debts: SmallVec<[AssetBalance; 4]> = SmallVec::new();

        for (reserve, data) in market.reserves.iter().zip(returned) {
            let data = data.ok_or_else(|| ChainError::CallReverted {
                op: "getUserReserveData",
                message: format!("reserve {} reverted", reserve.asset),
            })?;
            let ret = IPoolDataProvider::getUserReserveDataCall::abi_decode_returns(&data, true)
                .map_err(|e| decode_error("getUserReserveData", e))?;

            if !ret.currentATokenBalance.is_zero()
                && ret.usageAsCollateralEnabled
                && reserve.usage_as_collateral_enabled
            {
                collaterals.push(AssetBalance {
                    asset: reserve.asset,
                    amount: ret.currentATokenBalance,
                    decimals: reserve.decimals,
                });
            }

            let debt = ret.currentStableDebt.saturating_add(ret.currentVariableDebt);
            if !debt.is_zero() {
                debts.push(AssetBalance {
                    asset: reserve.asset,
                    amount: debt,
                    decimals: reserve.decimals,
                });
            }
        }

        if collaterals.is_empty() && debts.is_empty() {
            return Ok(None);
        }

        Ok(Some(RawPosition::Debt(DebtPositionState {
            account,
            collaterals,
            debts,
        })))
    }

    async fn check_liquidatable(
        &self,
        position: &PositionRef,
        _market: &MarketMetadata,
        _prices: &PriceTable,
    ) -> ChainResult<OnchainVerdict> {
        let rpc = self.provider.reader();
        let pool = IPool::new(self.config.pool, &rpc);
        let call = pool.getUserAccountData(position.account());
        let ret = self.provider.timed("getUserAccountData", call.call()).await?;
        Ok(verdict_from(ret))
    }

    async fn oracle_prices(&self, tokens: &[Address]) -> ChainResult<PriceTable> {
        if tokens.is_empty() {
            return Ok(PriceTable::new());
        }

        let rpc = self.provider.reader();
        let oracle = IAaveOracle::new(self.config.oracle, &rpc);
        let call = oracle.getAssetsPrices(tokens.to_vec());
        let prices = self.provider.timed("getAssetsPrices", call.call()).await?.prices;

        if prices.len() != tokens.len() {
            return Err(ChainError::Decode {
                op: "getAssetsPrices",
                message: format!("expected {} prices, got {}", tokens.len(), prices.len()),
            });
        }

        Ok(tokens
            .iter()
            .zip(prices)
            .filter(|(_, p)| !p.is_zero())
            .map(|(t, p)| (*t, TokenPrice::flat(p)))
            .collect())
    }

    fn build_liquidation(&self, request: &LiquidationRequest) -> ChainResult<TxCall> {
        let user = request.position.account();

        match request.mode {
            ExecutionMode::WalletFunded => {
                let call = IPool::liquidationCallCall {
                    collateralAsset: request.collateral_asset,
                    debtAsset: request.debt_asset,
                    user,
                    debtToCover: request.debt_to_cover,
                    receiveAToken: false,
                };
                Ok(TxCall {
                    to: self.config.pool,
                    input: Bytes::from(call.abi_encode()),
                    value: U256::ZERO,
                })
            }
            ExecutionMode::FlashLoan => {
                let liquidator = self.config.liquidator.ok_or_else(|| {
                    ChainError::Config("flash-loan mode requires a liquidator contract".into())
                })?;
                let call = ILiquidator::liquidateCall {
                    _user: user,
                    _collateral: request.collateral_asset,
                    _debt: request.debt_asset,
                    _debtAmount: request.debt_to_cover,
                    _minAmountOut: request.min_amount_out,
                    _swapData: request.swap_data.clone(),
                };
                Ok(TxCall {
                    to: liquidator,
                    input: Bytes::from(call.abi_encode()),
                    value: U256::ZERO,
                })
            }
        }
    }

    fn verdict_call(
        &self,
        position: &PositionRef,
        _market: &MarketMetadata,
        _prices: &PriceTable,
    ) -> ChainResult<BatchCall> {
        Ok(BatchCall {
            target: self.config.pool,
            calldata: Bytes::from(
                IPool::getUserAccountDataCall {
                    user: position.account(),
                }
                .abi_encode(),
            ),
        })
    }

    fn decode_verdict(&self, data: &Bytes) -> ChainResult<OnchainVerdict> {
        let ret = IPool::getUserAccountDataCall::abi_decode_returns(data, true)
            .map_err(|e| decode_error("getUserAccountData", e))?;
        Ok(verdict_from(ret))
    }
}
