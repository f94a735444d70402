//! GMX-v2 style margin protocol.
//!
//! Positions live in a shared DataStore and are read through a Reader
//! contract. Liquidations are submitted as Liquidation orders through the
//! ExchangeRouter: the execution fee is wrapped into the order vault with
//! `sendWnt` and the order is created in the same `multicall`.

use super::{
    LiquidationProtocol, LiquidationRequest, MarginMarket, MarginPositionState, MarketMetadata,
    OnchainVerdict, PositionRef, PriceTable, ProtocolKind, RawPosition, WAD,
};
use crate::error::{ChainError, ChainResult};
use crate::provider::{BatchCall, ProviderManager};
use crate::signer::TxCall;
use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use alloy::sol;
use alloy::sol_types::{SolCall, SolValue};
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::debug;

sol! {
    #[sol(rpc)]
    interface IMarginReader {
        struct PositionProps {
            address account;
            address market;
            address collateralToken;
            bool isLong;
            uint256 sizeInUsd;
            uint256 sizeInTokens;
            uint256 collateralAmount;
            uint256 pendingFeesAmount;
        }

        struct MarketProps {
            address marketToken;
            address indexToken;
            address longToken;
            address shortToken;
        }

        struct PriceProps {
            uint256 min;
            uint256 max;
        }

        struct MarketPrices {
            PriceProps indexTokenPrice;
            PriceProps longTokenPrice;
            PriceProps shortTokenPrice;
        }

        function getPosition(address dataStore, bytes32 key) external view returns (PositionProps memory position);

        function getMarket(address dataStore, address key) external view returns (MarketProps memory market);

        function isPositionLiquidatable(
            address dataStore,
            address referralStorage,
            bytes32 positionKey,
            address market,
            MarketPrices memory prices,
            bool shouldValidateMinCollateralUsd
        ) external view returns (bool liquidatable, string memory reason, uint256 remainingCollateralUsd, uint256 minCollateralUsd);
    }

    #[sol(rpc)]
    interface IDataStore {
        function getUint(bytes32 key) external view returns (uint256 value);
    }

    interface IExchangeRouter {
        struct CreateOrderParamsAddresses {
            address account;
            address receiver;
            address cancellationReceiver;
            address callbackContract;
            address uiFeeReceiver;
            address market;
            address initialCollateralToken;
            address[] swapPath;
        }

        struct CreateOrderParamsNumbers {
            uint256 sizeDeltaUsd;
            uint256 initialCollateralDeltaAmount;
            uint256 triggerPrice;
            uint256 acceptablePrice;
            uint256 executionFee;
            uint256 callbackGasLimit;
            uint256 minOutputAmount;
            uint256 validFromTime;
        }

        struct CreateOrderParams {
            CreateOrderParamsAddresses addresses;
            CreateOrderParamsNumbers numbers;
            uint8 orderType;
            uint8 decreasePositionSwapType;
            bool isLong;
            bool shouldUnwrapNativeToken;
            bool autoCancel;
            bytes32 referralCode;
        }

        function sendWnt(address receiver, uint256 amount) external payable;
        function createOrder(CreateOrderParams calldata params) external payable returns (bytes32);
        function multicall(bytes[] calldata data) external payable returns (bytes[] memory results);
    }
}

/// Order type discriminant for liquidation orders.
pub const LIQUIDATION_ORDER_TYPE: u8 = 7;

/// 1e12: converts 1e30 factors to WAD.
const FACTOR_TO_WAD: U256 = U256::from_limbs([1_000_000_000_000, 0, 0, 0]);

/// `keccak256(abi.encode("MIN_COLLATERAL_FACTOR"))`
fn min_collateral_factor_root() -> B256 {
    keccak256("MIN_COLLATERAL_FACTOR".to_string().abi_encode())
}

/// DataStore key for a market's minimum collateral factor.
pub fn min_collateral_factor_key(market: Address) -> B256 {
    keccak256((min_collateral_factor_root(), market).abi_encode())
}

/// Margin protocol addresses.
#[derive(Debug, Clone)]
pub struct MarginConfig {
    pub protocol_id: String,
    pub reader: Address,
    pub data_store: Address,
    pub referral_storage: Address,
    pub exchange_router: Address,
    pub order_vault: Address,
    pub callback_gas_limit: U256,
    /// Decimals for index tokens without an ERC-20 `decimals()` (synthetics)
    pub index_decimals: HashMap<Address, u8>,
}

impl Default for MarginConfig {
    fn default() -> Self {
        Self {
            protocol_id: "gmx-v2".to_string(),
            reader: Address::ZERO,
            data_store: Address::ZERO,
            referral_storage: Address::ZERO,
            exchange_router: Address::ZERO,
            order_vault: Address::ZERO,
            callback_gas_limit: U256::ZERO,
            index_decimals: HashMap::new(),
        }
    }
}

/// GMX-v2 style margin protocol adapter.
#[derive(Debug)]
pub struct MarginProtocol {
    config: MarginConfig,
    provider: ProviderManager,
}

impl MarginProtocol {
    /// Create a new margin protocol adapter.
    pub fn new(config: MarginConfig, provider: ProviderManager) -> Self {
        Self { config, provider }
    }

    fn margin_market<'a>(&self, market: &'a MarketMetadata) -> ChainResult<&'a MarginMarket> {
        match market {
            MarketMetadata::Margin(m) => Ok(m),
            MarketMetadata::Debt(_) => Err(ChainError::Unsupported {
                protocol: "margin",
                message: "lending market metadata passed to margin adapter".into(),
            }),
        }
    }

    fn market_prices(
        &self,
        market: &MarginMarket,
        prices: &PriceTable,
    ) -> ChainResult<IMarginReader::MarketPrices> {
        let props = |token: Address| -> ChainResult<IMarginReader::PriceProps> {
            let p = prices.require(token)?;
            Ok(IMarginReader::PriceProps {
                min: p.min,
                max: p.max,
            })
        };
        Ok(IMarginReader::MarketPrices {
            indexTokenPrice: props(market.index_token)?,
            longTokenPrice: props(market.long_token)?,
            shortTokenPrice: props(market.short_token)?,
        })
    }

    fn liquidatable_call(
        &self,
        position: &PositionRef,
        market: &MarketMetadata,
        prices: &PriceTable,
    ) -> ChainResult<IMarginReader::isPositionLiquidatableCall> {
        let market = self.margin_market(market)?;
        Ok(IMarginReader::isPositionLiquidatableCall {
            dataStore: self.config.data_store,
            referralStorage: self.config.referral_storage,
            positionKey: position.key(),
            market: market.market,
            prices: self.market_prices(market, prices)?,
            shouldValidateMinCollateralUsd: true,
        })
    }
}

fn verdict_from(ret: IMarginReader::isPositionLiquidatableReturn) -> OnchainVerdict {
    let health_factor_wad = if ret.minCollateralUsd.is_zero() {
        None
    } else {
        Some(ret.remainingCollateralUsd.saturating_mul(WAD) / ret.minCollateralUsd)
    };
    OnchainVerdict {
        liquidatable: ret.liquidatable,
        health_factor_wad,
        reason: (!ret.reason.is_empty()).then_some(ret.reason),
    }
}

/// Encode the `sendWnt` + `createOrder` multicall for a liquidation order.
fn encode_liquidation_order(
    config: &MarginConfig,
    request: &LiquidationRequest,
) -> ChainResult<Bytes> {
    let PositionRef::Margin {
        account,
        market,
        collateral_token,
        is_long,
    } = &request.position
    else {
        return Err(ChainError::Unsupported {
            protocol: "margin",
            message: "debt position passed to margin adapter".into(),
        });
    };

    let send_wnt = IExchangeRouter::sendWntCall {
        receiver: config.order_vault,
        amount: request.execution_fee,
    };

    // Closing a long accepts any price; closing a short accepts up to max
    let acceptable_price = if *is_long { U256::ZERO } else { U256::MAX };

    let create_order = IExchangeRouter::createOrderCall {
        params: IExchangeRouter::CreateOrderParams {
            addresses: IExchangeRouter::CreateOrderParamsAddresses {
                account: *account,
                receiver: request.receiver,
                cancellationReceiver: request.receiver,
                callbackContract: Address::ZERO,
                uiFeeReceiver: Address::ZERO,
                market: *market,
                initialCollateralToken: *collateral_token,
                swapPath: Vec::new(),
            },
            numbers: IExchangeRouter::CreateOrderParamsNumbers {
                sizeDeltaUsd: request.size_delta_usd,
                initialCollateralDeltaAmount: U256::ZERO,
                triggerPrice: U256::ZERO,
                acceptablePrice: acceptable_price,
                executionFee: request.execution_fee,
                callbackGasLimit: config.callback_gas_limit,
                minOutputAmount: request.min_amount_out,
                validFromTime: U256::ZERO,
            },
            orderType: LIQUIDATION_ORDER_TYPE,
            decreasePositionSwapType: 0,
            isLong: *is_long,
            shouldUnwrapNativeToken: false,
            autoCancel: false,
            referralCode: B256::ZERO,
        },
    };

    let multicall = IExchangeRouter::multicallCall {
        data: vec![
            Bytes::from(send_wnt.abi_encode()),
            Bytes::from(create_order.abi_encode()),
        ],
    };
    Ok(Bytes::from(multicall.abi_encode()))
}

#[async_trait]
impl LiquidationProtocol for MarginProtocol {
    fn protocol_id(&self) -> &str {
        &self.config.protocol_id
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Margin
    }

    fn provider(&self) -> &ProviderManager {
        &self.provider
    }

    async fn market_metadata(&self, market: Address) -> ChainResult<MarketMetadata> {
        let rpc = self.provider.reader();
        let reader = IMarginReader::new(self.config.reader, &rpc);
        let data_store = IDataStore::new(self.config.data_store, &rpc);

        let get_market = reader.getMarket(self.config.data_store, market);
        let props = self.provider.timed("getMarket", get_market.call()).await?.market;

        if props.marketToken == Address::ZERO {
            return Err(ChainError::CallReverted {
                op: "getMarket",
                message: format!("market {market} not found"),
            });
        }

        let get_factor = data_store.getUint(min_collateral_factor_key(market));
        let factor = self.provider.timed("getUint", get_factor.call()).await?.value;

        let index_decimals = match self.config.index_decimals.get(&props.indexToken) {
            Some(d) => *d,
            None => self.provider.token_decimals(props.indexToken).await?,
        };

        debug!(
            market = %market,
            index_token = %props.indexToken,
            min_collateral_factor = %factor,
            "Margin market metadata fetched"
        );

        Ok(MarketMetadata::Margin(MarginMarket {
            market,
            index_token: props.indexToken,
            long_token: props.longToken,
            short_token: props.shortToken,
            index_decimals,
            min_collateral_factor_wad: factor / FACTOR_TO_WAD,
        }))
    }

    async fn fetch_position(
        &self,
        position: &PositionRef,
        market: &MarketMetadata,
    ) -> ChainResult<Option<RawPosition>> {
        let market = self.margin_market(market)?;
        let PositionRef::Margin { is_long, .. } = position else {
            return Err(ChainError::Unsupported {
                protocol: "margin",
                message: "debt position passed to margin adapter".into(),
            });
        };

        let rpc = self.provider.reader();
        let reader = IMarginReader::new(self.config.reader, &rpc);
        let call = reader.getPosition(self.config.data_store, position.key());
        let props = self.provider.timed("getPosition", call.call()).await?.position;

        if props.sizeInUsd.is_zero() || props.account == Address::ZERO {
            return Ok(None);
        }

        Ok(Some(RawPosition::Margin(MarginPositionState {
            account: props.account,
            market: props.market,
            collateral_token: props.collateralToken,
            index_token: market.index_token,
            is_long: *is_long,
            size_in_usd: props.sizeInUsd,
            size_in_tokens: props.sizeInTokens,
            collateral_amount: props.collateralAmount,
            fees_owed: props.pendingFeesAmount,
            index_decimals: market.index_decimals,
        })))
    }

    async fn check_liquidatable(
        &self,
        position: &PositionRef,
        market: &MarketMetadata,
        prices: &PriceTable,
    ) -> ChainResult<OnchainVerdict> {
        let call = self.liquidatable_call(position, market, prices)?;
        let rpc = self.provider.reader();
        let reader = IMarginReader::new(self.config.reader, &rpc);
        let builder = reader.isPositionLiquidatable(
            call.dataStore,
            call.referralStorage,
            call.positionKey,
            call.market,
            call.prices,
            call.shouldValidateMinCollateralUsd,
        );
        let ret = self
            .provider
            .timed("isPositionLiquidatable", builder.call())
            .await?;
        Ok(verdict_from(ret))
    }

    async fn oracle_prices(&self, _tokens: &[Address]) -> ChainResult<PriceTable> {
        Err(ChainError::Unsupported {
            protocol: "margin",
            message: "prices come from the off-chain price feed".into(),
        })
    }

    fn build_liquidation(&self, request: &LiquidationRequest) -> ChainResult<TxCall> {
        if self.config.exchange_router == Address::ZERO || self.config.order_vault == Address::ZERO {
            return Err(ChainError::Config(
                "exchange router and order vault must be configured".into(),
            ));
        }
        Ok(TxCall {
            to: self.config.exchange_router,
            input: encode_liquidation_order(&self.config, request)?,
            value: request.execution_fee,
        })
    }

    fn verdict_call(
        &self,
        position: &PositionRef,
        market: &MarketMetadata,
        prices: &PriceTable,
    ) -> ChainResult<BatchCall> {
        let call = self.liquidatable_call(position, market, prices)?;
        Ok(BatchCall {
            target: self.config.reader,
            calldata: Bytes::from(call.abi_encode()),
        })
    }

    fn decode_verdict(&self, data: &Bytes) -> ChainResult<OnchainVerdict> {
        let ret = IMarginReader::isPositionLiquidatableCall::abi_decode_returns(data, true)
            .map_err(|e| ChainError::Decode {
                op: "isPositionLiquidatable",
                message: e.to_string(),
            })?;
        Ok(verdict_from(ret))
    }
}
