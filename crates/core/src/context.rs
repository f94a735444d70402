//! Chain access for the risk pipeline and the execution service.
//!
//! Both consume narrow traits so they can be driven without a node.
//! [`ChainContext`] is the production implementation: one protocol adapter,
//! one signer, an optional private relay and the shared price cache, built
//! once at startup and injected into every component.

use crate::position::LiquidationCandidate;
use crate::price_cache::PriceCache;
use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, B256, U256};
use alloy::rpc::types::TransactionRequest;
use async_trait::async_trait;
use liquidation_engine_chain::gas::GasParams;
use liquidation_engine_chain::{
    ChainError, ChainResult, Confirmation, LiquidationProtocol, LiquidationRequest,
    MarketMetadata, OnchainVerdict, PrivateRelayClient, SignedTx, TransactionSender, TxCall,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Tokens that must be priced to evaluate positions in `market`.
pub fn market_tokens(market: &MarketMetadata) -> Vec<Address> {
    let mut tokens = match market {
        MarketMetadata::Margin(m) => vec![m.index_token, m.long_token, m.short_token],
        MarketMetadata::Debt(m) => m.reserves.iter().map(|r| r.asset).collect(),
    };
    tokens.sort_unstable();
    tokens.dedup();
    tokens
}

/// Reads used by risk checks and preflight.
#[async_trait]
pub trait ChainView: Send + Sync {
    async fn block_number(&self) -> ChainResult<u64>;

    /// Current network gas price in wei.
    async fn gas_price_wei(&self) -> ChainResult<u128>;

    /// Native balance of the signing wallet.
    async fn native_balance(&self) -> ChainResult<U256>;

    /// ERC-20 balance of the signing wallet.
    async fn token_balance(&self, token: Address) -> ChainResult<U256>;

    /// Re-run the protocol's authoritative liquidatability read.
    async fn reverify(&self, candidate: &LiquidationCandidate) -> ChainResult<OnchainVerdict>;
}

/// Build, sign, send and confirm.
#[async_trait]
pub trait TxGateway: Send + Sync {
    fn signer(&self) -> Address;

    fn relay_enabled(&self) -> bool;

    fn build_call(&self, request: &LiquidationRequest) -> ChainResult<TxCall>;

    async fn gas_params(&self) -> ChainResult<GasParams>;

    async fn estimate_gas(&self, call: &TxCall) -> ChainResult<u64>;

    async fn sign(&self, call: &TxCall, gas_limit: u64, gas: &GasParams) -> ChainResult<SignedTx>;

    async fn send_private(&self, tx: &SignedTx) -> ChainResult<B256>;

    async fn send_public(&self, tx: &SignedTx) -> ChainResult<B256>;

    async fn confirm(
        &self,
        tx_hash: B256,
        confirmations: u64,
        timeout: Duration,
    ) -> ChainResult<Confirmation>;

    async fn resync_nonce(&self) -> ChainResult<u64>;
}

/// Explicit chain context shared by the engine components.
pub struct ChainContext {
    protocol: Arc<dyn LiquidationProtocol>,
    sender: Arc<TransactionSender>,
    relay: Option<PrivateRelayClient>,
    prices: Arc<PriceCache>,
}

impl ChainContext {
    pub fn new(
        protocol: Arc<dyn LiquidationProtocol>,
        sender: Arc<TransactionSender>,
        relay: Option<PrivateRelayClient>,
        prices: Arc<PriceCache>,
    ) -> Self {
        Self {
            protocol,
            sender,
            relay,
            prices,
        }
    }

    pub fn protocol(&self) -> &Arc<dyn LiquidationProtocol> {
        &self.protocol
    }
}

#[async_trait]
impl ChainView for ChainContext {
    async fn block_number(&self) -> ChainResult<u64> {
        self.sender.provider().block_number().await
    }

    async fn gas_price_wei(&self) -> ChainResult<u128> {
        self.sender.provider().gas_price().await
    }

    async fn native_balance(&self) -> ChainResult<U256> {
        self.sender.balance().await
    }

    async fn token_balance(&self, token: Address) -> ChainResult<U256> {
        self.sender
            .provider()
            .token_balance(token, self.sender.address)
            .await
    }

    async fn reverify(&self, candidate: &LiquidationCandidate) -> ChainResult<OnchainVerdict> {
        let tokens = market_tokens(&candidate.market);
        let prices = self
            .prices
            .snapshot(&tokens)
            .await
            .map_err(|e| ChainError::Rpc {
                op: "price_snapshot",
                message: e.to_string(),
            })?;
        self.protocol
            .check_liquidatable(&candidate.position, &candidate.market, &prices)
            .await
    }
}

#[async_trait]
impl TxGateway for ChainContext {
    fn signer(&self) -> Address {
        self.sender.address
    }

    fn relay_enabled(&self) -> bool {
        self.relay.is_some()
    }

    fn build_call(&self, request: &LiquidationRequest) -> ChainResult<TxCall> {
        self.protocol.build_liquidation(request)
    }

    async fn gas_params(&self) -> ChainResult<GasParams> {
        self.sender.gas_params().await
    }

    async fn estimate_gas(&self, call: &TxCall) -> ChainResult<u64> {
        let tx = TransactionRequest::default()
            .with_from(self.sender.address)
            .with_to(call.to)
            .with_input(call.input.clone())
            .with_value(call.value);
        let gas = self.sender.provider().estimate_gas(&tx).await?;
        debug!(to = %call.to, gas = gas, "Gas estimated");
        Ok(gas)
    }

    async fn sign(&self, call: &TxCall, gas_limit: u64, gas: &GasParams) -> ChainResult<SignedTx> {
        self.sender.sign(call, gas_limit, gas).await
    }

    async fn send_private(&self, tx: &SignedTx) -> ChainResult<B256> {
        let relay = self
            .relay
            .as_ref()
            .ok_or_else(|| ChainError::Relay("private relay disabled".to_string()))?;
        relay.send_raw(&tx.raw).await
    }

    async fn send_public(&self, tx: &SignedTx) -> ChainResult<B256> {
        self.sender.send_public(tx).await
    }

    async fn confirm(
        &self,
        tx_hash: B256,
        confirmations: u64,
        timeout: Duration,
    ) -> ChainResult<Confirmation> {
        self.sender.await_receipt(tx_hash, confirmations, timeout).await
    }

    async fn resync_nonce(&self) -> ChainResult<u64> {
        self.sender.sync_nonce().await
    }
}
