//! Provider management for read and send RPC endpoints.
//! Uses Alloy providers for type-safe RPC interactions.
//!
//! Every call goes through [`ProviderManager::timed`], so a slow node surfaces
//! as [`ChainError::Timeout`] instead of hanging the cycle.

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::{TransactionReceipt, TransactionRequest};
use alloy::sol;
use alloy::transports::http::reqwest::Url;
use std::future::IntoFuture;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{ChainError, ChainResult};

/// Canonical Multicall3 deployment (same address on every major EVM chain).
pub const MULTICALL3_ADDRESS: Address =
    alloy::primitives::address!("cA11bde05977b3631167028862bE2a173976CA11");

sol! {
    #[sol(rpc)]
    interface IERC20 {
        function balanceOf(address owner) external view returns (uint256 balance);
        function decimals() external view returns (uint8 value);
    }

    #[sol(rpc)]
    interface IMulticall3 {
        struct Call3 {
            address target;
            bool allowFailure;
            bytes callData;
        }

        struct CallResult {
            bool success;
            bytes returnData;
        }

        function aggregate3(Call3[] calldata calls) external payable returns (CallResult[] memory returnData);
    }
}

/// A single read to batch through Multicall3.
#[derive(Debug, Clone)]
pub struct BatchCall {
    pub target: Address,
    pub calldata: Bytes,
}

/// Provider manager for the read and send RPC connections.
#[derive(Debug, Clone)]
pub struct ProviderManager {
    /// Read URL (view calls, balances, receipts)
    read_url: Url,
    /// Send URL (public broadcast)
    send_url: Url,
    /// Deadline applied to every RPC call
    rpc_timeout: Duration,
    /// Multicall3 contract used for batched reads
    multicall: Address,
}

impl ProviderManager {
    /// Create a new provider manager and verify the read endpoint answers.
    pub async fn new(read_url: &str, send_url: &str, rpc_timeout: Duration) -> ChainResult<Self> {
        let manager = Self::unchecked(read_url, send_url, rpc_timeout)?;

        info!(
            read = read_url,
            send = send_url,
            timeout_ms = rpc_timeout.as_millis(),
            "Initializing provider manager"
        );

        let block = manager.block_number().await?;
        info!(block = block, "Provider connection verified");

        Ok(manager)
    }

    /// Create without the connectivity probe.
    pub fn unchecked(read_url: &str, send_url: &str, rpc_timeout: Duration) -> ChainResult<Self> {
        let parse = |url: &str| -> ChainResult<Url> {
            url.parse()
                .map_err(|e| ChainError::Config(format!("invalid RPC URL {url}: {e}")))
        };

        Ok(Self {
            read_url: parse(read_url)?,
            send_url: parse(send_url)?,
            rpc_timeout,
            multicall: MULTICALL3_ADDRESS,
        })
    }

    /// Override the Multicall3 address (chains with a non-canonical deployment).
    pub fn with_multicall(mut self, multicall: Address) -> Self {
        self.multicall = multicall;
        self
    }

    /// Deadline applied to each call.
    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    /// Provider bound to the read endpoint.
    pub fn reader(&self) -> impl Provider + Clone {
        ProviderBuilder::new().on_http(self.read_url.clone())
    }

    /// Provider bound to the send endpoint.
    pub fn sender(&self) -> impl Provider + Clone {
        ProviderBuilder::new().on_http(self.send_url.clone())
    }

    /// Run an RPC future under the configured deadline.
    ///
    /// Elapsed deadlines map to [`ChainError::Timeout`]; call errors are
    /// classified into reverts vs transport errors.
    pub async fn timed<T, E, F>(&self, op: &'static str, fut: F) -> ChainResult<T>
    where
        F: IntoFuture<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        match tokio::time::timeout(self.rpc_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(ChainError::from_call(op, e)),
            Err(_) => Err(ChainError::Timeout {
                op,
                after: self.rpc_timeout,
            }),
        }
    }

    /// Get current block number.
    pub async fn block_number(&self) -> ChainResult<u64> {
        let provider = self.reader();
        self.timed("eth_blockNumber", provider.get_block_number()).await
    }

    /// Get chain ID.
    pub async fn chain_id(&self) -> ChainResult<u64> {
        let provider = self.reader();
        self.timed("eth_chainId", provider.get_chain_id()).await
    }

    /// Current network gas price in wei.
    pub async fn gas_price(&self) -> ChainResult<u128> {
        let provider = self.reader();
        self.timed("eth_gasPrice", provider.get_gas_price()).await
    }

    /// Native balance of an account.
    pub async fn native_balance(&self, owner: Address) -> ChainResult<U256> {
        let provider = self.reader();
        self.timed("eth_getBalance", async { provider.get_balance(owner).await })
            .await
    }

    /// ERC-20 balance of an account.
    pub async fn token_balance(&self, token: Address, owner: Address) -> ChainResult<U256> {
        let provider = self.reader();
        let erc20 = IERC20::new(token, &provider);
        let call = erc20.balanceOf(owner);
        let ret = self.timed("balanceOf", call.call()).await?;
        Ok(ret.balance)
    }

    /// ERC-20 decimals.
    pub async fn token_decimals(&self, token: Address) -> ChainResult<u8> {
        let provider = self.reader();
        let erc20 = IERC20::new(token, &provider);
        let call = erc20.decimals();
        let ret = self.timed("decimals", call.call()).await?;
        Ok(ret.value)
    }

    /// Estimate gas for a transaction request.
    pub async fn estimate_gas(&self, tx: &TransactionRequest) -> ChainResult<u64> {
        let provider = self.reader();
        self.timed("eth_estimateGas", async { provider.estimate_gas(tx.clone()).await })
            .await
    }

    /// Fetch a transaction receipt, if mined.
    pub async fn receipt(&self, tx_hash: B256) -> ChainResult<Option<TransactionReceipt>> {
        let provider = self.reader();
        self.timed(
            "eth_getTransactionReceipt",
            provider.get_transaction_receipt(tx_hash),
        )
        .await
    }

    /// Pending nonce for an account.
    pub async fn transaction_count(&self, owner: Address) -> ChainResult<u64> {
        let provider = self.reader();
        self.timed("eth_getTransactionCount", async {
            provider.get_transaction_count(owner).pending().await
        })
        .await
    }

    /// Broadcast a signed transaction through the public send endpoint.
    pub async fn send_raw(&self, raw: &[u8]) -> ChainResult<B256> {
        let provider = self.sender();
        let pending = self
            .timed("eth_sendRawTransaction", provider.send_raw_transaction(raw))
            .await?;
        Ok(*pending.tx_hash())
    }

    /// Execute several view calls in one round trip through Multicall3.
    ///
    /// Each entry is `None` when that sub-call reverted; the batch itself only
    /// fails on transport errors.
    pub async fn aggregate(&self, calls: &[BatchCall]) -> ChainResult<Vec<Option<Bytes>>> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        let provider = self.reader();
        let multicall = IMulticall3::new(self.multicall, &provider);
        let batch: Vec<IMulticall3::Call3> = calls
            .iter()
            .map(|c| IMulticall3::Call3 {
                target: c.target,
                allowFailure: true,
                callData: c.calldata.clone(),
            })
            .collect();

        let call = multicall.aggregate3(batch);
        let ret = self.timed("aggregate3", call.call()).await?;

        if ret.returnData.len() != calls.len() {
            return Err(ChainError::Decode {
                op: "aggregate3",
                message: format!(
                    "expected {} results, got {}",
                    calls.len(),
                    ret.returnData.len()
                ),
            });
        }

        debug!(calls = calls.len(), "Multicall batch completed");

        Ok(ret
            .returnData
            .into_iter()
            .map(|r| if r.success { Some(r.returnData) } else { None })
            .collect())
    }

    /// Check if provider is healthy.
    pub async fn health_check(&self) -> ChainResult<bool> {
        let block = self.block_number().await?;
        debug!(block = block, "Provider health check passed");
        Ok(block > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_url() {
        let result = ProviderManager::unchecked("not a url", "http://localhost:8545", Duration::from_secs(1));
        assert!(matches!(result, Err(ChainError::Config(_))));
    }

    #[tokio::test]
    async fn test_timed_maps_elapsed_deadline_to_timeout() {
        let manager = ProviderManager::unchecked(
            "http://localhost:8545",
            "http://localhost:8545",
            Duration::from_millis(10),
        )
        .unwrap();

        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<u64, String>(1)
        };

        let err = manager.timed("slow_call", slow).await.unwrap_err();
        assert!(matches!(err, ChainError::Timeout { op: "slow_call", .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_timed_classifies_revert() {
        let manager = ProviderManager::unchecked(
            "http://localhost:8545",
            "http://localhost:8545",
            Duration::from_secs(1),
        )
        .unwrap();

        let failing = async { Err::<u64, _>("execution reverted: HealthFactorNotBelowThreshold") };
        let err = manager.timed("liquidationCall", failing).await.unwrap_err();
        assert!(matches!(err, ChainError::CallReverted { .. }));
    }

    #[tokio::test]
    #[ignore] // Requires network
    async fn test_provider_creation() {
        let provider = ProviderManager::new(
            "https://eth.llamarpc.com",
            "https://eth.llamarpc.com",
            Duration::from_secs(5),
        )
        .await;

        assert!(provider.is_ok());
    }
}
