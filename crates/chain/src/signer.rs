//! Transaction signer for liquidations.
//!
//! Signing, broadcasting and confirmation are separate steps so the caller
//! can route the same signed payload to a private relay or the public
//! mempool. The nonce is tracked locally and resynced after failures.

use crate::error::{ChainError, ChainResult};
use crate::gas::{GasParams, GasStrategy};
use crate::provider::ProviderManager;
use alloy::eips::eip2718::Encodable2718;
use alloy::network::{Ethereum, EthereumWallet, TransactionBuilder};
use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Cached nonce manager.
/// Avoids an RPC call per transaction by tracking the nonce locally.
pub struct NonceManager {
    /// Next nonce to hand out
    current: AtomicU64,
    /// Last value read from chain
    last_synced: AtomicU64,
}

impl NonceManager {
    /// Create new nonce manager with initial value from chain.
    pub fn new(initial_nonce: u64) -> Self {
        Self {
            current: AtomicU64::new(initial_nonce),
            last_synced: AtomicU64::new(initial_nonce),
        }
    }

    /// Get next nonce and increment counter.
    #[inline]
    pub fn next(&self) -> u64 {
        self.current.fetch_add(1, Ordering::SeqCst)
    }

    /// Get current nonce without incrementing.
    #[inline]
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    /// Last nonce read from chain.
    pub fn last_synced(&self) -> u64 {
        self.last_synced.load(Ordering::SeqCst)
    }

    /// Move forward if the chain is ahead; never moves backwards.
    pub fn sync(&self, chain_nonce: u64) {
        let current = self.current.load(Ordering::SeqCst);
        if chain_nonce > current {
            self.current.store(chain_nonce, Ordering::SeqCst);
        }
        self.last_synced.store(chain_nonce, Ordering::SeqCst);
    }

    /// Reset nonce to chain value (use after tx failure).
    pub fn reset(&self, chain_nonce: u64) {
        self.current.store(chain_nonce, Ordering::SeqCst);
        self.last_synced.store(chain_nonce, Ordering::SeqCst);
    }
}

/// Contract call to sign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxCall {
    pub to: Address,
    pub input: Bytes,
    pub value: U256,
}

/// A signed, EIP-2718 encoded transaction ready for broadcast.
#[derive(Debug, Clone)]
pub struct SignedTx {
    pub raw: Bytes,
    pub hash: B256,
    pub nonce: u64,
    pub gas_limit: u64,
    pub gas_price: u128,
}

/// Mined transaction summary.
#[derive(Debug, Clone)]
pub struct Confirmation {
    pub tx_hash: B256,
    pub success: bool,
    pub block_number: Option<u64>,
    pub gas_used: U256,
    pub effective_gas_price: U256,
}

impl Confirmation {
    /// Total fee paid in wei.
    pub fn fee_wei(&self) -> U256 {
        self.gas_used.saturating_mul(self.effective_gas_price)
    }
}

/// Transaction signer with configurable gas strategy.
pub struct TransactionSender {
    provider: ProviderManager,
    wallet: EthereumWallet,
    /// Signer address
    pub address: Address,
    chain_id: u64,
    nonce_manager: NonceManager,
    gas_strategy: Box<dyn GasStrategy>,
    /// Interval between receipt polls
    poll_interval: Duration,
}

impl TransactionSender {
    /// Create a sender and fetch the starting nonce from chain.
    pub async fn new(
        private_key: &str,
        provider: ProviderManager,
        chain_id: u64,
        gas_strategy: Box<dyn GasStrategy>,
    ) -> ChainResult<Self> {
        let signer = parse_key(private_key)?;
        let initial_nonce = provider.transaction_count(signer.address()).await?;
        let sender = Self::with_nonce(signer, provider, chain_id, gas_strategy, initial_nonce);

        info!(
            address = %sender.address,
            chain_id = chain_id,
            initial_nonce = initial_nonce,
            gas_strategy = sender.gas_strategy.strategy_name(),
            "Transaction sender initialized"
        );

        Ok(sender)
    }

    /// Create a sender with a known starting nonce (no RPC).
    pub fn offline(
        private_key: &str,
        provider: ProviderManager,
        chain_id: u64,
        gas_strategy: Box<dyn GasStrategy>,
        initial_nonce: u64,
    ) -> ChainResult<Self> {
        let signer = parse_key(private_key)?;
        Ok(Self::with_nonce(signer, provider, chain_id, gas_strategy, initial_nonce))
    }

    fn with_nonce(
        signer: PrivateKeySigner,
        provider: ProviderManager,
        chain_id: u64,
        gas_strategy: Box<dyn GasStrategy>,
        initial_nonce: u64,
    ) -> Self {
        Self {
            address: signer.address(),
            wallet: EthereumWallet::from(signer),
            provider,
            chain_id,
            nonce_manager: NonceManager::new(initial_nonce),
            gas_strategy,
            poll_interval: Duration::from_millis(1_000),
        }
    }

    /// Set the receipt polling interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Get the current gas strategy name.
    pub fn gas_strategy_name(&self) -> &'static str {
        self.gas_strategy.strategy_name()
    }

    /// Fetch current gas params through the configured strategy.
    pub async fn gas_params(&self) -> ChainResult<GasParams> {
        self.gas_strategy.fetch_params(&self.provider).await
    }

    /// Get current cached nonce.
    pub fn current_nonce(&self) -> u64 {
        self.nonce_manager.current()
    }

    /// Sign a call with the next nonce.
    ///
    /// The nonce is consumed even if the caller never broadcasts; call
    /// [`TransactionSender::sync_nonce`] after any failure past this point.
    pub async fn sign(
        &self,
        call: &TxCall,
        gas_limit: u64,
        gas: &GasParams,
    ) -> ChainResult<SignedTx> {
        let nonce = self.nonce_manager.next();

        let mut tx = TransactionRequest::default()
            .with_from(self.address)
            .with_to(call.to)
            .with_input(call.input.clone())
            .with_value(call.value)
            .with_nonce(nonce)
            .with_gas_limit(gas_limit)
            .with_chain_id(self.chain_id);
        self.gas_strategy.apply_gas(&mut tx, gas);

        let envelope = <TransactionRequest as TransactionBuilder<Ethereum>>::build(tx, &self.wallet)
            .await
            .map_err(|e| ChainError::Signer(e.to_string()))?;

        let raw = Bytes::from(envelope.encoded_2718());
        let hash = keccak256(&raw);

        debug!(
            tx_hash = %hash,
            nonce = nonce,
            gas_limit = gas_limit,
            gas_price = gas.effective_gas_price(),
            strategy = self.gas_strategy.strategy_name(),
            "Transaction signed"
        );

        Ok(SignedTx {
            raw,
            hash,
            nonce,
            gas_limit,
            gas_price: gas.effective_gas_price(),
        })
    }

    /// Broadcast through the public mempool.
    pub async fn send_public(&self, signed: &SignedTx) -> ChainResult<B256> {
        let hash = self.provider.send_raw(&signed.raw).await?;
        info!(tx_hash = %hash, nonce = signed.nonce, "Transaction broadcast publicly");
        Ok(hash)
    }

    /// Poll for a receipt until it has `confirmations` blocks on top or the
    /// deadline passes.
    ///
    /// Poll errors are retried until the deadline; an absent receipt at the
    /// deadline is [`ChainError::ReceiptMissing`].
    pub async fn await_receipt(
        &self,
        tx_hash: B256,
        confirmations: u64,
        timeout: Duration,
    ) -> ChainResult<Confirmation> {
        let deadline = Instant::now() + timeout;
        let confirmations = confirmations.max(1);

        loop {
            match self.provider.receipt(tx_hash).await {
                Ok(Some(receipt)) => {
                    let mined_at = receipt.block_number;
                    let deep_enough = match (confirmations, mined_at) {
                        (1, _) => true,
                        (_, Some(mined)) => match self.provider.block_number().await {
                            Ok(head) => head + 1 >= mined + confirmations,
                            Err(e) => {
                                debug!(error = %e, "Head lookup failed while confirming");
                                false
                            }
                        },
                        (_, None) => false,
                    };

                    if deep_enough {
                        let confirmation = Confirmation {
                            tx_hash,
                            success: receipt.status(),
                            block_number: mined_at,
                            gas_used: U256::from(receipt.gas_used),
                            effective_gas_price: U256::from(receipt.effective_gas_price),
                        };
                        info!(
                            tx_hash = %tx_hash,
                            success = confirmation.success,
                            block = ?mined_at,
                            gas_used = %confirmation.gas_used,
                            "Transaction mined"
                        );
                        return Ok(confirmation);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(tx_hash = %tx_hash, error = %e, "Receipt poll failed");
                }
            }

            if Instant::now() + self.poll_interval > deadline {
                warn!(tx_hash = %tx_hash, timeout_ms = timeout.as_millis(), "No receipt before deadline");
                return Err(ChainError::ReceiptMissing { tx_hash });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Reset the local nonce to the chain's pending count.
    pub async fn sync_nonce(&self) -> ChainResult<u64> {
        let chain_nonce = self.provider.transaction_count(self.address).await?;
        self.nonce_manager.reset(chain_nonce);
        debug!(nonce = chain_nonce, "Nonce synced from chain");
        Ok(chain_nonce)
    }

    /// Native balance of the signer.
    pub async fn balance(&self) -> ChainResult<U256> {
        self.provider.native_balance(self.address).await
    }

    /// Provider used by this sender.
    pub fn provider(&self) -> &ProviderManager {
        &self.provider
    }
}

fn parse_key(private_key: &str) -> ChainResult<PrivateKeySigner> {
    private_key
        .trim()
        .trim_start_matches("0x")
        .parse::<PrivateKeySigner>()
        .map_err(|e| ChainError::Signer(format!("invalid private key: {e}")))
}

impl std::fmt::Debug for TransactionSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionSender")
            .field("address", &self.address)
            .field("chain_id", &self.chain_id)
            .field("gas_strategy", &self.gas_strategy.strategy_name())
            .field("nonce", &self.nonce_manager.current())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gas::LegacyGasStrategy;

    // Well-known development key, never funded on a real network
    const DEV_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn offline_sender(nonce: u64) -> TransactionSender {
        let provider = ProviderManager::unchecked(
            "http://localhost:8545",
            "http://localhost:8545",
            Duration::from_secs(1),
        )
        .unwrap();
        TransactionSender::offline(
            DEV_KEY,
            provider,
            31337,
            Box::new(LegacyGasStrategy::new(1_000_000_000, 100_000_000_000)),
            nonce,
        )
        .unwrap()
    }

    #[test]
    fn test_nonce_manager() {
        let manager = NonceManager::new(10);

        assert_eq!(manager.current(), 10);
        assert_eq!(manager.next(), 10);
        assert_eq!(manager.current(), 11);
        assert_eq!(manager.next(), 11);
        assert_eq!(manager.current(), 12);

        manager.sync(15);
        assert_eq!(manager.current(), 15);

        // Sync never moves backwards
        manager.sync(10);
        assert_eq!(manager.current(), 15);
        assert_eq!(manager.last_synced(), 10);

        manager.reset(5);
        assert_eq!(manager.current(), 5);
    }

    #[test]
    fn test_invalid_key_rejected() {
        let provider = ProviderManager::unchecked(
            "http://localhost:8545",
            "http://localhost:8545",
            Duration::from_secs(1),
        )
        .unwrap();
        let result = TransactionSender::offline(
            "0xnothex",
            provider,
            1,
            Box::new(LegacyGasStrategy::new(1, 2)),
            0,
        );
        assert!(matches!(result, Err(ChainError::Signer(_))));
    }

    #[tokio::test]
    async fn test_sign_consumes_nonces_and_hashes_payload() {
        let sender = offline_sender(7);
        assert_eq!(
            format!("{:?}", sender.address).to_lowercase(),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );

        let call = TxCall {
            to: Address::repeat_byte(0x11),
            input: Bytes::from(vec![0xde, 0xad, 0xbe, 0xef]),
            value: U256::from(1_000u64),
        };
        let gas = GasParams::Legacy {
            gas_price: 2_000_000_000,
        };

        let first = sender.sign(&call, 500_000, &gas).await.unwrap();
        let second = sender.sign(&call, 500_000, &gas).await.unwrap();

        assert_eq!(first.nonce, 7);
        assert_eq!(second.nonce, 8);
        assert_eq!(sender.current_nonce(), 9);
        assert_eq!(first.hash, keccak256(&first.raw));
        assert_ne!(first.hash, second.hash);
        assert_eq!(first.gas_price, 2_000_000_000);
    }

    #[test]
    fn test_confirmation_fee() {
        let confirmation = Confirmation {
            tx_hash: B256::ZERO,
            success: true,
            block_number: Some(1),
            gas_used: U256::from(21_000u64),
            effective_gas_price: U256::from(3_000_000_000u64),
        };
        assert_eq!(confirmation.fee_wei(), U256::from(63_000_000_000_000u64));
    }

    #[tokio::test]
    #[ignore] // Requires network
    async fn test_sender_creation() {
        let provider = ProviderManager::new(
            "http://localhost:8545",
            "http://localhost:8545",
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        let sender = TransactionSender::new(
            DEV_KEY,
            provider,
            31337,
            Box::new(LegacyGasStrategy::new(1_000_000_000, 10_000_000_000)),
        )
        .await;

        assert!(sender.is_ok());
        assert_eq!(sender.unwrap().gas_strategy_name(), "Legacy");
    }
}
