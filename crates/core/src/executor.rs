//! Liquidation execution: preflight, build, sign, submit, confirm, record.
//!
//! Sends are serialized behind one async lock so overlapping monitor cycles
//! never race the signer's nonce. The post-success cooldown is enforced under
//! the same lock, so it holds across cycles too. Every attempt that gets past preflight is
//! fed to the daily loss tracker, whatever its outcome.

use crate::backoff::Backoff;
use crate::config::{EngineConfig, ExecutionConfig};
use crate::context::{ChainView, TxGateway};
use crate::position::{LiquidationCandidate, RepayAsset};
use crate::profit::execution_fee;
use crate::risk::RiskState;
use crate::u256_math::{self, apply_bps_up, gwei_to_wei};
use alloy::primitives::{Bytes, B256, U256};
use chrono::{DateTime, Utc};
use liquidation_engine_chain::{
    ChainError, Confirmation, ExecutionMode, LiquidationRequest, ProtocolKind, SignedTx,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Outcome of one execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiquidationResult {
    pub success: bool,
    pub tx_hash: Option<B256>,
    /// Realized P&L in USD (negative on a mined revert)
    pub profit_usd: f64,
    /// Actual gas paid in USD
    pub gas_usd: f64,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub is_private_relay: bool,
    pub position_key: B256,
}

impl LiquidationResult {
    /// A failed, unsent result; fields are filled in as the attempt progresses.
    fn unsent(candidate: &LiquidationCandidate) -> Self {
        Self {
            success: false,
            tx_hash: None,
            profit_usd: 0.0,
            gas_usd: 0.0,
            error: None,
            timestamp: Utc::now(),
            is_private_relay: false,
            position_key: candidate.key,
        }
    }
}

/// How far an attempt got after preflight.
enum Attempt {
    /// Nothing was signed
    Unsigned(ChainError),
    /// Signed, maybe broadcast, never mined
    Unmined {
        tx_hash: Option<B256>,
        is_private: bool,
        error: ChainError,
    },
    Mined {
        confirmation: Confirmation,
        is_private: bool,
    },
}

/// Submits liquidations for candidates that passed the risk pipeline.
pub struct ExecutionService {
    config: ExecutionConfig,
    min_profit_usd: f64,
    max_gas_price_gwei: f64,
    fallback_to_public: bool,
    retry: Backoff,
    gateway: Arc<dyn TxGateway>,
    chain: Arc<dyn ChainView>,
    state: Arc<RiskState>,
    /// Serializes sends; holds the time of the last successful liquidation
    send_lock: Mutex<Option<Instant>>,
}

impl ExecutionService {
    pub fn new(
        config: &EngineConfig,
        gateway: Arc<dyn TxGateway>,
        chain: Arc<dyn ChainView>,
        state: Arc<RiskState>,
    ) -> Self {
        Self {
            config: config.execution.clone(),
            min_profit_usd: config.risk.min_profit_usd,
            max_gas_price_gwei: config.risk.max_gas_price_gwei,
            fallback_to_public: config.relay.fallback_to_public,
            retry: config.retry,
            gateway,
            chain,
            state,
            send_lock: Mutex::new(None),
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.config.mode
    }

    /// Execute one liquidation.
    #[instrument(skip(self, candidate), fields(account = %candidate.account(), key = %candidate.key))]
    pub async fn execute(&self, candidate: &LiquidationCandidate) -> LiquidationResult {
        if let Err(reason) = self.preflight(candidate).await {
            warn!(reason = %reason, "Preflight rejected liquidation");
            return LiquidationResult {
                error: Some(reason),
                ..LiquidationResult::unsent(candidate)
            };
        }

        info!(
            expected = %candidate.profit,
            hf = candidate.metrics.health_factor,
            size_usd = candidate.size_usd,
            "Executing liquidation"
        );

        let mut last_success = self.send_lock.lock().await;
        self.cooldown(*last_success).await;

        let attempt = self.attempt(candidate).await;
        let result = self.settle(candidate, attempt).await;
        if result.success {
            *last_success = Some(Instant::now());
        }
        result
    }

    /// Execute sequentially. Each send waits out the cooldown of the
    /// previous success, whichever cycle it came from.
    pub async fn execute_batch(&self, candidates: &[LiquidationCandidate]) -> Vec<LiquidationResult> {
        let mut results = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            results.push(self.execute(candidate).await);
        }
        results
    }

    /// Sleep until `cooldown_ms` has passed since the last success.
    async fn cooldown(&self, last_success: Option<Instant>) {
        let Some(at) = last_success else {
            return;
        };
        let ready = at + self.config.cooldown();
        if Instant::now() < ready {
            debug!(
                wait_ms = (ready - Instant::now()).as_millis(),
                "Cooling down after liquidation"
            );
            tokio::time::sleep_until(ready).await;
        }
    }

    /// Profit, gas ceiling and a fresh liquidatability read. Nothing built yet.
    async fn preflight(&self, candidate: &LiquidationCandidate) -> Result<(), String> {
        if !candidate.profit.is_profitable(self.min_profit_usd) {
            return Err(format!(
                "not profitable: expected ${:.2}, minimum ${:.2}",
                candidate.profit.net_profit, self.min_profit_usd
            ));
        }

        let gas_price = self
            .chain
            .gas_price_wei()
            .await
            .map_err(|e| format!("gas price unavailable: {e}"))?;
        if gas_price > gwei_to_wei(self.max_gas_price_gwei) {
            return Err(format!(
                "gas price {} wei above ceiling {} gwei",
                gas_price, self.max_gas_price_gwei
            ));
        }

        if !candidate.metrics.is_liquidatable() {
            return Err(format!(
                "health factor {:.4} no longer below 1.0",
                candidate.metrics.health_factor
            ));
        }
        match self.chain.reverify(candidate).await {
            Ok(verdict) if verdict.liquidatable => Ok(()),
            Ok(verdict) => Err(format!(
                "no longer liquidatable on chain: {}",
                verdict.reason.unwrap_or_default()
            )),
            Err(e) => Err(format!("unable to re-verify: {e}")),
        }
    }

    fn request(&self, candidate: &LiquidationCandidate, gas_price: u128) -> LiquidationRequest {
        let kind = candidate.position.kind();
        let debt_to_cover = match candidate.repay_asset {
            RepayAsset::Token(_) => candidate.repay_amount,
            RepayAsset::Native => U256::ZERO,
        };
        // The flash-loan swap must at least repay the loan
        let min_amount_out = match (kind, self.config.mode) {
            (ProtocolKind::Lending, ExecutionMode::FlashLoan) => debt_to_cover,
            _ => U256::ZERO,
        };
        let fee = match kind {
            ProtocolKind::Margin => execution_fee(gas_price, self.config.keeper_gas),
            ProtocolKind::Lending => U256::ZERO,
        };

        LiquidationRequest {
            position: candidate.position.clone(),
            mode: self.config.mode,
            collateral_asset: candidate.collateral_token,
            debt_asset: candidate.debt_token,
            debt_to_cover,
            min_amount_out,
            swap_data: Bytes::new(),
            execution_fee: fee,
            size_delta_usd: candidate.size_delta,
            receiver: self.gateway.signer(),
        }
    }

    async fn attempt(&self, candidate: &LiquidationCandidate) -> Attempt {
        let signed = match self.prepare(candidate).await {
            Ok(signed) => signed,
            Err(attempt) => return attempt,
        };

        let (tx_hash, is_private) = match self.submit(&signed).await {
            Ok(sent) => sent,
            Err(error) => {
                return Attempt::Unmined {
                    tx_hash: None,
                    is_private: false,
                    error,
                }
            }
        };

        match self
            .gateway
            .confirm(
                tx_hash,
                self.config.confirmations,
                self.config.confirmation_timeout(),
            )
            .await
        {
            Ok(confirmation) => Attempt::Mined {
                confirmation,
                is_private,
            },
            Err(error) => Attempt::Unmined {
                tx_hash: Some(tx_hash),
                is_private,
                error,
            },
        }
    }

    /// Gas, calldata, estimate and signature. Transient RPC errors are retried.
    async fn prepare(&self, candidate: &LiquidationCandidate) -> Result<SignedTx, Attempt> {
        let gas = self
            .retry
            .retry("gas_params", || self.gateway.gas_params(), ChainError::is_transient)
            .await
            .map_err(Attempt::Unsigned)?
            .bumped(self.config.gas_price_buffer_bps);

        let request = self.request(candidate, gas.effective_gas_price());
        let call = self
            .gateway
            .build_call(&request)
            .map_err(Attempt::Unsigned)?;

        let estimated = self
            .retry
            .retry("estimate_gas", || self.gateway.estimate_gas(&call), ChainError::is_transient)
            .await
            .map_err(Attempt::Unsigned)?;
        let gas_limit = u64::try_from(apply_bps_up(
            U256::from(estimated),
            self.config.gas_limit_buffer_bps,
        ))
        .unwrap_or(u64::MAX);

        debug!(
            estimated = estimated,
            gas_limit = gas_limit,
            gas_price = gas.effective_gas_price(),
            value = %call.value,
            "Liquidation call prepared"
        );

        self.gateway
            .sign(&call, gas_limit, &gas)
            .await
            .map_err(|error| Attempt::Unmined {
                tx_hash: None,
                is_private: false,
                error,
            })
    }

    /// Private relay first, public mempool as configured fallback.
    async fn submit(&self, signed: &SignedTx) -> Result<(B256, bool), ChainError> {
        if self.gateway.relay_enabled() {
            match self.gateway.send_private(signed).await {
                Ok(hash) => {
                    info!(tx_hash = %hash, nonce = signed.nonce, "Submitted via private relay");
                    return Ok((hash, true));
                }
                Err(e) if self.fallback_to_public => {
                    warn!(error = %e, "Private relay failed, falling back to public mempool");
                }
                Err(e) => return Err(e),
            }
        } else if !self.fallback_to_public {
            return Err(ChainError::Relay(
                "private relay disabled and public fallback off".to_string(),
            ));
        }

        let hash = self.gateway.send_public(signed).await?;
        Ok((hash, false))
    }

    /// Turn an attempt into a result, resync the nonce when needed and
    /// record realized P&L.
    async fn settle(&self, candidate: &LiquidationCandidate, attempt: Attempt) -> LiquidationResult {
        let mut result = LiquidationResult::unsent(candidate);

        let needs_resync = match attempt {
            Attempt::Unsigned(error) => {
                warn!(error = %error, "Liquidation failed before signing");
                result.error = Some(error.to_string());
                false
            }
            Attempt::Unmined {
                tx_hash,
                is_private,
                error,
            } => {
                warn!(tx_hash = ?tx_hash, error = %error, "Liquidation not mined");
                result.tx_hash = tx_hash;
                result.is_private_relay = is_private;
                result.error = Some(error.to_string());
                true
            }
            Attempt::Mined {
                confirmation,
                is_private,
            } => {
                let gas_usd =
                    u256_math::wei_to_usd(confirmation.fee_wei(), candidate.native_price_usd);
                result.tx_hash = Some(confirmation.tx_hash);
                result.is_private_relay = is_private;
                result.gas_usd = gas_usd;
                if confirmation.success {
                    result.success = true;
                    result.profit_usd = candidate.profit.gross_profit - gas_usd;
                    info!(
                        tx_hash = %confirmation.tx_hash,
                        profit_usd = format!("${:.2}", result.profit_usd),
                        gas_usd = format!("${:.4}", gas_usd),
                        private = is_private,
                        "Liquidation succeeded"
                    );
                    false
                } else {
                    result.profit_usd = -gas_usd;
                    result.error = Some(
                        ChainError::Reverted {
                            tx_hash: confirmation.tx_hash,
                        }
                        .to_string(),
                    );
                    warn!(tx_hash = %confirmation.tx_hash, gas_usd = gas_usd, "Liquidation reverted");
                    true
                }
            }
        };

        if needs_resync {
            if let Err(e) = self.gateway.resync_nonce().await {
                error!(error = %e, "Nonce resync failed");
            }
        }

        match self.state.record_attempt(result.success, result.profit_usd) {
            Ok(daily) => debug!(
                attempts = daily.attempts,
                loss_usd = daily.total_loss_usd,
                net_usd = daily.net_profit_usd,
                "Attempt recorded"
            ),
            Err(e) => error!(error = %e, "Failed to persist daily stats"),
        }
        result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::risk::fixtures::{candidate, risk_state, MockChain};
    use alloy::primitives::Address;
    use async_trait::async_trait;
    use liquidation_engine_chain::gas::GasParams;
    use liquidation_engine_chain::{ChainResult, TxCall};
    use parking_lot::Mutex as SyncMutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    pub(crate) struct MockGateway {
        pub relay: bool,
        pub relay_fails: bool,
        /// Receipt statuses handed out in order; `None` = never mined
        pub outcomes: SyncMutex<VecDeque<Option<bool>>>,
        pub builds: AtomicUsize,
        pub private_sends: AtomicUsize,
        pub public_sends: AtomicUsize,
        pub resyncs: AtomicUsize,
        pub last_gas_limit: SyncMutex<u64>,
        pub last_request: SyncMutex<Option<LiquidationRequest>>,
    }

    impl MockGateway {
        pub(crate) fn with_outcomes(mut self, outcomes: &[Option<bool>]) -> Self {
            self.outcomes = SyncMutex::new(outcomes.iter().copied().collect());
            self
        }
    }

    #[async_trait]
    impl TxGateway for MockGateway {
        fn signer(&self) -> Address {
            Address::repeat_byte(0x5E)
        }

        fn relay_enabled(&self) -> bool {
            self.relay
        }

        fn build_call(&self, request: &LiquidationRequest) -> ChainResult<TxCall> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock() = Some(request.clone());
            Ok(TxCall {
                to: Address::repeat_byte(0x77),
                input: Bytes::from(vec![0xab]),
                value: request.execution_fee,
            })
        }

        async fn gas_params(&self) -> ChainResult<GasParams> {
            Ok(GasParams::Legacy {
                gas_price: 1_000_000_000,
            })
        }

        async fn estimate_gas(&self, _call: &TxCall) -> ChainResult<u64> {
            Ok(1_000_000)
        }

        async fn sign(&self, _call: &TxCall, gas_limit: u64, gas: &GasParams) -> ChainResult<SignedTx> {
            *self.last_gas_limit.lock() = gas_limit;
            Ok(SignedTx {
                raw: Bytes::from(vec![0x02]),
                hash: B256::repeat_byte(0x11),
                nonce: 7,
                gas_limit,
                gas_price: gas.effective_gas_price(),
            })
        }

        async fn send_private(&self, tx: &SignedTx) -> ChainResult<B256> {
            self.private_sends.fetch_add(1, Ordering::SeqCst);
            if self.relay_fails {
                return Err(ChainError::Relay("bundle rejected".into()));
            }
            Ok(tx.hash)
        }

        async fn send_public(&self, tx: &SignedTx) -> ChainResult<B256> {
            self.public_sends.fetch_add(1, Ordering::SeqCst);
            Ok(tx.hash)
        }

        async fn confirm(&self, tx_hash: B256, _c: u64, _t: Duration) -> ChainResult<Confirmation> {
            match self.outcomes.lock().pop_front().unwrap_or(Some(true)) {
                Some(success) => Ok(Confirmation {
                    tx_hash,
                    success,
                    block_number: Some(101),
                    gas_used: U256::from(100_000u64),
                    effective_gas_price: U256::from(1_000_000_000u64),
                }),
                None => Err(ChainError::ReceiptMissing { tx_hash }),
            }
        }

        async fn resync_nonce(&self) -> ChainResult<u64> {
            self.resyncs.fetch_add(1, Ordering::SeqCst);
            Ok(7)
        }
    }

    fn config(relay: bool, fallback: bool) -> EngineConfig {
        let mut config = EngineConfig::testing();
        config.risk.min_profit_usd = 1.0;
        config.risk.max_gas_price_gwei = 5.0;
        config.relay.enabled = relay;
        config.relay.fallback_to_public = fallback;
        config.execution.mode = ExecutionMode::WalletFunded;
        config.execution.cooldown_ms = 3_000;
        config
    }

    fn service(
        config: &EngineConfig,
        gateway: Arc<MockGateway>,
        dir: &tempfile::TempDir,
    ) -> ExecutionService {
        ExecutionService::new(config, gateway, Arc::new(MockChain::default()), risk_state(dir))
    }

    #[tokio::test]
    async fn test_unprofitable_never_builds_or_sends() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(MockGateway::default());
        let mut cfg = config(false, true);
        cfg.risk.min_profit_usd = 100.0; // candidate nets $38
        let executor = service(&cfg, gateway.clone(), &dir);

        let result = executor.execute(&candidate(0.9, RepayAsset::Native, 1)).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("not profitable"));
        assert_eq!(gateway.builds.load(Ordering::SeqCst), 0);
        assert_eq!(gateway.public_sends.load(Ordering::SeqCst), 0);
        // Preflight rejections are not attempts
        assert_eq!(executor.state.daily().attempts, 0);
    }

    #[tokio::test]
    async fn test_healthy_candidate_rejected_in_preflight() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(MockGateway::default());
        let executor = service(&config(false, true), gateway.clone(), &dir);
        let result = executor.execute(&candidate(1.01, RepayAsset::Native, 1)).await;
        assert!(!result.success);
        assert_eq!(gateway.builds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_gas_above_ceiling_never_sends() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(MockGateway {
            relay: true,
            ..Default::default()
        });
        let chain = MockChain::default();
        *chain.gas_price.lock() = Ok(gwei_to_wei(5.0) + 1);
        let executor = ExecutionService::new(
            &config(true, true),
            gateway.clone(),
            Arc::new(chain),
            risk_state(&dir),
        );

        let result = executor.execute(&candidate(0.9, RepayAsset::Native, 1)).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("above ceiling"));
        assert_eq!(gateway.builds.load(Ordering::SeqCst), 0);
        assert_eq!(gateway.private_sends.load(Ordering::SeqCst), 0);
        assert_eq!(gateway.public_sends.load(Ordering::SeqCst), 0);
        assert_eq!(executor.state.daily().attempts, 0);
    }

    #[tokio::test]
    async fn test_private_relay_success() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(MockGateway {
            relay: true,
            ..Default::default()
        });
        let executor = service(&config(true, true), gateway.clone(), &dir);

        let result = executor.execute(&candidate(0.9, RepayAsset::Native, 1)).await;
        assert!(result.success, "{:?}", result.error);
        assert!(result.is_private_relay);
        assert_eq!(result.tx_hash, Some(B256::repeat_byte(0x11)));
        assert_eq!(gateway.public_sends.load(Ordering::SeqCst), 0);

        // 1M estimate + 20% buffer
        assert_eq!(*gateway.last_gas_limit.lock(), 1_200_000);
        // Margin fee at the bumped price: 1.1 gwei * keeper gas
        let request = gateway.last_request.lock().clone().unwrap();
        let keeper = executor.config.keeper_gas;
        assert_eq!(
            request.execution_fee,
            U256::from(1_100_000_000u128) * U256::from(keeper)
        );
        assert_eq!(request.receiver, Address::repeat_byte(0x5E));

        // gross 40 - 0.2 gas
        assert!((result.profit_usd - 39.8).abs() < 1e-9);
        let daily = executor.state.daily();
        assert_eq!(daily.successes, 1);
        assert!((daily.total_profit_usd - 39.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_relay_failure_falls_back_to_public() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(MockGateway {
            relay: true,
            relay_fails: true,
            ..Default::default()
        });
        let executor = service(&config(true, true), gateway.clone(), &dir);

        let result = executor.execute(&candidate(0.9, RepayAsset::Native, 1)).await;
        assert!(result.success);
        assert!(!result.is_private_relay);
        assert_eq!(gateway.private_sends.load(Ordering::SeqCst), 1);
        assert_eq!(gateway.public_sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_relay_failure_without_fallback_fails() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(MockGateway {
            relay: true,
            relay_fails: true,
            ..Default::default()
        });
        let executor = service(&config(true, false), gateway.clone(), &dir);

        let result = executor.execute(&candidate(0.9, RepayAsset::Native, 1)).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("bundle rejected"));
        assert_eq!(gateway.public_sends.load(Ordering::SeqCst), 0);
        assert_eq!(gateway.resyncs.load(Ordering::SeqCst), 1);
        // Recorded with zero P&L
        let daily = executor.state.daily();
        assert_eq!(daily.failures, 1);
        assert_eq!(daily.total_loss_usd, 0.0);
    }

    #[tokio::test]
    async fn test_relay_disabled_uses_public() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(MockGateway::default());
        let executor = service(&config(false, true), gateway.clone(), &dir);
        let result = executor.execute(&candidate(0.9, RepayAsset::Native, 1)).await;
        assert!(result.success);
        assert_eq!(gateway.private_sends.load(Ordering::SeqCst), 0);
        assert_eq!(gateway.public_sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_revert_records_gas_loss() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(MockGateway::default().with_outcomes(&[Some(false)]));
        let executor = service(&config(false, true), gateway.clone(), &dir);

        let result = executor.execute(&candidate(0.9, RepayAsset::Native, 1)).await;
        assert!(!result.success);
        assert!(result.tx_hash.is_some());
        assert!((result.profit_usd + 0.2).abs() < 1e-9);
        assert_eq!(gateway.resyncs.load(Ordering::SeqCst), 1);

        let daily = executor.state.daily();
        assert_eq!(daily.failures, 1);
        assert!((daily.total_loss_usd - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_missing_receipt_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(MockGateway::default().with_outcomes(&[None]));
        let executor = service(&config(false, true), gateway.clone(), &dir);

        let result = executor.execute(&candidate(0.9, RepayAsset::Native, 1)).await;
        assert!(!result.success);
        assert_eq!(result.profit_usd, 0.0);
        assert!(result.error.unwrap().contains("no receipt"));
        assert_eq!(executor.state.daily().attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_only_after_success() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(
            MockGateway::default().with_outcomes(&[Some(true), Some(false), Some(true)]),
        );
        let executor = service(&config(false, true), gateway, &dir);
        let batch = vec![
            candidate(0.9, RepayAsset::Native, 1),
            candidate(0.9, RepayAsset::Native, 1),
            candidate(0.9, RepayAsset::Native, 1),
        ];

        let start = tokio::time::Instant::now();
        let results = executor.execute_batch(&batch).await;
        let elapsed = start.elapsed();

        assert_eq!(
            results.iter().map(|r| r.success).collect::<Vec<_>>(),
            vec![true, false, true]
        );
        // One pause: after the first success. None after the revert or the last item.
        assert!(elapsed >= Duration::from_millis(3_000));
        assert!(elapsed < Duration::from_millis(6_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_holds_across_concurrent_callers() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(MockGateway::default());
        let executor = service(&config(false, true), gateway.clone(), &dir);
        let first = candidate(0.9, RepayAsset::Native, 1);
        let second = candidate(0.9, RepayAsset::Native, 1);

        let start = tokio::time::Instant::now();
        let (a, b) = tokio::join!(executor.execute(&first), executor.execute(&second));
        let elapsed = start.elapsed();

        assert!(a.success && b.success);
        assert_eq!(gateway.public_sends.load(Ordering::SeqCst), 2);
        // Two separate callers, still one cooldown between the sends
        assert!(elapsed >= Duration::from_millis(3_000));
    }
}
