use super::checks::{RiskCheckResult, RiskCheckType, RiskValidationResult};
use super::state::{RiskState, LOSS_LATCH_ACTOR};
use crate::config::RiskConfig;
use crate::context::ChainView;
use crate::position::{LiquidationCandidate, RepayAsset};
use crate::u256_math::{self, gwei_to_wei};
use alloy::primitives::Address;
use liquidation_engine_chain::ExecutionMode;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Sequential risk gates in front of execution.
///
/// Emergency stop and daily loss abort the pipeline on failure; every later
/// stage runs and contributes a result so rejections are fully explained.
pub struct RiskManager {
    config: RiskConfig,
    state: Arc<RiskState>,
    chain: Arc<dyn ChainView>,
}

impl RiskManager {
    pub fn new(config: RiskConfig, state: Arc<RiskState>, chain: Arc<dyn ChainView>) -> Self {
        Self {
            config,
            state,
            chain,
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn state(&self) -> &Arc<RiskState> {
        &self.state
    }

    #[instrument(skip(self, candidate), fields(account = %candidate.account(), key = %candidate.key))]
    pub async fn validate(
        &self,
        candidate: &LiquidationCandidate,
        mode: ExecutionMode,
    ) -> RiskValidationResult {
        let mut results = Vec::with_capacity(7);

        let stop = self.check_emergency_stop();
        if !stop.passed {
            results.push(stop);
            return RiskValidationResult::from_results(results);
        }
        results.push(stop);

        let loss = self.check_daily_loss();
        if !loss.passed {
            results.push(loss);
            return RiskValidationResult::from_results(results);
        }
        results.push(loss);

        results.push(self.check_gas_price().await);
        results.push(self.check_tokens(candidate));
        if let Some(balance) = self.check_balance(candidate, mode).await {
            results.push(balance);
        }
        results.push(self.check_health(candidate).await);
        results.extend(self.check_size(candidate));

        let validation = RiskValidationResult::from_results(results);
        if validation.can_proceed {
            debug!("Risk checks passed");
        } else {
            debug!(failed = %validation.failure_summary(), "Risk checks rejected candidate");
        }
        validation
    }

    fn check_emergency_stop(&self) -> RiskCheckResult {
        match self.state.emergency_stop() {
            Ok(stop) if stop.is_active => RiskCheckResult::fail(
                RiskCheckType::EmergencyStop,
                format!(
                    "emergency stop active: {}",
                    stop.reason.as_deref().unwrap_or("manual")
                ),
                json!({
                    "reason": stop.reason,
                    "activatedAt": stop.activated_at,
                    "activatedBy": stop.activated_by,
                }),
            ),
            Ok(_) => RiskCheckResult::pass(RiskCheckType::EmergencyStop, json!({})),
            // Unreadable breaker state counts as stopped
            Err(e) => RiskCheckResult::fail(
                RiskCheckType::EmergencyStop,
                format!("emergency stop state unreadable: {e}"),
                json!({}),
            ),
        }
    }

    fn check_daily_loss(&self) -> RiskCheckResult {
        let daily = self.state.daily();
        let limit = self.config.daily_loss_limit_usd;
        let details = json!({
            "date": daily.date,
            "totalLossUsd": daily.total_loss_usd,
            "limitUsd": limit,
        });

        if daily.total_loss_usd > limit {
            let reason = format!(
                "daily loss ${:.2} exceeds limit ${:.2}",
                daily.total_loss_usd, limit
            );
            if let Err(e) = self.state.activate_emergency_stop(&reason, LOSS_LATCH_ACTOR) {
                warn!(error = %e, "Failed to persist emergency stop latch");
            }
            return RiskCheckResult::fail(RiskCheckType::DailyLossLimit, reason, details);
        }
        RiskCheckResult::pass(RiskCheckType::DailyLossLimit, details)
    }

    async fn check_gas_price(&self) -> RiskCheckResult {
        let max_gwei = self.config.max_gas_price_gwei;
        match self.chain.gas_price_wei().await {
            Ok(current) => {
                let details = json!({
                    "currentGwei": current as f64 / u256_math::GWEI as f64,
                    "maxGwei": max_gwei,
                });
                if current > gwei_to_wei(max_gwei) {
                    RiskCheckResult::fail(
                        RiskCheckType::GasPrice,
                        format!(
                            "gas price {:.4} gwei above ceiling {max_gwei} gwei",
                            current as f64 / u256_math::GWEI as f64
                        ),
                        details,
                    )
                } else {
                    RiskCheckResult::pass(RiskCheckType::GasPrice, details)
                }
            }
            Err(e) => RiskCheckResult::fail(
                RiskCheckType::GasPrice,
                format!("gas price unavailable: {e}"),
                json!({ "maxGwei": max_gwei }),
            ),
        }
    }

    /// A non-empty whitelist replaces the blacklist entirely.
    fn check_tokens(&self, candidate: &LiquidationCandidate) -> RiskCheckResult {
        let tokens = [candidate.debt_token, candidate.collateral_token];
        let details = json!({
            "debtToken": candidate.debt_token,
            "collateralToken": candidate.collateral_token,
        });

        if !self.config.token_whitelist.is_empty() {
            let outside: Vec<Address> = tokens
                .into_iter()
                .filter(|t| !self.config.token_whitelist.contains(t))
                .collect();
            return if outside.is_empty() {
                RiskCheckResult::pass(RiskCheckType::TokenWhitelist, details)
            } else {
                RiskCheckResult::fail(
                    RiskCheckType::TokenWhitelist,
                    format!("tokens not whitelisted: {outside:?}"),
                    details,
                )
            };
        }

        let banned: Vec<Address> = tokens
            .into_iter()
            .filter(|t| self.config.token_blacklist.contains(t))
            .collect();
        if banned.is_empty() {
            RiskCheckResult::pass(RiskCheckType::TokenBlacklist, details)
        } else {
            RiskCheckResult::fail(
                RiskCheckType::TokenBlacklist,
                format!("tokens blacklisted: {banned:?}"),
                details,
            )
        }
    }

    /// Skipped entirely when a flash loan funds the repayment.
    async fn check_balance(
        &self,
        candidate: &LiquidationCandidate,
        mode: ExecutionMode,
    ) -> Option<RiskCheckResult> {
        if mode == ExecutionMode::FlashLoan {
            return None;
        }

        let required = candidate.repay_amount;
        let (asset, balance) = match candidate.repay_asset {
            RepayAsset::Native => ("native".to_string(), self.chain.native_balance().await),
            RepayAsset::Token(token) => (token.to_string(), self.chain.token_balance(token).await),
        };

        Some(match balance {
            Ok(available) => {
                let details = json!({
                    "asset": asset,
                    "required": required.to_string(),
                    "available": available.to_string(),
                });
                if available >= required {
                    RiskCheckResult::pass(RiskCheckType::InsufficientBalance, details)
                } else {
                    RiskCheckResult::fail(
                        RiskCheckType::InsufficientBalance,
                        format!("balance {available} below required {required}"),
                        details,
                    )
                }
            }
            Err(e) => RiskCheckResult::fail(
                RiskCheckType::InsufficientBalance,
                format!("balance unavailable: {e}"),
                json!({ "asset": asset, "required": required.to_string() }),
            ),
        })
    }

    async fn check_health(&self, candidate: &LiquidationCandidate) -> RiskCheckResult {
        let hf = candidate.metrics.health_factor;
        if !candidate.metrics.is_liquidatable() {
            return RiskCheckResult::fail(
                RiskCheckType::HealthFactorChanged,
                format!("health factor {hf:.4} is no longer below 1.0"),
                json!({ "healthFactor": hf, "source": "candidate" }),
            );
        }

        match self.chain.reverify(candidate).await {
            Ok(verdict) if verdict.liquidatable => RiskCheckResult::pass(
                RiskCheckType::HealthFactorChanged,
                json!({
                    "healthFactor": hf,
                    "onchainHealthFactor": verdict.health_factor_wad.map(u256_math::wad_to_f64),
                }),
            ),
            Ok(verdict) => RiskCheckResult::fail(
                RiskCheckType::HealthFactorChanged,
                "position is no longer liquidatable on chain",
                json!({
                    "healthFactor": hf,
                    "onchainHealthFactor": verdict.health_factor_wad.map(u256_math::wad_to_f64),
                    "onchainReason": verdict.reason,
                }),
            ),
            Err(e) => RiskCheckResult::fail(
                RiskCheckType::HealthFactorChanged,
                format!("unable to re-verify health factor: {e}"),
                json!({ "healthFactor": hf }),
            ),
        }
    }

    fn check_size(&self, candidate: &LiquidationCandidate) -> [RiskCheckResult; 2] {
        let size = candidate.size_usd;
        let min = self.config.min_position_size_usd;
        let max = self.config.max_position_size_usd;
        let details = json!({ "sizeUsd": size, "minUsd": min, "maxUsd": max });

        let small = if size < min {
            RiskCheckResult::fail(
                RiskCheckType::PositionTooSmall,
                format!("position ${size:.2} below minimum ${min:.2}"),
                details.clone(),
            )
        } else {
            RiskCheckResult::pass(RiskCheckType::PositionTooSmall, details.clone())
        };
        let large = if size > max {
            RiskCheckResult::fail(
                RiskCheckType::PositionTooLarge,
                format!("position ${size:.2} above maximum ${max:.2}"),
                details.clone(),
            )
        } else {
            RiskCheckResult::pass(RiskCheckType::PositionTooLarge, details)
        };
        [small, large]
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::health::HealthMetrics;
    use crate::profit::{LiquidationPlan, ProfitEstimate};
    use crate::risk::store::{JsonStateStore, StateStore, EMERGENCY_STOP_FILE};
    use crate::u256_math::WAD;
    use alloy::primitives::U256;
    use async_trait::async_trait;
    use liquidation_engine_chain::{
        ChainError, ChainResult, MarginMarket, MarginPositionState, MarketMetadata,
        OnchainVerdict, PositionRef, RawPosition,
    };
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) const WETH: Address = Address::repeat_byte(0xEE);
    pub(crate) const USDC: Address = Address::repeat_byte(0xAA);

    /// Scriptable chain reads.
    pub(crate) struct MockChain {
        pub gas_price: Mutex<ChainResult<u128>>,
        pub native: U256,
        pub token: U256,
        pub liquidatable: Mutex<bool>,
        pub reverify_fails: bool,
        pub reverify_calls: AtomicUsize,
    }

    impl Default for MockChain {
        fn default() -> Self {
            Self {
                gas_price: Mutex::new(Ok(gwei_to_wei(1.0))),
                native: U256::from(10u64).pow(U256::from(18u64)),
                token: U256::from(1_000_000_000u64),
                liquidatable: Mutex::new(true),
                reverify_fails: false,
                reverify_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ChainView for MockChain {
        async fn block_number(&self) -> ChainResult<u64> {
            Ok(100)
        }

        async fn gas_price_wei(&self) -> ChainResult<u128> {
            match &*self.gas_price.lock() {
                Ok(price) => Ok(*price),
                Err(_) => Err(ChainError::Timeout {
                    op: "gas_price",
                    after: std::time::Duration::from_secs(1),
                }),
            }
        }

        async fn native_balance(&self) -> ChainResult<U256> {
            Ok(self.native)
        }

        async fn token_balance(&self, _token: Address) -> ChainResult<U256> {
            Ok(self.token)
        }

        async fn reverify(&self, _candidate: &LiquidationCandidate) -> ChainResult<OnchainVerdict> {
            self.reverify_calls.fetch_add(1, Ordering::SeqCst);
            if self.reverify_fails {
                return Err(ChainError::Timeout {
                    op: "check_liquidatable",
                    after: std::time::Duration::from_secs(1),
                });
            }
            let liquidatable = *self.liquidatable.lock();
            Ok(OnchainVerdict {
                liquidatable,
                health_factor_wad: None,
                reason: (!liquidatable).then(|| "healthy".to_string()),
            })
        }
    }

    pub(crate) fn metrics(hf: f64) -> HealthMetrics {
        HealthMetrics {
            health_factor: hf,
            liquidation_price: Some(2_000.0),
            leverage: 10.0,
            collateral_value_usd: 950.0,
            size_value_usd: 10_000.0,
            unrealized_pnl_usd: 0.0,
            health_factor_wad: Some(crate::u256_math::f64_to_wad(hf)),
        }
    }

    /// Margin candidate repaying `repay_amount` of `repay_asset`.
    pub(crate) fn candidate(hf: f64, repay_asset: RepayAsset, repay_amount: u64) -> LiquidationCandidate {
        let market = Address::with_last_byte(0x10);
        let position = PositionRef::Margin {
            account: Address::with_last_byte(0x01),
            market,
            collateral_token: USDC,
            is_long: true,
        };
        let raw = RawPosition::Margin(MarginPositionState {
            account: Address::with_last_byte(0x01),
            market,
            collateral_token: USDC,
            index_token: WETH,
            is_long: true,
            size_in_usd: U256::ZERO,
            size_in_tokens: U256::ZERO,
            collateral_amount: U256::ZERO,
            fees_owed: U256::ZERO,
            index_decimals: 18,
        });
        let meta = MarketMetadata::Margin(MarginMarket {
            market,
            index_token: WETH,
            long_token: WETH,
            short_token: USDC,
            index_decimals: 18,
            min_collateral_factor_wad: WAD / U256::from(10u64),
        });
        let plan = LiquidationPlan {
            repay_asset,
            repay_amount: U256::from(repay_amount),
            debt_token: WETH,
            collateral_token: USDC,
            size_delta: U256::ZERO,
            estimate: ProfitEstimate {
                gross_profit: 40.0,
                gas_cost: 2.0,
                slippage_cost: 0.0,
                net_profit: 38.0,
                liquidation_bonus_pct: 0.2,
            },
        };
        LiquidationCandidate::new(position, raw, meta, metrics(hf), plan, 2_000.0, true)
    }

    pub(crate) fn risk_state(dir: &tempfile::TempDir) -> Arc<RiskState> {
        let store: Arc<dyn StateStore> = Arc::new(JsonStateStore::open(dir.path()).unwrap());
        Arc::new(RiskState::load(store).unwrap())
    }

    fn manager(config: RiskConfig, dir: &tempfile::TempDir, chain: Arc<MockChain>) -> RiskManager {
        RiskManager::new(config, risk_state(dir), chain)
    }

    fn permissive() -> RiskConfig {
        RiskConfig {
            min_position_size_usd: 100.0,
            max_position_size_usd: 100_000.0,
            min_profit_usd: 1.0,
            max_gas_price_gwei: 5.0,
            daily_loss_limit_usd: 500.0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_all_checks_pass() {
        let dir = tempfile::tempdir().unwrap();
        let risk = manager(permissive(), &dir, Arc::new(MockChain::default()));
        let result = risk
            .validate(&candidate(0.95, RepayAsset::Native, 1_000), ExecutionMode::WalletFunded)
            .await;
        assert!(result.can_proceed, "{:?}", result.failure_summary());
        // Every stage reported, size bounds as two results
        assert_eq!(result.results.len(), 8);
    }

    #[tokio::test]
    async fn test_healthy_candidate_fails_without_rpc() {
        let dir = tempfile::tempdir().unwrap();
        let chain = Arc::new(MockChain::default());
        let risk = manager(permissive(), &dir, chain.clone());

        for hf in [1.0, 1.2] {
            let result = risk
                .validate(&candidate(hf, RepayAsset::Native, 1), ExecutionMode::FlashLoan)
                .await;
            assert!(!result.can_proceed);
            assert!(result.failed(RiskCheckType::HealthFactorChanged));
        }
        assert_eq!(chain.reverify_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_onchain_recovery_and_rpc_failure() {
        let dir = tempfile::tempdir().unwrap();
        let chain = Arc::new(MockChain::default());
        *chain.liquidatable.lock() = false;
        let risk = manager(permissive(), &dir, chain);
        let result = risk
            .validate(&candidate(0.9, RepayAsset::Native, 1), ExecutionMode::FlashLoan)
            .await;
        assert!(result.failed(RiskCheckType::HealthFactorChanged));

        let chain = Arc::new(MockChain {
            reverify_fails: true,
            ..Default::default()
        });
        let risk = manager(permissive(), &dir, chain);
        let result = risk
            .validate(&candidate(0.9, RepayAsset::Native, 1), ExecutionMode::FlashLoan)
            .await;
        let failure = result.failures().next().unwrap();
        assert_eq!(failure.check_type, RiskCheckType::HealthFactorChanged);
        assert!(failure.reason.contains("unable to re-verify"));
    }

    #[tokio::test]
    async fn test_daily_loss_latches_and_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = permissive();
        {
            let state = risk_state(&dir);
            state.record_attempt(false, -500.01).unwrap();
            let risk = RiskManager::new(config.clone(), state, Arc::new(MockChain::default()));
            let result = risk
                .validate(&candidate(0.9, RepayAsset::Native, 1), ExecutionMode::FlashLoan)
                .await;
            assert!(!result.can_proceed);
            assert!(result.failed(RiskCheckType::DailyLossLimit));
            // Hard stop: nothing after stage 2
            assert_eq!(result.results.len(), 2);
        }

        // New process: the latch fires first
        let risk = manager(config, &dir, Arc::new(MockChain::default()));
        let result = risk
            .validate(&candidate(0.9, RepayAsset::Native, 1), ExecutionMode::FlashLoan)
            .await;
        assert_eq!(result.results.len(), 1);
        assert!(result.failed(RiskCheckType::EmergencyStop));
        let stop = risk.state().emergency_stop().unwrap();
        assert_eq!(stop.activated_by.as_deref(), Some(LOSS_LATCH_ACTOR));
    }

    #[tokio::test]
    async fn test_loss_equal_to_limit_passes() {
        let dir = tempfile::tempdir().unwrap();
        let state = risk_state(&dir);
        state.record_attempt(false, -500.0).unwrap();
        let risk = RiskManager::new(permissive(), state, Arc::new(MockChain::default()));
        let result = risk
            .validate(&candidate(0.9, RepayAsset::Native, 1), ExecutionMode::FlashLoan)
            .await;
        assert!(!result.failed(RiskCheckType::DailyLossLimit));
        assert!(!risk.state().emergency_stop().unwrap().is_active);
    }

    #[tokio::test]
    async fn test_manual_emergency_stop_file() {
        let dir = tempfile::tempdir().unwrap();
        let risk = manager(permissive(), &dir, Arc::new(MockChain::default()));
        std::fs::write(dir.path().join(EMERGENCY_STOP_FILE), "").unwrap();

        let result = risk
            .validate(&candidate(0.9, RepayAsset::Native, 1), ExecutionMode::FlashLoan)
            .await;
        assert!(!result.can_proceed);
        assert_eq!(result.results.len(), 1);
        assert!(result.failed(RiskCheckType::EmergencyStop));
    }

    #[tokio::test]
    async fn test_gas_ceiling_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let chain = Arc::new(MockChain::default());
        let risk = manager(permissive(), &dir, chain.clone());
        let c = candidate(0.9, RepayAsset::Native, 1);

        *chain.gas_price.lock() = Ok(5_000_000_000);
        let at = risk.validate(&c, ExecutionMode::FlashLoan).await;
        assert!(!at.failed(RiskCheckType::GasPrice));

        *chain.gas_price.lock() = Ok(5_000_000_100); // 5.0000001 gwei
        let above = risk.validate(&c, ExecutionMode::FlashLoan).await;
        assert!(above.failed(RiskCheckType::GasPrice));

        *chain.gas_price.lock() = Err(ChainError::Relay("down".into()));
        let unknown = risk.validate(&c, ExecutionMode::FlashLoan).await;
        assert!(unknown.failed(RiskCheckType::GasPrice));
    }

    #[tokio::test]
    async fn test_whitelist_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let c = candidate(0.9, RepayAsset::Native, 1);

        // Both tokens whitelisted and blacklisted: whitelist wins
        let config = RiskConfig {
            token_whitelist: vec![WETH, USDC],
            token_blacklist: vec![WETH],
            ..permissive()
        };
        let result = manager(config, &dir, Arc::new(MockChain::default()))
            .validate(&c, ExecutionMode::FlashLoan)
            .await;
        assert!(result.can_proceed);
        assert!(result
            .results
            .iter()
            .any(|r| r.check_type == RiskCheckType::TokenWhitelist));
        assert!(!result
            .results
            .iter()
            .any(|r| r.check_type == RiskCheckType::TokenBlacklist));

        let config = RiskConfig {
            token_whitelist: vec![WETH],
            ..permissive()
        };
        let result = manager(config, &dir, Arc::new(MockChain::default()))
            .validate(&c, ExecutionMode::FlashLoan)
            .await;
        assert!(result.failed(RiskCheckType::TokenWhitelist));

        let config = RiskConfig {
            token_blacklist: vec![USDC],
            ..permissive()
        };
        let result = manager(config, &dir, Arc::new(MockChain::default()))
            .validate(&c, ExecutionMode::FlashLoan)
            .await;
        assert!(result.failed(RiskCheckType::TokenBlacklist));
    }

    #[tokio::test]
    async fn test_balance_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let chain = Arc::new(MockChain {
            token: U256::from(499u64),
            ..Default::default()
        });
        let risk = manager(permissive(), &dir, chain);

        let short = risk
            .validate(&candidate(0.9, RepayAsset::Token(WETH), 500), ExecutionMode::WalletFunded)
            .await;
        assert!(short.failed(RiskCheckType::InsufficientBalance));

        let exact = risk
            .validate(&candidate(0.9, RepayAsset::Token(WETH), 499), ExecutionMode::WalletFunded)
            .await;
        assert!(!exact.failed(RiskCheckType::InsufficientBalance));

        // Flash loans skip the stage
        let flash = risk
            .validate(&candidate(0.9, RepayAsset::Token(WETH), 500), ExecutionMode::FlashLoan)
            .await;
        assert!(!flash
            .results
            .iter()
            .any(|r| r.check_type == RiskCheckType::InsufficientBalance));
    }

    #[tokio::test]
    async fn test_size_bounds_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let config = RiskConfig {
            min_position_size_usd: 20_000.0,
            max_position_size_usd: 50_000.0,
            max_gas_price_gwei: 0.5,
            ..permissive()
        };
        let result = manager(config, &dir, Arc::new(MockChain::default()))
            .validate(&candidate(0.9, RepayAsset::Native, 1), ExecutionMode::FlashLoan)
            .await;
        // Later stages still run after an earlier soft failure
        assert!(result.failed(RiskCheckType::GasPrice));
        assert!(result.failed(RiskCheckType::PositionTooSmall));
        assert!(!result.failed(RiskCheckType::PositionTooLarge));

        let config = RiskConfig {
            max_position_size_usd: 5_000.0,
            ..permissive()
        };
        let result = manager(config, &dir, Arc::new(MockChain::default()))
            .validate(&candidate(0.9, RepayAsset::Native, 1), ExecutionMode::FlashLoan)
            .await;
        assert!(result.failed(RiskCheckType::PositionTooLarge));
        assert_eq!(result.failure_summary(), "POSITION_TOO_LARGE");
    }
}
