//! Discovery and verification loop.
//!
//! Each cycle pulls candidates from the off-chain index, re-reads every one
//! of them on chain, and hands the positions the protocol confirms as
//! liquidatable to the risk pipeline. Nothing is tracked across cycles
//! except market metadata, which is static.
//!
//! # Per-position lifecycle
//!
//! ```text
//! Indexed -> VerifiedHealthy
//!         -> VerifiedLiquidatable -> ExecutionAttempted -> Succeeded | Failed
//! ```

use crate::backoff::Backoff;
use crate::config::{EngineConfig, MonitorConfig};
use crate::context::{market_tokens, ChainView};
use crate::executor::ExecutionService;
use crate::health::{evaluate, ProtocolParams};
use crate::position::{CycleReport, LiquidationCandidate, PositionStage};
use crate::price_cache::PriceCache;
use crate::profit::{self, plan_liquidation, CostInputs};
use crate::risk::RiskManager;
use alloy::primitives::Address;
use anyhow::{Context, Result};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use liquidation_engine_api::{IndexedPosition, PositionIndex};
use liquidation_engine_chain::{
    ChainError, ExecutionMode, LiquidationProtocol, MarketMetadata, PositionRef, PriceTable,
    ProtocolKind,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// What happens when a tick fires while the previous cycle still runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOverlap {
    /// Await each cycle; ticks missed meanwhile are skipped
    #[default]
    NoOverlap,
    /// Start a cycle on every tick regardless
    Concurrent,
}

/// Where a cycle's positions come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// At-risk candidates from the index, verified one by one
    #[default]
    Candidates,
    /// The whole index, pre-filtered through batched multicall reads
    Bulk,
}

/// A position ready for verification.
#[derive(Debug, Clone)]
struct Target {
    position: PositionRef,
    market: MarketMetadata,
    index_flagged: bool,
}

/// Result of verifying one target.
enum Verification {
    Skipped,
    Healthy { mismatch: bool },
    Liquidatable(Box<LiquidationCandidate>),
}

/// Periodic pull loop feeding the risk pipeline.
pub struct Monitor {
    config: MonitorConfig,
    execution_enabled: bool,
    mode: ExecutionMode,
    liquidation_gas: u64,
    keeper_gas: u64,
    margin_fee_bps: u32,
    slippage_bps: u32,
    native_token: Address,
    default_market: Option<Address>,
    retry: Backoff,
    protocol: Arc<dyn LiquidationProtocol>,
    index: Arc<dyn PositionIndex>,
    prices: Arc<PriceCache>,
    chain: Arc<dyn ChainView>,
    risk: Arc<RiskManager>,
    executor: Arc<ExecutionService>,
    markets: DashMap<Address, MarketMetadata>,
    /// Earliest start of the next verification, shared by all in-flight items
    next_slot: Mutex<Option<Instant>>,
}

impl Monitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &EngineConfig,
        protocol: Arc<dyn LiquidationProtocol>,
        index: Arc<dyn PositionIndex>,
        prices: Arc<PriceCache>,
        chain: Arc<dyn ChainView>,
        risk: Arc<RiskManager>,
        executor: Arc<ExecutionService>,
    ) -> Self {
        Self {
            config: config.monitor.clone(),
            execution_enabled: config.execution.enabled,
            mode: config.execution.mode,
            liquidation_gas: config.execution.liquidation_gas,
            keeper_gas: config.execution.keeper_gas,
            margin_fee_bps: config.execution.margin_fee_bps,
            slippage_bps: config.execution.slippage_bps,
            native_token: config.protocol.native_token,
            default_market: config.protocol.default_market(),
            retry: config.retry,
            protocol,
            index,
            prices,
            chain,
            risk,
            executor,
            markets: DashMap::new(),
            next_slot: Mutex::new(None),
        }
    }

    /// Run cycles on the configured interval until `shutdown` flips.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval_secs,
            overlap = ?self.config.overlap,
            scan_mode = ?self.config.scan_mode,
            execution_enabled = self.execution_enabled,
            "Starting monitor"
        );
        let monitor = self.clone();
        run_schedule(
            self.config.interval(),
            self.config.overlap,
            shutdown,
            move || {
                let monitor = monitor.clone();
                async move {
                    match monitor.config.scan_mode {
                        ScanMode::Candidates => monitor.run_cycle().await,
                        ScanMode::Bulk => monitor.bulk_scan().await,
                    }
                }
            },
        )
        .await;
        info!("Monitor stopped");
    }

    /// One discovery cycle over the index's at-risk candidates.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let block = self.probe().await?;
        let indexed = self
            .index
            .fetch_candidates(self.config.health_factor_max, self.config.candidate_limit)
            .await
            .context("fetching index candidates")?;
        debug!(block = block, candidates = indexed.len(), "Index candidates fetched");
        self.process(indexed, false).await
    }

    /// One cycle over the full index, pre-filtered with batched reads.
    #[instrument(skip(self))]
    pub async fn bulk_scan(&self) -> Result<CycleReport> {
        let block = self.probe().await?;
        let indexed = self
            .index
            .fetch_all()
            .await
            .context("fetching full index")?;
        debug!(block = block, positions = indexed.len(), "Full index fetched");
        self.process(indexed, true).await
    }

    async fn probe(&self) -> Result<u64> {
        self.chain.block_number().await.context("RPC probe failed")
    }

    async fn process(&self, indexed: Vec<IndexedPosition>, bulk: bool) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        let mut refs = Vec::with_capacity(indexed.len());
        for entry in &indexed {
            report.record(PositionStage::Indexed);
            match self.resolve(entry) {
                Some(position) => refs.push((position, entry.is_liquidatable)),
                None => {
                    debug!(account = %entry.account, "Index entry lacks position identity");
                    report.skipped += 1;
                }
            }
        }

        let markets = self.load_markets(&refs).await;
        let mut targets = Vec::with_capacity(refs.len());
        for (position, index_flagged) in refs {
            match markets.get(&position.market_id()) {
                Some(market) => targets.push(Target {
                    position,
                    market: market.clone(),
                    index_flagged,
                }),
                None => report.skipped += 1,
            }
        }

        let mut tokens: HashSet<Address> = markets.values().flat_map(market_tokens).collect();
        if self.native_token != Address::ZERO {
            tokens.insert(self.native_token);
        }
        let tokens: Vec<Address> = tokens.into_iter().collect();
        if !tokens.is_empty() {
            self.prices
                .refresh(&tokens)
                .await
                .context("price refresh failed")?;
        }
        let table = self.prices.table();

        let gas_price_wei = self
            .chain
            .gas_price_wei()
            .await
            .context("gas price unavailable")?;
        let costs = CostInputs {
            gas_price_wei,
            liquidation_gas: self.liquidation_gas,
            keeper_gas: self.keeper_gas,
            native_price_usd: profit::native_price_usd(
                self.protocol.kind(),
                &table,
                self.native_token,
            ),
            margin_fee_bps: self.margin_fee_bps,
            slippage_bps: self.slippage_bps,
            mode: self.mode,
        };

        if bulk {
            targets = self.prefilter(targets, &table, &mut report).await;
        }

        let verified: Vec<Verification> = stream::iter(targets)
            .map(|target| {
                let table = &table;
                let costs = &costs;
                async move {
                    self.pace().await;
                    self.verify(target, table, costs).await
                }
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut candidates = Vec::new();
        for outcome in verified {
            match outcome {
                Verification::Skipped => report.skipped += 1,
                Verification::Healthy { mismatch } => {
                    report.record(PositionStage::VerifiedHealthy);
                    if mismatch {
                        report.mismatches += 1;
                    }
                }
                Verification::Liquidatable(candidate) => {
                    report.record(PositionStage::VerifiedLiquidatable);
                    candidates.push(*candidate);
                }
            }
        }

        self.dispatch(candidates, &mut report).await;

        info!(
            indexed = report.indexed,
            healthy = report.verified_healthy,
            liquidatable = report.verified_liquidatable,
            rejected = report.rejected,
            attempted = report.execution_attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            mismatches = report.mismatches,
            pnl_usd = report.realized_pnl_usd,
            "Cycle complete"
        );
        Ok(report)
    }

    /// Wait for this item's slot. Slots are `item_delay` apart across all
    /// concurrent verifications, so the RPC sees a steady request rate.
    async fn pace(&self) {
        let delay = self.config.item_delay();
        if delay.is_zero() {
            return;
        }
        let slot = {
            let mut next = self.next_slot.lock();
            let now = Instant::now();
            let slot = next.map_or(now, |n| n.max(now));
            *next = Some(slot + delay);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }

    /// Canonical position identity from an index entry.
    fn resolve(&self, entry: &IndexedPosition) -> Option<PositionRef> {
        match self.protocol.kind() {
            ProtocolKind::Margin => Some(PositionRef::Margin {
                account: entry.account,
                market: entry.market?,
                collateral_token: entry.collateral_token?,
                is_long: entry.is_long?,
            }),
            ProtocolKind::Lending => Some(PositionRef::Debt {
                account: entry.account,
                pool: entry.market.or(self.default_market)?,
            }),
        }
    }

    /// Cached metadata for every market referenced; markets that cannot be
    /// loaded within the retry budget are left out for this cycle.
    async fn load_markets(&self, refs: &[(PositionRef, bool)]) -> HashMap<Address, MarketMetadata> {
        let ids: HashSet<Address> = refs.iter().map(|(p, _)| p.market_id()).collect();
        let mut loaded = HashMap::with_capacity(ids.len());

        for id in ids {
            let cached = self.markets.get(&id).map(|m| m.value().clone());
            if let Some(market) = cached {
                loaded.insert(id, market);
                continue;
            }

            match self
                .retry
                .retry(
                    "market_metadata",
                    || self.protocol.market_metadata(id),
                    ChainError::is_transient,
                )
                .await
            {
                Ok(market) => {
                    debug!(market = %id, "Market metadata cached");
                    self.markets.insert(id, market.clone());
                    loaded.insert(id, market);
                }
                Err(e) => {
                    warn!(market = %id, error = %e, "Market metadata unavailable, skipping market this cycle");
                }
            }
        }
        loaded
    }

    /// Keep only targets the protocol reports as liquidatable, one
    /// multicall round trip per batch.
    async fn prefilter(
        &self,
        targets: Vec<Target>,
        prices: &PriceTable,
        report: &mut CycleReport,
    ) -> Vec<Target> {
        let mut kept = Vec::new();
        for chunk in targets.chunks(self.config.bulk_batch_size.max(1)) {
            let batch: Vec<(PositionRef, MarketMetadata)> = chunk
                .iter()
                .map(|t| (t.position.clone(), t.market.clone()))
                .collect();

            let verdicts = match self.protocol.scan_batch(&batch, prices).await {
                Ok(verdicts) => verdicts,
                Err(e) => {
                    warn!(batch = chunk.len(), error = %e, "Batch scan failed, skipping batch");
                    report.skipped += chunk.len();
                    continue;
                }
            };

            for (target, verdict) in chunk.iter().zip(verdicts) {
                match verdict {
                    Ok(v) if v.liquidatable => kept.push(target.clone()),
                    Ok(_) => {
                        report.record(PositionStage::VerifiedHealthy);
                        if target.index_flagged {
                            warn!(
                                account = %target.position.account(),
                                "Index flags position as liquidatable but chain reports healthy"
                            );
                            report.mismatches += 1;
                        }
                    }
                    Err(e) => {
                        debug!(account = %target.position.account(), error = %e, "Batched read failed");
                        report.skipped += 1;
                    }
                }
            }
        }
        debug!(liquidatable = kept.len(), "Bulk pre-filter complete");
        kept
    }

    /// Re-read one position on chain and plan its liquidation.
    async fn verify(&self, target: Target, prices: &PriceTable, costs: &CostInputs) -> Verification {
        let Target {
            position,
            market,
            index_flagged,
        } = target;
        let account = position.account();

        let raw = match self
            .retry
            .retry(
                "fetch_position",
                || self.protocol.fetch_position(&position, &market),
                ChainError::is_transient,
            )
            .await
        {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!(account = %account, "Position no longer exists");
                return Verification::Skipped;
            }
            Err(e) => {
                warn!(account = %account, error = %e, "Position read failed, skipping this cycle");
                return Verification::Skipped;
            }
        };

        let metrics = match evaluate(&raw, prices, &ProtocolParams::from_market(&market)) {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!(account = %account, error = %e, "Cannot evaluate position");
                return Verification::Skipped;
            }
        };

        let verdict = match self
            .retry
            .retry(
                "check_liquidatable",
                || self.protocol.check_liquidatable(&position, &market, prices),
                ChainError::is_transient,
            )
            .await
        {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(account = %account, error = %e, "Liquidatability read failed, skipping this cycle");
                return Verification::Skipped;
            }
        };

        if !verdict.liquidatable {
            if index_flagged {
                warn!(
                    account = %account,
                    hf = metrics.health_factor,
                    "Index flags position as liquidatable but chain reports healthy"
                );
            }
            return Verification::Healthy {
                mismatch: index_flagged,
            };
        }

        if !metrics.is_liquidatable() {
            debug!(
                account = %account,
                hf = metrics.health_factor,
                "Protocol reports liquidatable above local health factor 1.0"
            );
        }

        match plan_liquidation(&raw, &market, prices, &metrics, costs) {
            Ok(plan) => {
                let candidate = LiquidationCandidate::new(
                    position,
                    raw,
                    market,
                    metrics,
                    plan,
                    costs.native_price_usd,
                    index_flagged,
                );
                info!(
                    account = %account,
                    key = %candidate.key,
                    hf = candidate.metrics.health_factor,
                    size_usd = candidate.size_usd,
                    profit = %candidate.profit,
                    "Liquidatable position verified"
                );
                Verification::Liquidatable(Box::new(candidate))
            }
            Err(e) => {
                warn!(account = %account, error = %e, "Cannot plan liquidation");
                Verification::Skipped
            }
        }
    }

    /// Risk pipeline, then execution when enabled.
    async fn dispatch(&self, candidates: Vec<LiquidationCandidate>, report: &mut CycleReport) {
        let mut approved = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let validation = self.risk.validate(&candidate, self.mode).await;
            if validation.can_proceed {
                approved.push(candidate);
            } else {
                info!(
                    account = %candidate.account(),
                    failed = %validation.failure_summary(),
                    "Candidate rejected by risk checks"
                );
                report.rejected += 1;
            }
        }

        if approved.is_empty() {
            return;
        }
        if !self.execution_enabled {
            for candidate in &approved {
                info!(
                    account = %candidate.account(),
                    profit = %candidate.profit,
                    "Execution disabled, observation only"
                );
            }
            return;
        }

        for result in self.executor.execute_batch(&approved).await {
            report.record(PositionStage::ExecutionAttempted);
            report.realized_pnl_usd += result.profit_usd;
            if result.success {
                report.record(PositionStage::Succeeded);
            } else {
                report.record(PositionStage::Failed);
            }
        }
    }
}

/// Drive `cycle` every `period` until `shutdown` becomes true.
///
/// A failed cycle is logged and the loop carries on at the next tick.
/// In-flight cycles are not cancelled on shutdown.
pub async fn run_schedule<F, Fut>(
    period: Duration,
    overlap: CycleOverlap,
    mut shutdown: watch::Receiver<bool>,
    mut cycle: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<CycleReport>> + Send + 'static,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        }

        match overlap {
            CycleOverlap::NoOverlap => log_cycle(cycle().await),
            CycleOverlap::Concurrent => {
                let fut = cycle();
                tokio::spawn(async move { log_cycle(fut.await) });
            }
        }
    }
}

fn log_cycle(outcome: Result<CycleReport>) {
    if let Err(e) = outcome {
        error!(error = %format!("{e:#}"), "Cycle failed, retrying next tick");
    }
}
