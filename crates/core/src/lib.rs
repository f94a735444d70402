//! Liquidation engine core logic.
//!
//! This crate provides the risk-gated liquidation engine:
//! - Position health calculator for margin and collateralized-debt positions
//! - Liquidation sizing and profit estimation
//! - Short-TTL price cache over the price feed or the protocol oracle
//! - Risk validation pipeline with persisted circuit breakers
//! - Execution service (private relay first, public fallback)
//! - Discovery and verification monitor with a configurable scheduler
//!
//! Every component receives its dependencies through its constructor; there
//! is no global state.

mod backoff;
pub mod config;
mod context;
mod executor;
mod health;
mod monitor;
mod position;
mod price_cache;
mod profit;
pub mod risk;
pub mod u256_math;

pub use backoff::Backoff;
pub use config::{ConfigError, EngineConfig};
pub use context::{market_tokens, ChainContext, ChainView, TxGateway};
pub use executor::{ExecutionService, LiquidationResult};
pub use health::{evaluate, HealthError, HealthMetrics, ProtocolParams};
pub use monitor::{run_schedule, CycleOverlap, Monitor, ScanMode};
pub use position::{CycleReport, LiquidationCandidate, PositionStage, RepayAsset};
pub use price_cache::{FeedPriceSource, OraclePriceSource, PriceCache, PriceError, PriceSource};
pub use profit::{plan_liquidation, CostInputs, LiquidationPlan, ProfitEstimate};
pub use risk::{
    DailyStats, EmergencyStopState, JsonStateStore, RiskCheckResult, RiskCheckType, RiskManager,
    RiskState, RiskValidationResult, StateStore,
};
