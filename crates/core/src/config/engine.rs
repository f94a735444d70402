//! Configuration management with profile support.
//!
//! Provides one configuration document for every engine parameter with
//! support for different profiles (testing, production, aggressive).

use super::{expand_env, ConfigError};
use crate::backoff::Backoff;
use crate::monitor::{CycleOverlap, ScanMode};
use alloy::primitives::{Address, U256};
use anyhow::Context;
use liquidation_engine_chain::gas::GasPricing;
use liquidation_engine_chain::{
    ExecutionMode, LendingConfig, MarginConfig, ProtocolKind, DEFAULT_RELAY_METHOD,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure containing all engine parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Profile name (for logging/identification)
    #[serde(default = "default_profile_name")]
    pub profile: String,

    /// Risk gates and persisted state location
    #[serde(default)]
    pub risk: RiskConfig,

    /// Transaction building and confirmation
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Private relay submission
    #[serde(default)]
    pub relay: RelayConfig,

    /// Backoff for transient RPC failures
    #[serde(default)]
    pub retry: Backoff,

    /// Discovery loop
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Target protocol
    #[serde(default)]
    pub protocol: ProtocolConfig,
}

fn default_profile_name() -> String {
    "default".to_string()
}

/// Risk gate thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Positions below this size are not worth the gas
    #[serde(default = "default_min_position_size")]
    pub min_position_size_usd: f64,

    /// Capital/risk ceiling per position
    #[serde(default = "default_max_position_size")]
    pub max_position_size_usd: f64,

    #[serde(default = "default_min_profit")]
    pub min_profit_usd: f64,

    /// Inclusive ceiling on the network gas price
    #[serde(default = "default_max_gas_price_gwei")]
    pub max_gas_price_gwei: f64,

    /// Realized loss per UTC day that latches the emergency stop
    #[serde(default = "default_daily_loss_limit")]
    pub daily_loss_limit_usd: f64,

    /// When non-empty, only these tokens may be repaid or seized
    #[serde(default)]
    pub token_whitelist: Vec<Address>,

    #[serde(default)]
    pub token_blacklist: Vec<Address>,

    /// Directory holding daily stats and the EMERGENCY_STOP flag
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_min_position_size() -> f64 {
    100.0
}
fn default_max_position_size() -> f64 {
    250_000.0
}
fn default_min_profit() -> f64 {
    5.0
}
fn default_max_gas_price_gwei() -> f64 {
    5.0
}
fn default_daily_loss_limit() -> f64 {
    500.0
}
fn default_state_dir() -> PathBuf {
    PathBuf::from("./state")
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            min_position_size_usd: default_min_position_size(),
            max_position_size_usd: default_max_position_size(),
            min_profit_usd: default_min_profit(),
            max_gas_price_gwei: default_max_gas_price_gwei(),
            daily_loss_limit_usd: default_daily_loss_limit(),
            token_whitelist: Vec::new(),
            token_blacklist: Vec::new(),
            state_dir: default_state_dir(),
        }
    }
}

/// Liquidation execution parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Off = observation only
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub mode: ExecutionMode,

    #[serde(default = "default_confirmations")]
    pub confirmations: u64,

    #[serde(default = "default_confirmation_timeout")]
    pub confirmation_timeout_secs: u64,

    /// Pause after each successful liquidation
    #[serde(default = "default_cooldown")]
    pub cooldown_ms: u64,

    #[serde(default = "default_gas_limit_buffer")]
    pub gas_limit_buffer_bps: u32,

    #[serde(default = "default_gas_price_buffer")]
    pub gas_price_buffer_bps: u32,

    #[serde(default)]
    pub gas_pricing: GasPricing,

    #[serde(default = "default_priority_fee")]
    pub priority_fee_gwei: f64,

    /// Gas expected for the liquidation transaction (profit estimate)
    #[serde(default = "default_liquidation_gas")]
    pub liquidation_gas: u64,

    /// Gas the keeper is paid for on margin orders
    #[serde(default = "default_keeper_gas")]
    pub keeper_gas: u64,

    /// Margin liquidation fee on remaining collateral
    #[serde(default = "default_margin_fee_bps")]
    pub margin_fee_bps: u32,

    /// Swap slippage allowance in flash-loan mode
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: u32,
}

fn default_confirmations() -> u64 {
    1
}
fn default_confirmation_timeout() -> u64 {
    120
}
fn default_cooldown() -> u64 {
    3_000
}
fn default_gas_limit_buffer() -> u32 {
    2_000
}
fn default_gas_price_buffer() -> u32 {
    1_000
}
fn default_priority_fee() -> f64 {
    0.01
}
fn default_liquidation_gas() -> u64 {
    1_200_000
}
fn default_keeper_gas() -> u64 {
    3_000_000
}
fn default_margin_fee_bps() -> u32 {
    20
}
fn default_slippage_bps() -> u32 {
    50
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: ExecutionMode::default(),
            confirmations: default_confirmations(),
            confirmation_timeout_secs: default_confirmation_timeout(),
            cooldown_ms: default_cooldown(),
            gas_limit_buffer_bps: default_gas_limit_buffer(),
            gas_price_buffer_bps: default_gas_price_buffer(),
            gas_pricing: GasPricing::default(),
            priority_fee_gwei: default_priority_fee(),
            liquidation_gas: default_liquidation_gas(),
            keeper_gas: default_keeper_gas(),
            margin_fee_bps: default_margin_fee_bps(),
            slippage_bps: default_slippage_bps(),
        }
    }
}

impl ExecutionConfig {
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Private relay submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub endpoint: String,

    /// Usually `${RELAY_AUTH_TOKEN}`
    #[serde(default)]
    pub auth_token: Option<String>,

    #[serde(default = "default_relay_method")]
    pub method: String,

    /// Broadcast publicly when the relay fails or is disabled
    #[serde(default = "default_fallback")]
    pub fallback_to_public: bool,

    #[serde(default = "default_relay_timeout")]
    pub timeout_ms: u64,
}

fn default_relay_method() -> String {
    DEFAULT_RELAY_METHOD.to_string()
}
fn default_fallback() -> bool {
    true
}
fn default_relay_timeout() -> u64 {
    5_000
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            auth_token: None,
            method: default_relay_method(),
            fallback_to_public: default_fallback(),
            timeout_ms: default_relay_timeout(),
        }
    }
}

impl RelayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Discovery loop timing and limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub scan_mode: ScanMode,

    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    #[serde(default)]
    pub overlap: CycleOverlap,

    /// Positions verified in parallel
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Delay before each verification, to respect RPC rate limits
    #[serde(default = "default_item_delay")]
    pub item_delay_ms: u64,

    /// Index candidates at or below this health factor
    #[serde(default = "default_hf_max")]
    pub health_factor_max: f64,

    #[serde(default = "default_candidate_limit")]
    pub candidate_limit: usize,

    /// Accounts per Multicall3 round trip in bulk mode
    #[serde(default = "default_bulk_batch")]
    pub bulk_batch_size: usize,

    #[serde(default = "default_price_ttl")]
    pub price_ttl_secs: u64,

    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_ms: u64,

    #[serde(default)]
    pub indexer_url: String,

    #[serde(default = "default_page_size")]
    pub indexer_page_size: usize,

    /// Off-chain `{min, max}` feed; the protocol oracle is used when unset
    #[serde(default)]
    pub price_feed_url: Option<String>,

    #[serde(default = "default_http_timeout")]
    pub http_timeout_ms: u64,
}

fn default_interval() -> u64 {
    15
}
fn default_concurrency() -> usize {
    4
}
fn default_item_delay() -> u64 {
    100
}
fn default_hf_max() -> f64 {
    1.05
}
fn default_candidate_limit() -> usize {
    200
}
fn default_bulk_batch() -> usize {
    100
}
fn default_price_ttl() -> u64 {
    10
}
fn default_rpc_timeout() -> u64 {
    10_000
}
fn default_page_size() -> usize {
    500
}
fn default_http_timeout() -> u64 {
    15_000
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            scan_mode: ScanMode::default(),
            interval_secs: default_interval(),
            overlap: CycleOverlap::default(),
            concurrency: default_concurrency(),
            item_delay_ms: default_item_delay(),
            health_factor_max: default_hf_max(),
            candidate_limit: default_candidate_limit(),
            bulk_batch_size: default_bulk_batch(),
            price_ttl_secs: default_price_ttl(),
            rpc_timeout_ms: default_rpc_timeout(),
            indexer_url: String::new(),
            indexer_page_size: default_page_size(),
            price_feed_url: None,
            http_timeout_ms: default_http_timeout(),
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
    pub fn item_delay(&self) -> Duration {
        Duration::from_millis(self.item_delay_ms)
    }
    pub fn price_ttl(&self) -> Duration {
        Duration::from_secs(self.price_ttl_secs)
    }
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

/// Decimals for a synthetic index token without `decimals()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntheticToken {
    pub token: Address,
    pub decimals: u8,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarginAddresses {
    #[serde(default = "default_margin_id")]
    pub protocol_id: String,
    #[serde(default)]
    pub reader: Address,
    #[serde(default)]
    pub data_store: Address,
    #[serde(default)]
    pub referral_storage: Address,
    #[serde(default)]
    pub exchange_router: Address,
    #[serde(default)]
    pub order_vault: Address,
    #[serde(default)]
    pub callback_gas_limit: u64,
    #[serde(default)]
    pub synthetic_tokens: Vec<SyntheticToken>,
}

fn default_margin_id() -> String {
    "gmx-v2".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LendingAddresses {
    #[serde(default = "default_lending_id")]
    pub protocol_id: String,
    #[serde(default)]
    pub pool: Address,
    #[serde(default)]
    pub data_provider: Address,
    #[serde(default)]
    pub oracle: Address,
    /// Flash-loan liquidator contract
    #[serde(default)]
    pub liquidator: Option<Address>,
}

fn default_lending_id() -> String {
    "aave-v3".to_string()
}

/// Target protocol and its contracts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default = "default_kind")]
    pub kind: ProtocolKind,

    /// Wrapped native token, used to price gas
    #[serde(default)]
    pub native_token: Address,

    #[serde(default)]
    pub margin: MarginAddresses,

    #[serde(default)]
    pub lending: LendingAddresses,
}

fn default_kind() -> ProtocolKind {
    ProtocolKind::Lending
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            native_token: Address::ZERO,
            margin: MarginAddresses::default(),
            lending: LendingAddresses::default(),
        }
    }
}

impl ProtocolConfig {
    pub fn margin_config(&self) -> MarginConfig {
        MarginConfig {
            protocol_id: self.margin.protocol_id.clone(),
            reader: self.margin.reader,
            data_store: self.margin.data_store,
            referral_storage: self.margin.referral_storage,
            exchange_router: self.margin.exchange_router,
            order_vault: self.margin.order_vault,
            callback_gas_limit: U256::from(self.margin.callback_gas_limit),
            index_decimals: self
                .margin
                .synthetic_tokens
                .iter()
                .map(|s| (s.token, s.decimals))
                .collect(),
        }
    }

    pub fn lending_config(&self) -> LendingConfig {
        LendingConfig {
            protocol_id: self.lending.protocol_id.clone(),
            pool: self.lending.pool,
            data_provider: self.lending.data_provider,
            oracle: self.lending.oracle,
            liquidator: self.lending.liquidator,
        }
    }

    /// Market id used for lending positions (the pool).
    pub fn default_market(&self) -> Option<Address> {
        match self.kind {
            ProtocolKind::Lending => Some(self.lending.pool),
            ProtocolKind::Margin => None,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            profile: default_profile_name(),
            risk: RiskConfig::default(),
            execution: ExecutionConfig::default(),
            relay: RelayConfig::default(),
            retry: Backoff::default(),
            monitor: MonitorConfig::default(),
            protocol: ProtocolConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file, expanding `${VAR}` first.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("loading config {}", path.display()))
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let expanded = expand_env(content)?;
        let config: Self = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Create a testing profile: observation only, permissive thresholds.
    pub fn testing() -> Self {
        Self {
            profile: "testing".to_string(),
            risk: RiskConfig {
                min_position_size_usd: 1.0,
                max_position_size_usd: 10_000.0,
                min_profit_usd: 0.0, // No minimum profit for testing
                max_gas_price_gwei: 50.0,
                daily_loss_limit_usd: 50.0,
                ..Default::default()
            },
            execution: ExecutionConfig {
                enabled: false,
                cooldown_ms: 500,
                confirmation_timeout_secs: 30,
                ..Default::default()
            },
            relay: RelayConfig::default(),
            retry: Backoff {
                base_delay_ms: 50,
                max_delay_ms: 500,
                max_attempts: 3,
                jitter: 0.0,
            },
            monitor: MonitorConfig {
                interval_secs: 5,
                health_factor_max: 1.5, // Wider range
                candidate_limit: 500,
                item_delay_ms: 20,
                ..Default::default()
            },
            protocol: ProtocolConfig::default(),
        }
    }

    /// Create a production profile with conservative settings.
    pub fn production() -> Self {
        Self {
            profile: "production".to_string(),
            risk: RiskConfig {
                min_position_size_usd: 250.0,
                max_position_size_usd: 250_000.0,
                min_profit_usd: 10.0,
                max_gas_price_gwei: 5.0,
                daily_loss_limit_usd: 500.0,
                ..Default::default()
            },
            execution: ExecutionConfig {
                enabled: true,
                confirmations: 2,
                ..Default::default()
            },
            relay: RelayConfig::default(),
            retry: Backoff::default(),
            monitor: MonitorConfig::default(),
            protocol: ProtocolConfig::default(),
        }
    }

    /// Create an aggressive profile for maximum speed.
    pub fn aggressive() -> Self {
        Self {
            profile: "aggressive".to_string(),
            risk: RiskConfig {
                min_position_size_usd: 50.0,
                min_profit_usd: 1.0,
                max_gas_price_gwei: 20.0,
                daily_loss_limit_usd: 1_000.0,
                ..Default::default()
            },
            execution: ExecutionConfig {
                enabled: true,
                cooldown_ms: 1_000,
                gas_price_buffer_bps: 2_000, // Higher gas for priority
                ..Default::default()
            },
            relay: RelayConfig::default(),
            retry: Backoff {
                base_delay_ms: 100,
                max_delay_ms: 2_000,
                ..Default::default()
            },
            monitor: MonitorConfig {
                interval_secs: 5,
                concurrency: 8,
                item_delay_ms: 25,
                health_factor_max: 1.02,
                ..Default::default()
            },
            protocol: ProtocolConfig::default(),
        }
    }

    /// Select a configuration from the environment.
    ///
    /// `ENGINE_CONFIG` names a TOML file; otherwise `ENGINE_PROFILE` picks a
    /// built-in profile (testing, production, aggressive).
    pub fn from_env() -> anyhow::Result<Self> {
        if let Ok(path) = std::env::var("ENGINE_CONFIG") {
            return Self::from_file(path);
        }
        let profile = std::env::var("ENGINE_PROFILE").unwrap_or_else(|_| "default".to_string());
        let config = Self::profile(&profile);
        config.validate()?;
        Ok(config)
    }

    /// Built-in profile by name; unknown names fall back to the defaults.
    pub fn profile(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "testing" | "test" => Self::testing(),
            "production" | "prod" => Self::production(),
            "aggressive" | "aggro" => Self::aggressive(),
            _ => Self::default(),
        }
    }

    /// Reject inconsistent settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.risk.min_position_size_usd > self.risk.max_position_size_usd {
            return invalid("risk.min_position_size_usd exceeds risk.max_position_size_usd");
        }
        if self.risk.max_gas_price_gwei <= 0.0 {
            return invalid("risk.max_gas_price_gwei must be positive");
        }
        if self.risk.daily_loss_limit_usd < 0.0 {
            return invalid("risk.daily_loss_limit_usd must not be negative");
        }
        if let Some(token) = self
            .risk
            .token_whitelist
            .iter()
            .find(|t| self.risk.token_blacklist.contains(t))
        {
            return Err(ConfigError::Invalid(format!(
                "token {token} is both whitelisted and blacklisted"
            )));
        }
        if self.relay.enabled && self.relay.endpoint.trim().is_empty() {
            return invalid("relay.enabled requires relay.endpoint");
        }
        if self.execution.enabled && !self.relay.enabled && !self.relay.fallback_to_public {
            return invalid("execution enabled with neither relay nor public fallback");
        }
        if self.execution.confirmations == 0 {
            return invalid("execution.confirmations must be at least 1");
        }
        if self.monitor.concurrency == 0 || self.monitor.bulk_batch_size == 0 {
            return invalid("monitor.concurrency and monitor.bulk_batch_size must be at least 1");
        }
        if self.monitor.interval_secs == 0 {
            return invalid("monitor.interval_secs must be at least 1");
        }
        if self.retry.max_attempts == 0 || !(0.0..=1.0).contains(&self.retry.jitter) {
            return invalid("retry.max_attempts must be >= 1 and retry.jitter within [0, 1]");
        }
        Ok(())
    }

    /// Log the current configuration.
    pub fn log_config(&self) {
        tracing::info!(profile = %self.profile, "Engine configuration loaded");
        tracing::info!(
            min_size = self.risk.min_position_size_usd,
            max_size = self.risk.max_position_size_usd,
            min_profit = self.risk.min_profit_usd,
            max_gas_gwei = self.risk.max_gas_price_gwei,
            daily_loss_limit = self.risk.daily_loss_limit_usd,
            whitelist = self.risk.token_whitelist.len(),
            blacklist = self.risk.token_blacklist.len(),
            state_dir = %self.risk.state_dir.display(),
            "Risk limits"
        );
        tracing::info!(
            enabled = self.execution.enabled,
            mode = ?self.execution.mode,
            confirmations = self.execution.confirmations,
            cooldown_ms = self.execution.cooldown_ms,
            gas_pricing = ?self.execution.gas_pricing,
            "Execution parameters"
        );
        tracing::info!(
            enabled = self.relay.enabled,
            endpoint = %self.relay.endpoint,
            auth = self.relay.auth_token.is_some(),
            fallback_to_public = self.relay.fallback_to_public,
            "Private relay"
        );
        tracing::info!(
            scan_mode = ?self.monitor.scan_mode,
            interval_secs = self.monitor.interval_secs,
            overlap = ?self.monitor.overlap,
            concurrency = self.monitor.concurrency,
            hf_max = self.monitor.health_factor_max,
            protocol = self.protocol.kind.as_str(),
            "Monitor parameters"
        );
    }
}
