//! Risk-gated liquidation engine
//!
//! Monitors margin or lending positions and liquidates the ones the protocol
//! confirms as insolvent:
//! - Off-chain index discovery reconciled against on-chain reads
//! - Multi-stage risk pipeline with persisted circuit breakers
//! - Private relay submission with public fallback
//!
//! Environment:
//! - `PRIVATE_KEY`, `RPC_URL` (required), `SEND_RPC_URL`, `RELAY_AUTH_TOKEN`
//! - `ENGINE_CONFIG` (TOML path) or `ENGINE_PROFILE` (testing, production, aggressive)
//! - `ENGINE_MODE` (`monitor` or `bulk`), `LOG_FORMAT=json`

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use liquidation_engine_api::{IndexerClient, PriceFeedClient};
use liquidation_engine_chain::gas::create_gas_strategy;
use liquidation_engine_chain::{
    LendingProtocol, LiquidationProtocol, MarginProtocol, PrivateRelayClient, ProtocolKind,
    ProviderManager, TransactionSender,
};
use liquidation_engine_core::{
    ChainContext, ChainView, EngineConfig, ExecutionService, FeedPriceSource, JsonStateStore,
    Monitor, OraclePriceSource, PriceCache, PriceSource, RiskManager, RiskState, ScanMode,
    StateStore, TxGateway,
};

/// Environment variable names.
mod env {
    pub const PRIVATE_KEY: &str = "PRIVATE_KEY";
    pub const RPC_URL: &str = "RPC_URL";
    pub const SEND_RPC_URL: &str = "SEND_RPC_URL";
    pub const RELAY_AUTH_TOKEN: &str = "RELAY_AUTH_TOKEN";
    pub const ENGINE_MODE: &str = "ENGINE_MODE";
    pub const LOG_FORMAT: &str = "LOG_FORMAT";
}

/// Secrets taken from the environment, never from the config file.
struct Secrets {
    private_key: String,
    rpc_url: String,
    send_url: String,
    relay_auth_token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    init_tracing();

    // ENGINE_CONFIG (file) or ENGINE_PROFILE (built-in)
    let config = EngineConfig::from_env()?;
    config.log_config();

    let secrets = load_secrets()?;

    // Refuse to start while the breaker is latched
    let store: Arc<dyn StateStore> = Arc::new(
        JsonStateStore::open(config.risk.state_dir.clone()).context("opening risk state directory")?,
    );
    let stop = store.load_emergency_stop()?;
    if stop.is_active {
        bail!(
            "emergency stop active (reason: {}, by: {}); remove {} to resume",
            stop.reason.as_deref().unwrap_or("manual"),
            stop.activated_by.as_deref().unwrap_or("operator"),
            config.risk.state_dir.join(liquidation_engine_core::risk::EMERGENCY_STOP_FILE).display()
        );
    }

    let monitor = Arc::new(initialize_components(&config, &secrets, store).await?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received, finishing current cycle");
            let _ = shutdown_tx.send(true);
        }
    });

    match std::env::var(env::ENGINE_MODE).as_deref() {
        Ok("bulk") => {
            let report = monitor.bulk_scan().await?;
            info!(report = ?report, "Bulk scan complete");
        }
        Ok("monitor") | Err(_) => monitor.run(shutdown_rx).await,
        Ok(other) => bail!("unknown {}: {other} (expected monitor or bulk)", env::ENGINE_MODE),
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,liquidation_engine_core=debug,liquidation_engine_chain=debug")
    });
    let json = std::env::var(env::LOG_FORMAT).is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

fn load_secrets() -> Result<Secrets> {
    let get_env = |name: &str| -> Result<String> {
        std::env::var(name).map_err(|_| anyhow::anyhow!("Missing env var: {}", name))
    };

    let rpc_url = get_env(env::RPC_URL)?;
    Ok(Secrets {
        private_key: get_env(env::PRIVATE_KEY)?,
        send_url: get_env(env::SEND_RPC_URL).unwrap_or_else(|_| rpc_url.clone()),
        rpc_url,
        relay_auth_token: get_env(env::RELAY_AUTH_TOKEN).ok(),
    })
}

async fn initialize_components(
    config: &EngineConfig,
    secrets: &Secrets,
    store: Arc<dyn StateStore>,
) -> Result<Monitor> {
    info!("Initializing components...");

    // Provider manager
    let provider =
        ProviderManager::new(&secrets.rpc_url, &secrets.send_url, config.monitor.rpc_timeout())
            .await?;
    let chain_id = provider.chain_id().await?;

    // Protocol adapter
    let protocol: Arc<dyn LiquidationProtocol> = match config.protocol.kind {
        ProtocolKind::Margin => Arc::new(MarginProtocol::new(
            config.protocol.margin_config(),
            provider.clone(),
        )),
        ProtocolKind::Lending => Arc::new(LendingProtocol::new(
            config.protocol.lending_config(),
            provider.clone(),
        )),
    };
    info!(protocol = protocol.protocol_id(), chain_id = chain_id, "Protocol adapter ready");

    // Transaction sender
    let gas_strategy = create_gas_strategy(
        config.execution.gas_pricing,
        config.execution.priority_fee_gwei,
        config.risk.max_gas_price_gwei,
    );
    let sender =
        Arc::new(TransactionSender::new(&secrets.private_key, provider, chain_id, gas_strategy).await?);

    // Private relay
    let relay = if config.relay.enabled {
        let auth = secrets
            .relay_auth_token
            .clone()
            .or_else(|| config.relay.auth_token.clone());
        let client = PrivateRelayClient::new(config.relay.endpoint.as_str(), config.relay.timeout())?
            .with_auth_token(auth)
            .with_method(config.relay.method.as_str());
        info!(endpoint = %config.relay.endpoint, "Private relay enabled");
        Some(client)
    } else {
        if config.execution.enabled {
            warn!("Private relay disabled, liquidations go to the public mempool");
        }
        None
    };

    // Prices: off-chain feed when configured, protocol oracle otherwise
    let source: Arc<dyn PriceSource> = match &config.monitor.price_feed_url {
        Some(url) => Arc::new(FeedPriceSource::new(PriceFeedClient::new(
            url.as_str(),
            config.monitor.http_timeout(),
        )?)),
        None => Arc::new(OraclePriceSource::new(protocol.clone())),
    };
    let prices = Arc::new(PriceCache::new(source, config.monitor.price_ttl()));

    // Position index
    let index = Arc::new(
        IndexerClient::new(config.monitor.indexer_url.as_str(), config.monitor.http_timeout())?
            .with_page_size(config.monitor.indexer_page_size),
    );

    // Shared chain context
    let context = Arc::new(ChainContext::new(protocol.clone(), sender.clone(), relay, prices.clone()));
    let chain: Arc<dyn ChainView> = context.clone();
    let gateway: Arc<dyn TxGateway> = context;

    // Risk state and pipeline
    let state = Arc::new(RiskState::load(store)?);
    let risk = Arc::new(RiskManager::new(config.risk.clone(), state.clone(), chain.clone()));

    let executor = Arc::new(ExecutionService::new(config, gateway, chain.clone(), state));

    info!(
        address = %sender.address,
        execution_enabled = config.execution.enabled,
        mode = ?config.execution.mode,
        scan_mode = ?config.monitor.scan_mode,
        "All components initialized"
    );
    if config.monitor.scan_mode == ScanMode::Bulk {
        info!(batch = config.monitor.bulk_batch_size, "Bulk scan mode");
    }

    Ok(Monitor::new(config, protocol, index, prices, chain, risk, executor))
}
