//! Short-TTL token price cache.
//!
//! Prices are refreshed once per cycle from a [`PriceSource`]; reads only
//! return entries younger than the TTL.

use alloy::primitives::Address;
use async_trait::async_trait;
use dashmap::DashMap;
use liquidation_engine_api::{ApiError, PriceFeedClient};
use liquidation_engine_chain::{ChainError, LiquidationProtocol, PriceTable, TokenPrice};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

#[derive(Debug, Error)]
pub enum PriceError {
    #[error("price feed: {0}")]
    Api(#[from] ApiError),

    #[error("price oracle: {0}")]
    Chain(#[from] ChainError),

    #[error("price source returned no prices")]
    Empty,
}

/// Where prices come from.
#[async_trait]
pub trait PriceSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Prices for `tokens`; an empty slice means "everything you have".
    async fn fetch(&self, tokens: &[Address]) -> Result<PriceTable, PriceError>;
}

/// `{min, max}` tickers from the off-chain price feed.
pub struct FeedPriceSource {
    client: PriceFeedClient,
}

impl FeedPriceSource {
    pub fn new(client: PriceFeedClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PriceSource for FeedPriceSource {
    fn name(&self) -> &'static str {
        "price-feed"
    }

    async fn fetch(&self, tokens: &[Address]) -> Result<PriceTable, PriceError> {
        let tickers = self.client.fetch_tickers().await?;
        Ok(tickers
            .into_iter()
            .filter(|t| tokens.is_empty() || tokens.contains(&t.token))
            .map(|t| (t.token, TokenPrice { min: t.min, max: t.max }))
            .collect())
    }
}

/// Prices read from the protocol's own oracle.
pub struct OraclePriceSource {
    protocol: Arc<dyn LiquidationProtocol>,
}

impl OraclePriceSource {
    pub fn new(protocol: Arc<dyn LiquidationProtocol>) -> Self {
        Self { protocol }
    }
}

#[async_trait]
impl PriceSource for OraclePriceSource {
    fn name(&self) -> &'static str {
        "protocol-oracle"
    }

    async fn fetch(&self, tokens: &[Address]) -> Result<PriceTable, PriceError> {
        Ok(self.protocol.oracle_prices(tokens).await?)
    }
}

/// TTL cache in front of a [`PriceSource`].
pub struct PriceCache {
    source: Arc<dyn PriceSource>,
    ttl: Duration,
    entries: DashMap<Address, (TokenPrice, Instant)>,
}

impl PriceCache {
    pub fn new(source: Arc<dyn PriceSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            entries: DashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fetch from the source and replace cached entries.
    ///
    /// Fails when the source errors or returns nothing for a non-empty request.
    #[instrument(skip(self, tokens), fields(source = self.source.name(), requested = tokens.len()))]
    pub async fn refresh(&self, tokens: &[Address]) -> Result<usize, PriceError> {
        let table = self.source.fetch(tokens).await?;
        if table.is_empty() {
            return Err(PriceError::Empty);
        }

        let now = Instant::now();
        for (token, price) in table.iter() {
            self.entries.insert(*token, (*price, now));
        }

        let missing = tokens.iter().filter(|t| table.get(t).is_none()).count();
        if missing > 0 {
            warn!(missing = missing, "Price source did not return every requested token");
        }
        debug!(prices = table.len(), "Price cache refreshed");
        Ok(table.len())
    }

    /// Fresh price for one token.
    pub fn get(&self, token: &Address) -> Option<TokenPrice> {
        let entry = self.entries.get(token)?;
        let (price, at) = *entry;
        (at.elapsed() <= self.ttl).then_some(price)
    }

    /// All fresh prices.
    pub fn table(&self) -> PriceTable {
        self.entries
            .iter()
            .filter(|e| e.value().1.elapsed() <= self.ttl)
            .map(|e| (*e.key(), e.value().0))
            .collect()
    }

    /// Fresh prices, refreshing first when any requested token is stale.
    pub async fn snapshot(&self, tokens: &[Address]) -> Result<PriceTable, PriceError> {
        if tokens.iter().any(|t| self.get(t).is_none()) {
            self.refresh(tokens).await?;
        }
        Ok(self.table())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
