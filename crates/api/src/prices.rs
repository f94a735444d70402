//! Price-feed API client.
//!
//! Returns `{min, max}` per token in USD·1e30 per smallest token unit, the
//! same scale the margin protocol's Reader expects.

use crate::error::{ApiError, ApiResult};
use alloy::primitives::{Address, U256};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Raw ticker as served by the API.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTicker {
    token_address: Address,
    #[serde(default)]
    token_symbol: String,
    min_price: String,
    max_price: String,
    #[serde(default)]
    updated_at: Option<u64>,
}

/// Token price band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceTicker {
    pub token: Address,
    pub symbol: String,
    pub min: U256,
    pub max: U256,
    /// Milliseconds since epoch, when the feed reports it
    pub updated_at: Option<u64>,
}

/// Price-feed client.
#[derive(Debug, Clone)]
pub struct PriceFeedClient {
    client: reqwest::Client,
    base_url: String,
}

impl PriceFeedClient {
    /// Create a new price-feed client.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> ApiResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Fetch all tickers.
    #[instrument(skip(self))]
    pub async fn fetch_tickers(&self) -> ApiResult<Vec<PriceTicker>> {
        let url = format!("{}/prices/tickers", self.base_url);
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await?;
        let tickers = parse_tickers(&body)?;
        debug!(tickers = tickers.len(), "Fetched price tickers");
        Ok(tickers)
    }
}

/// Parse a ticker list, dropping malformed or inverted entries.
pub fn parse_tickers(body: &str) -> ApiResult<Vec<PriceTicker>> {
    let raw: Vec<RawTicker> =
        serde_json::from_str(body).map_err(|e| ApiError::Decode(e.to_string()))?;

    Ok(raw
        .into_iter()
        .filter_map(|t| {
            let min = U256::from_str_radix(t.min_price.trim(), 10).ok();
            let max = U256::from_str_radix(t.max_price.trim(), 10).ok();
            match (min, max) {
                (Some(min), Some(max)) if min <= max && !max.is_zero() => Some(PriceTicker {
                    token: t.token_address,
                    symbol: t.token_symbol,
                    min,
                    max,
                    updated_at: t.updated_at,
                }),
                _ => {
                    warn!(
                        token = %t.token_address,
                        min = %t.min_price,
                        max = %t.max_price,
                        "Dropping malformed price ticker"
                    );
                    None
                }
            }
        })
        .collect())
}
