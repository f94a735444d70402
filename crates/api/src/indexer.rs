//! Off-chain position indexer client.
//!
//! The indexer serves a paginated view of open positions with advisory
//! health data. It can lag the chain, so nothing it reports is acted on
//! without an on-chain re-read.

use crate::error::{ApiError, ApiResult};
use alloy::primitives::Address;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// A position as reported by the indexer.
///
/// Margin positions carry market, collateral token and direction; lending
/// accounts leave them empty.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedPosition {
    pub account: Address,
    #[serde(default)]
    pub market: Option<Address>,
    #[serde(default)]
    pub collateral_token: Option<Address>,
    #[serde(default)]
    pub is_long: Option<bool>,
    /// Notional size (margin) or total debt (lending), USD
    #[serde(default, deserialize_with = "deserialize_f64_from_any")]
    pub size_usd: f64,
    #[serde(default, deserialize_with = "deserialize_f64_from_any")]
    pub collateral_usd: f64,
    #[serde(default, deserialize_with = "deserialize_opt_f64_from_any")]
    pub health_factor: Option<f64>,
    /// Indexer's own liquidatable flag (advisory)
    #[serde(default)]
    pub is_liquidatable: bool,
}

/// Paginated response envelope.
#[derive(Debug, Deserialize)]
struct PositionsPage {
    count: u32,
    results: Vec<IndexedPosition>,
}

/// Source of candidate positions.
#[async_trait]
pub trait PositionIndex: Send + Sync {
    /// Positions at or below `hf_max`, most at-risk first.
    async fn fetch_candidates(&self, hf_max: f64, limit: usize) -> ApiResult<Vec<IndexedPosition>>;

    /// Every open position, for bulk scans.
    async fn fetch_all(&self) -> ApiResult<Vec<IndexedPosition>>;
}

/// REST client for the position indexer.
#[derive(Debug, Clone)]
pub struct IndexerClient {
    client: reqwest::Client,
    base_url: String,
    page_size: usize,
}

impl IndexerClient {
    /// Create a new indexer client.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> ApiResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            page_size: 500,
        })
    }

    /// Set the page size used when paging through all positions.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    async fn fetch_page(&self, query: &[(&str, String)]) -> ApiResult<PositionsPage> {
        let url = format!("{}/positions/", self.base_url);
        let response = self.client.get(&url).query(query).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

/// Stop paging once everything advertised has arrived or a short page shows up.
fn has_more(fetched_so_far: usize, advertised: u32, last_page_len: usize, page_size: usize) -> bool {
    fetched_so_far < advertised as usize && last_page_len >= page_size
}

#[async_trait]
impl PositionIndex for IndexerClient {
    #[instrument(skip(self))]
    async fn fetch_candidates(&self, hf_max: f64, limit: usize) -> ApiResult<Vec<IndexedPosition>> {
        let page = self
            .fetch_page(&[
                ("health_factor_max", hf_max.to_string()),
                ("order", "health_factor".to_string()),
                ("p", "1".to_string()),
                ("p_size", limit.to_string()),
            ])
            .await?;

        let positions: Vec<IndexedPosition> = page
            .results
            .into_iter()
            .filter(|p| p.health_factor.map_or(true, |hf| hf <= hf_max))
            .take(limit)
            .collect();

        info!(
            total_available = page.count,
            returned = positions.len(),
            hf_max = hf_max,
            "Fetched indexed candidates"
        );

        Ok(positions)
    }

    #[instrument(skip(self))]
    async fn fetch_all(&self) -> ApiResult<Vec<IndexedPosition>> {
        let mut all = Vec::new();
        let mut page_no = 1usize;

        loop {
            let page = self
                .fetch_page(&[
                    ("p", page_no.to_string()),
                    ("p_size", self.page_size.to_string()),
                ])
                .await?;

            let fetched = page.results.len();
            all.extend(page.results);

            debug!(
                page = page_no,
                fetched = fetched,
                total_so_far = all.len(),
                "Fetched positions page"
            );

            if !has_more(all.len(), page.count, fetched, self.page_size) {
                break;
            }
            page_no += 1;
        }

        info!(total = all.len(), "Fetched all indexed positions");
        Ok(all)
    }
}

/// Accept numbers or numeric strings.
fn deserialize_f64_from_any<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(deserialize_opt_f64_from_any(deserializer)?.unwrap_or(0.0))
}

fn deserialize_opt_f64_from_any<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrString {
        Num(f64),
        Str(String),
    }

    match Option::<NumOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumOrString::Num(n)) => Ok(Some(n)),
        Some(NumOrString::Str(s)) => s
            .parse::<f64>()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_margin_position() {
        let json = r#"{
            "count": 1,
            "results": [{
                "account": "0x1111111111111111111111111111111111111111",
                "market": "0x2222222222222222222222222222222222222222",
                "collateralToken": "0x3333333333333333333333333333333333333333",
                "isLong": false,
                "sizeUsd": "25000.5",
                "collateralUsd": 1200,
                "healthFactor": "0.97",
                "isLiquidatable": true
            }]
        }"#;

        let page: PositionsPage = serde_json::from_str(json).unwrap();
        let p = &page.results[0];
        assert_eq!(p.is_long, Some(false));
        assert_eq!(p.size_usd, 25000.5);
        assert_eq!(p.collateral_usd, 1200.0);
        assert_eq!(p.health_factor, Some(0.97));
        assert!(p.is_liquidatable);
    }

    #[test]
    fn test_parse_lending_account_defaults() {
        let json = r#"{
            "count": 1,
            "results": [{ "account": "0x1111111111111111111111111111111111111111", "sizeUsd": 10 }]
        }"#;

        let page: PositionsPage = serde_json::from_str(json).unwrap();
        let p = &page.results[0];
        assert!(p.market.is_none());
        assert!(p.health_factor.is_none());
        assert!(!p.is_liquidatable);
    }

    #[test]
    fn test_rejects_garbage_number() {
        let json = r#"{"count":1,"results":[{"account":"0x1111111111111111111111111111111111111111","sizeUsd":"lots"}]}"#;
        assert!(serde_json::from_str::<PositionsPage>(json).is_err());
    }

    #[test]
    fn test_has_more() {
        assert!(has_more(500, 1200, 500, 500));
        assert!(!has_more(1200, 1200, 200, 500));
        // Short page ends even if the count says otherwise
        assert!(!has_more(700, 1200, 200, 500));
    }

    #[tokio::test]
    #[ignore] // Requires network
    async fn test_fetch_candidates() {
        let client = IndexerClient::new("http://localhost:4000", Duration::from_secs(5)).unwrap();
        let result = client.fetch_candidates(1.1, 10).await;
        assert!(result.is_ok());
    }
}
