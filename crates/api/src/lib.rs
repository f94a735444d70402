//! HTTP clients for the liquidation engine's off-chain inputs.
//!
//! This crate provides:
//! - Position indexer: paginated candidate and full-universe listings
//! - Price feed: `{min, max}` token prices for margin markets

mod error;
mod indexer;
mod prices;

pub use error::{ApiError, ApiResult};
pub use indexer::{IndexedPosition, IndexerClient, PositionIndex};
pub use prices::{parse_tickers, PriceFeedClient, PriceTicker};
