//! Chain interaction layer for the liquidation engine.
//!
//! This crate provides:
//! - Provider management with per-call deadlines and Multicall3 batching
//! - Gas strategy abstraction (Legacy + EIP-1559)
//! - Nonce-managed transaction signing, public broadcast and confirmation
//! - Private relay submission
//! - Protocol adapters for margin (GMX-v2 style) and lending (AAVE V3) positions

mod error;
pub mod gas;
pub mod protocol;
mod provider;
mod relay;
mod signer;

pub use error::{ChainError, ChainResult};
pub use protocol::{
    AssetBalance, DebtMarket, DebtPositionState, ExecutionMode, LiquidationProtocol,
    LiquidationRequest, MarginMarket, MarginPositionState, MarketMetadata, OnchainVerdict,
    PositionRef, PriceTable, ProtocolKind, RawPosition, ReserveInfo, TokenPrice, WAD,
};
#[cfg(feature = "lending")]
pub use protocol::{LendingConfig, LendingProtocol};
#[cfg(feature = "margin")]
pub use protocol::{MarginConfig, MarginProtocol};
pub use provider::{BatchCall, ProviderManager, MULTICALL3_ADDRESS};
pub use relay::{PrivateRelayClient, DEFAULT_RELAY_METHOD};
pub use signer::{Confirmation, NonceManager, SignedTx, TransactionSender, TxCall};
