//! Chain-layer error type.
//!
//! Every RPC-facing call returns [`ChainError`]. Timeouts and transport
//! failures are transient (retry the candidate on a later attempt); reverts
//! are definitive for that attempt.

use alloy::primitives::B256;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    /// The call did not complete within its deadline.
    #[error("{op} timed out after {}ms", after.as_millis())]
    Timeout { op: &'static str, after: Duration },

    /// Transport-level or node-side failure (connection refused, 429, 5xx).
    #[error("rpc error during {op}: {message}")]
    Rpc { op: &'static str, message: String },

    /// A view call or gas estimation reverted.
    #[error("call reverted during {op}: {message}")]
    CallReverted { op: &'static str, message: String },

    /// A mined transaction reverted.
    #[error("transaction {tx_hash} reverted")]
    Reverted { tx_hash: B256 },

    /// No receipt was found for a broadcast transaction.
    #[error("no receipt for transaction {tx_hash}")]
    ReceiptMissing { tx_hash: B256 },

    /// The private relay rejected or failed to accept the transaction.
    #[error("private relay error: {0}")]
    Relay(String),

    /// Response data could not be decoded.
    #[error("decode error during {op}: {message}")]
    Decode { op: &'static str, message: String },

    /// Signing or transaction building failed.
    #[error("signer error: {0}")]
    Signer(String),

    /// Invalid local configuration (bad URL, missing address).
    #[error("configuration error: {0}")]
    Config(String),

    /// A call needed a price that was not supplied.
    #[error("no price for token {token}")]
    MissingPrice { token: alloy::primitives::Address },

    /// The protocol adapter cannot serve this request (wrong position kind).
    #[error("unsupported by protocol {protocol}: {message}")]
    Unsupported {
        protocol: &'static str,
        message: String,
    },
}

impl ChainError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Rpc { .. } | Self::Relay(_))
    }

    /// Classify an error message coming back from an alloy call.
    ///
    /// alloy surfaces reverts as JSON-RPC error payloads; the node wording
    /// varies, so the match is on the common substrings.
    pub fn from_call(op: &'static str, err: impl std::fmt::Display) -> Self {
        let message = err.to_string();
        let lower = message.to_lowercase();
        if lower.contains("revert") || lower.contains("execution reverted") {
            Self::CallReverted { op, message }
        } else {
            Self::Rpc { op, message }
        }
    }
}

pub type ChainResult<T> = Result<T, ChainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let timeout = ChainError::Timeout {
            op: "eth_call",
            after: Duration::from_secs(5),
        };
        assert!(timeout.is_transient());

        let reverted = ChainError::Reverted { tx_hash: B256::ZERO };
        assert!(!reverted.is_transient());
    }

    #[test]
    fn test_from_call_detects_revert() {
        let err = ChainError::from_call("getPosition", "server returned an error response: execution reverted: EmptyPosition");
        assert!(matches!(err, ChainError::CallReverted { .. }));

        let err = ChainError::from_call("getPosition", "HTTP error 429 Too Many Requests");
        assert!(matches!(err, ChainError::Rpc { .. }));
        assert!(err.is_transient());
    }
}
