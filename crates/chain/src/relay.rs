//! Private transaction relay client.
//!
//! Submits signed transactions to a JSON-RPC relay so they skip the public
//! mempool. The relay answers with the transaction hash on acceptance.

use crate::error::{ChainError, ChainResult};
use alloy::primitives::{Bytes, B256};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Method used by Flashbots-compatible relays.
pub const DEFAULT_RELAY_METHOD: &str = "eth_sendPrivateTransaction";

/// JSON-RPC envelope returned by the relay.
#[derive(Debug, Deserialize)]
struct RelayResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RelayRpcError>,
}

#[derive(Debug, Deserialize)]
struct RelayRpcError {
    #[serde(default)]
    code: i64,
    message: String,
}

#[derive(Debug, Serialize)]
struct RelayRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

/// Private relay client.
#[derive(Debug, Clone)]
pub struct PrivateRelayClient {
    client: reqwest::Client,
    endpoint: String,
    auth_token: Option<String>,
    method: String,
}

impl PrivateRelayClient {
    /// Create a new relay client.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> ChainResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChainError::Config(format!("relay client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            auth_token: None,
            method: DEFAULT_RELAY_METHOD.to_string(),
        })
    }

    /// Attach a bearer token.
    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token.filter(|t| !t.is_empty());
        self
    }

    /// Override the JSON-RPC method.
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    /// Relay endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn request_body(&self, raw: &Bytes) -> RelayRequest<'_> {
        let tx = format!("0x{}", hex::encode(raw));
        let params = if self.method == DEFAULT_RELAY_METHOD {
            json!([{ "tx": tx }])
        } else {
            json!([tx])
        };
        RelayRequest {
            jsonrpc: "2.0",
            id: 1,
            method: &self.method,
            params,
        }
    }

    /// Submit a signed transaction; returns the hash the relay accepted.
    #[instrument(skip(self, raw), fields(endpoint = %self.endpoint))]
    pub async fn send_raw(&self, raw: &Bytes) -> ChainResult<B256> {
        let mut request = self.client.post(&self.endpoint).json(&self.request_body(raw));
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ChainError::Relay(format!("request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ChainError::Relay(format!("unreadable response: {e}")))?;

        if !status.is_success() {
            return Err(ChainError::Relay(format!("HTTP {status}: {body}")));
        }

        let hash = parse_relay_response(&body)?;
        info!(tx_hash = %hash, "Transaction accepted by private relay");
        Ok(hash)
    }
}

fn parse_relay_response(body: &str) -> ChainResult<B256> {
    let parsed: RelayResponse = serde_json::from_str(body)
        .map_err(|e| ChainError::Relay(format!("malformed response: {e}")))?;

    if let Some(err) = parsed.error {
        return Err(ChainError::Relay(format!("{} (code {})", err.message, err.code)));
    }

    let result = parsed
        .result
        .ok_or_else(|| ChainError::Relay("response has neither result nor error".into()))?;

    debug!(result = %result, "Relay result");

    // Some relays return the bare hash, others wrap it
    let hash = match &result {
        Value::String(s) => s.as_str(),
        Value::Object(map) => map
            .get("txHash")
            .or_else(|| map.get("hash"))
            .and_then(Value::as_str)
            .ok_or_else(|| ChainError::Relay(format!("no hash in result {result}")))?,
        other => return Err(ChainError::Relay(format!("unexpected result {other}"))),
    };

    hash.parse::<B256>()
        .map_err(|e| ChainError::Relay(format!("invalid tx hash {hash}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "0x88df016429689c079f3b2f6ad39fa052532c56795b733da78a91ebe6a713944b";

    #[test]
    fn test_parse_plain_hash() {
        let body = format!(r#"{{"jsonrpc":"2.0","id":1,"result":"{HASH}"}}"#);
        let hash = parse_relay_response(&body).unwrap();
        assert_eq!(format!("{hash:?}"), HASH);
    }

    #[test]
    fn test_parse_wrapped_hash() {
        let body = format!(r#"{{"jsonrpc":"2.0","id":1,"result":{{"txHash":"{HASH}"}}}}"#);
        assert!(parse_relay_response(&body).is_ok());
    }

    #[test]
    fn test_parse_error_payload() {
        let body = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"nonce too low"}}"#;
        let err = parse_relay_response(body).unwrap_err();
        assert!(matches!(err, ChainError::Relay(ref m) if m.contains("nonce too low")));
    }

    #[test]
    fn test_request_body_shapes() {
        let raw = Bytes::from(vec![0x02, 0xf8]);
        let client = PrivateRelayClient::new("http://relay.local", Duration::from_secs(1)).unwrap();
        let body = serde_json::to_value(client.request_body(&raw)).unwrap();
        assert_eq!(body["method"], DEFAULT_RELAY_METHOD);
        assert_eq!(body["params"][0]["tx"], "0x02f8");

        let client = client.with_method("eth_sendRawTransaction");
        let body = serde_json::to_value(client.request_body(&raw)).unwrap();
        assert_eq!(body["params"][0], "0x02f8");
    }

    #[test]
    fn test_empty_token_ignored() {
        let client = PrivateRelayClient::new("http://relay.local", Duration::from_secs(1))
            .unwrap()
            .with_auth_token(Some(String::new()));
        assert!(client.auth_token.is_none());
    }
}
