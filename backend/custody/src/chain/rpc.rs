//! JSON-RPC relayer gateway.
//!
//! ## Resilience
//!
//! * Exponential back-off is applied when the relayer is unreachable or
//!   rate-limits us, up to [`MAX_BACKOFF_SECS`] seconds and [`MAX_ATTEMPTS`]
//!   tries, after which the call fails with `ChainUnavailable`.
//! * `relay_sendTransaction` carries one idempotency key across its retries, so
//!   a resend after a dropped response never broadcasts a second transaction.
//! * JSON-RPC error codes are mapped onto [`ChainError`]: malformed requests
//!   are `InvalidParameters`, execution reverts are `Reverted`, anything else
//!   is retried.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ChainGateway, ChainResult, DecodedEvent, RawLog, TxReceipt};
use crate::errors::ChainError;

const MAX_BACKOFF_SECS: u64 = 30;
const INITIAL_BACKOFF_SECS: u64 = 2;
const MAX_ATTEMPTS: u32 = 4;

// ─────────────────────────────────────────────────────────
// JSON-RPC response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RpcReceipt {
    #[serde(rename = "transactionHash")]
    transaction_hash: String,
    /// `"0x1"` on success, `"0x0"` on revert.
    status: String,
    #[serde(rename = "revertReason", default)]
    revert_reason: Option<String>,
    #[serde(default)]
    events: Vec<DecodedEvent>,
    #[serde(default)]
    logs: Vec<RawLog>,
}

impl From<RpcReceipt> for TxReceipt {
    fn from(r: RpcReceipt) -> Self {
        TxReceipt {
            success: r.status == "0x1" || r.status == "1",
            tx_hash: r.transaction_hash,
            revert_reason: r.revert_reason,
            events: r.events,
            logs: r.logs,
        }
    }
}

/// What to do with a JSON-RPC error object.
#[derive(Debug, PartialEq, Eq)]
enum ErrorClass {
    Fatal(ChainError),
    Retry,
}

fn classify(err: &RpcError) -> ErrorClass {
    match err.code {
        // Invalid request / method not found / invalid params
        -32600 | -32601 | -32602 => ErrorClass::Fatal(ChainError::InvalidParameters(format!(
            "RPC error {}: {}",
            err.code, err.message
        ))),
        // Execution reverted
        3 => ErrorClass::Fatal(ChainError::Reverted {
            reason: revert_reason(err),
        }),
        -32000 if err.message.to_ascii_lowercase().contains("revert") => {
            ErrorClass::Fatal(ChainError::Reverted {
                reason: revert_reason(err),
            })
        }
        _ => ErrorClass::Retry,
    }
}

fn revert_reason(err: &RpcError) -> String {
    err.data
        .as_ref()
        .and_then(|d| d.get("reason").and_then(Value::as_str).or_else(|| d.as_str()))
        .map(String::from)
        .unwrap_or_else(|| err.message.clone())
}

// ─────────────────────────────────────────────────────────
// Gateway
// ─────────────────────────────────────────────────────────

pub struct RelayerGateway {
    client: Client,
    rpc_url: String,
    /// Address the relayer signs for.
    from: String,
}

impl RelayerGateway {
    pub fn new(client: Client, rpc_url: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            client,
            rpc_url: rpc_url.into(),
            from: from.into(),
        }
    }

    async fn request(&self, method: &str, params: Value) -> ChainResult<Value> {
        let mut backoff = INITIAL_BACKOFF_SECS;
        let mut attempt = 0;

        loop {
            attempt += 1;
            if attempt > 1 {
                tokio::time::sleep(Duration::from_secs(backoff)).await;
                backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
            }

            let response = self
                .client
                .post(&self.rpc_url)
                .json(&json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "method": method,
                    "params": params,
                }))
                .send()
                .await;

            let last_error = match response {
                Err(e) => format!("{method} request failed: {e}"),
                Ok(resp) if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS => {
                    format!("{method} rate-limited by relayer")
                }
                Ok(resp) if resp.status().is_server_error() => {
                    format!("{method} relayer returned {}", resp.status())
                }
                Ok(resp) => {
                    let body: RpcResponse = resp.json().await.map_err(|e| {
                        ChainError::ChainUnavailable(format!("{method} bad response body: {e}"))
                    })?;

                    match body.error {
                        Some(err) => match classify(&err) {
                            ErrorClass::Fatal(e) => return Err(e),
                            ErrorClass::Retry => {
                                format!("{method} soft error {}: {}", err.code, err.message)
                            }
                        },
                        None => {
                            debug!(method, attempt, "Relayer call succeeded");
                            return Ok(body.result.unwrap_or(Value::Null));
                        }
                    }
                }
            };

            if attempt >= MAX_ATTEMPTS {
                return Err(ChainError::ChainUnavailable(last_error));
            }
            warn!("{last_error} (will retry in {backoff}s)");
        }
    }
}

#[async_trait]
impl ChainGateway for RelayerGateway {
    async fn call(&self, to: &str, method: &str, args: Vec<Value>) -> ChainResult<Value> {
        self.request(
            "relay_call",
            json!([{ "to": to, "method": method, "args": args }]),
        )
        .await
    }

    async fn send(&self, to: &str, method: &str, args: Vec<Value>) -> ChainResult<String> {
        let idempotency_key = Uuid::new_v4().to_string();
        let result = self
            .request(
                "relay_sendTransaction",
                json!([{
                    "from": self.from,
                    "to": to,
                    "method": method,
                    "args": args,
                    "idempotencyKey": idempotency_key,
                }]),
            )
            .await?;
        result
            .as_str()
            .map(String::from)
            .ok_or_else(|| ChainError::ChainUnavailable(format!("{method}: relayer returned no tx hash")))
    }

    async fn receipt(&self, tx_hash: &str) -> ChainResult<Option<TxReceipt>> {
        let result = self
            .request("eth_getTransactionReceipt", json!([tx_hash]))
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        let receipt: RpcReceipt = serde_json::from_value(result)
            .map_err(|e| ChainError::ChainUnavailable(format!("malformed receipt for {tx_hash}: {e}")))?;
        Ok(Some(receipt.into()))
    }

    async fn has_code(&self, address: &str) -> ChainResult<bool> {
        let code = self
            .request("eth_getCode", json!([address, "latest"]))
            .await?;
        Ok(code.as_str().map(|c| c != "0x" && !c.is_empty()).unwrap_or(false))
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn rpc_error(code: i64, message: &str, data: Option<Value>) -> RpcError {
        RpcError {
            code,
            message: message.to_string(),
            data,
        }
    }

    #[test]
    fn malformed_requests_are_fatal() {
        for code in [-32600, -32601, -32602] {
            assert!(matches!(
                classify(&rpc_error(code, "bad", None)),
                ErrorClass::Fatal(ChainError::InvalidParameters(_))
            ));
        }
    }

    #[test]
    fn reverts_carry_decoded_reason() {
        let err = rpc_error(
            3,
            "execution reverted",
            Some(json!({ "reason": "Pausable: paused" })),
        );
        assert_eq!(
            classify(&err),
            ErrorClass::Fatal(ChainError::Reverted {
                reason: "Pausable: paused".into()
            })
        );

        let err = rpc_error(-32000, "execution reverted: Escrow: not funded", None);
        assert_eq!(
            classify(&err),
            ErrorClass::Fatal(ChainError::Reverted {
                reason: "execution reverted: Escrow: not funded".into()
            })
        );
    }

    #[test]
    fn node_hiccups_are_retried() {
        assert_eq!(classify(&rpc_error(-32000, "header not found", None)), ErrorClass::Retry);
        assert_eq!(classify(&rpc_error(-32005, "limit exceeded", None)), ErrorClass::Retry);
    }

    #[test]
    fn receipt_json_decodes_events_and_logs() {
        let raw = json!({
            "transactionHash": "0xabc",
            "status": "0x1",
            "events": [{ "event": "EscrowCreated", "args": { "escrowId": "12" } }],
            "logs": [{ "address": "0xEscrow", "topics": ["0x01", "0x02"], "data": "0x" }]
        });
        let receipt: TxReceipt = serde_json::from_value::<RpcReceipt>(raw).unwrap().into();
        assert!(receipt.success);
        assert_eq!(receipt.tx_hash, "0xabc");
        assert_eq!(receipt.events[0].name, "EscrowCreated");
        assert_eq!(receipt.logs[0].topics.len(), 2);
    }

    #[test]
    fn failed_receipt_keeps_reason() {
        let raw = json!({
            "transactionHash": "0xdef",
            "status": "0x0",
            "revertReason": "Escrow: deadline not reached"
        });
        let receipt: TxReceipt = serde_json::from_value::<RpcReceipt>(raw).unwrap().into();
        assert!(!receipt.success);
        assert_eq!(receipt.revert_reason.as_deref(), Some("Escrow: deadline not reached"));
        assert!(receipt.logs.is_empty());
    }
}
