//! Banking-rail client: deposit polling, fiat→token withdrawal to the bridge
//! wallet, token→fiat redemption and SPEI payout.
//!
//! Requests are authenticated with an HMAC-SHA256 over
//! `nonce + METHOD + path + body`, sent as
//! `Authorization: Bitso <key>:<nonce>:<signature>`.  Every money-moving POST
//! carries an `X-Idempotency-Key` derived from the payment and stage, so a
//! retried request is deduplicated by the rail.

use std::str::FromStr;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, info};

use crate::config::BankConfig;
use crate::errors::{CustodyError, Result};

type HmacSha256 = Hmac<Sha256>;

/// One entry of the rail's transaction listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankTransaction {
    pub id: String,
    pub kind: String,
    pub status: String,
    pub amount: Decimal,
    /// Receiving account (CLABE) for deposits.
    pub account_ref: String,
}

impl BankTransaction {
    pub fn is_settled_deposit(&self) -> bool {
        self.kind == "deposit" && matches!(self.status.as_str(), "complete" | "completed" | "settled")
    }
}

#[async_trait]
pub trait BankingRail: Send + Sync {
    async fn list_transactions(&self) -> Result<Vec<BankTransaction>>;

    /// Convert fiat balance to tokens and send them to `destination`.
    async fn withdraw(
        &self,
        amount: Decimal,
        asset: &str,
        destination: &str,
        idempotency_key: &str,
    ) -> Result<String>;

    /// Convert tokens back to fiat into a registered bank account.
    async fn redeem(&self, amount: Decimal, account: &str, idempotency_key: &str) -> Result<String>;

    async fn payout(
        &self,
        account: &str,
        amount: Decimal,
        memo: &str,
        idempotency_key: &str,
    ) -> Result<String>;
}

/// HTTP client for the Juno/Bitso mint-platform API.
pub struct JunoClient {
    http: Client,
    config: BankConfig,
}

impl JunoClient {
    pub fn new(http: Client, config: BankConfig) -> Self {
        Self { http, config }
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        idempotency_key: Option<&str>,
    ) -> Result<Value> {
        let body = match body {
            Some(v) => serde_json::to_string(&v)?,
            None => String::new(),
        };
        let nonce = chrono::Utc::now().timestamp_millis().to_string();
        let signature = sign_request(&self.config.api_secret, &nonce, method.as_str(), path, &body)?;

        let mut req = self
            .http
            .request(method.clone(), format!("{}{path}", self.config.api_url))
            .header("Content-Type", "application/json")
            .header(
                "Authorization",
                format!("Bitso {}:{nonce}:{signature}", self.config.api_key),
            );
        if let Some(key) = idempotency_key {
            req = req.header("X-Idempotency-Key", key);
        }
        if !body.is_empty() {
            req = req.body(body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| CustodyError::ExternalUnavailable(format!("{method} {path}: {e}")))?;
        let status = resp.status();
        let text = resp.text().await?;
        debug!(%method, path, %status, "Banking rail responded");

        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(CustodyError::ExternalUnavailable(format!(
                "{method} {path} returned {status}"
            )));
        }
        let envelope: Value = serde_json::from_str(&text)?;
        if !status.is_success() || envelope.get("success") == Some(&Value::Bool(false)) {
            let reason = envelope
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or(&text);
            return Err(CustodyError::Rejected(format!("{method} {path}: {reason}")));
        }
        Ok(envelope.get("payload").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl BankingRail for JunoClient {
    async fn list_transactions(&self) -> Result<Vec<BankTransaction>> {
        let payload = self
            .request(Method::GET, "/spei/v1/deposits", None, None)
            .await?;
        Ok(parse_deposits(&payload))
    }

    async fn withdraw(
        &self,
        amount: Decimal,
        asset: &str,
        destination: &str,
        idempotency_key: &str,
    ) -> Result<String> {
        let body = json!({
            "amount": amount_json(amount)?,
            "asset": asset,
            "blockchain": "ARBITRUM",
            "address": destination,
        });
        let payload = self
            .request(Method::POST, "/mint_platform/v1/withdrawals", Some(body), Some(idempotency_key))
            .await?;
        let reference = reference_of(&payload, "withdrawal")?;
        info!(%amount, %asset, %destination, %reference, "Bridge withdrawal accepted");
        Ok(reference)
    }

    async fn redeem(&self, amount: Decimal, account: &str, idempotency_key: &str) -> Result<String> {
        let body = json!({
            "amount": amount_json(amount)?,
            "destination_bank_account_id": account,
            "asset": "mxn",
        });
        let payload = self
            .request(Method::POST, "/mint_platform/v1/redemptions", Some(body), Some(idempotency_key))
            .await?;
        let reference = reference_of(&payload, "redemption")?;
        info!(%amount, %account, %reference, "Redemption accepted");
        Ok(reference)
    }

    async fn payout(
        &self,
        account: &str,
        amount: Decimal,
        memo: &str,
        idempotency_key: &str,
    ) -> Result<String> {
        let body = json!({
            "amount": amount_json(amount)?,
            "clabe": account,
            "notes_ref": memo,
            "origin_id": idempotency_key,
        });
        let payload = self
            .request(Method::POST, "/spei/v1/withdrawals", Some(body), Some(idempotency_key))
            .await?;
        let reference = reference_of(&payload, "payout")?;
        info!(%amount, %account, %reference, "Payout accepted");
        Ok(reference)
    }
}

// ─────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────

/// Hex HMAC-SHA256 of `nonce + method + path + body`.
pub fn sign_request(secret: &str, nonce: &str, method: &str, path: &str, body: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| CustodyError::Config(format!("bank API secret: {e}")))?;
    mac.update(nonce.as_bytes());
    mac.update(method.as_bytes());
    mac.update(path.as_bytes());
    mac.update(body.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// The rail expects a JSON number, not a string.
fn amount_json(amount: Decimal) -> Result<Value> {
    Ok(serde_json::from_str(&amount.normalize().to_string())?)
}

fn reference_of(payload: &Value, what: &str) -> Result<String> {
    ["id", "fid", "transaction_id"]
        .iter()
        .find_map(|k| match payload.get(*k) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
        .ok_or_else(|| CustodyError::Inconsistent(format!("{what} accepted without a reference")))
}

/// Deposits come back as `payload.response` (or a bare array); entries without
/// an id, amount or receiving account are skipped.
fn parse_deposits(payload: &Value) -> Vec<BankTransaction> {
    let rows = payload
        .get("response")
        .and_then(Value::as_array)
        .or_else(|| payload.as_array());
    let Some(rows) = rows else {
        return Vec::new();
    };

    rows.iter()
        .filter_map(|row| {
            let id = ["fid", "deposit_id", "id"]
                .iter()
                .find_map(|k| row.get(*k).and_then(scalar_string))?;
            let amount = row
                .get("amount")
                .and_then(scalar_string)
                .and_then(|s| Decimal::from_str(&s).ok())?;
            let account_ref = row
                .get("receiver_clabe")
                .or_else(|| row.get("clabe"))
                .and_then(Value::as_str)?
                .to_string();
            let status = row
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_ascii_lowercase();
            Some(BankTransaction {
                id,
                kind: "deposit".into(),
                status,
                amount,
                account_ref,
            })
        })
        .collect()
}

fn scalar_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn hmac_matches_reference_vectors() {
        assert_eq!(
            sign_request(
                "secret",
                "1700000000000",
                "POST",
                "/mint_platform/v1/withdrawals",
                r#"{"amount":100}"#
            )
            .unwrap(),
            "50ad3533745e98eedfe8c7cf07f51652d3983b2042aa553064ac8c99f5f679a5"
        );
        assert_eq!(
            sign_request("secret", "1700000000000", "GET", "/spei/v1/deposits", "").unwrap(),
            "371a72e5a772498eac44ed3f1b57877d10e6af88d9ad35918414b66683d4bd11"
        );
    }

    #[test]
    fn deposits_parse_from_nested_payload() {
        let payload = json!({
            "response": [
                { "fid": "f-1", "amount": "1500.00", "status": "complete", "receiver_clabe": "646180157000000001" },
                { "deposit_id": 77, "amount": 200, "status": "PENDING", "receiver_clabe": "646180157000000002" },
                { "fid": "f-3", "status": "complete" }
            ]
        });
        let deposits = parse_deposits(&payload);
        assert_eq!(deposits.len(), 2);
        assert_eq!(deposits[0].id, "f-1");
        assert_eq!(deposits[0].amount, dec!(1500));
        assert!(deposits[0].is_settled_deposit());
        assert_eq!(deposits[1].id, "77");
        assert_eq!(deposits[1].status, "pending");
        assert!(!deposits[1].is_settled_deposit());
    }

    #[test]
    fn unexpected_payload_yields_no_deposits() {
        assert!(parse_deposits(&json!({ "foo": 1 })).is_empty());
        assert!(parse_deposits(&Value::Null).is_empty());
    }

    #[test]
    fn amounts_are_sent_as_numbers() {
        assert_eq!(amount_json(dec!(1500.50)).unwrap(), json!(1500.5));
        assert_eq!(amount_json(dec!(200)).unwrap(), json!(200));
    }

    #[test]
    fn reference_required_on_acceptance() {
        assert_eq!(reference_of(&json!({ "id": "w-9" }), "withdrawal").unwrap(), "w-9");
        assert!(matches!(
            reference_of(&json!({}), "withdrawal"),
            Err(CustodyError::Inconsistent(_))
        ));
    }
}
