//! [`EscrowContract`] over a relayer [`ChainGateway`].
//!
//! * Token amounts cross the wire as base-unit integers.
//! * Every write waits for its receipt until `confirmation_timeout`; past that
//!   the call reports [`ChainError::Inconclusive`] and must not be re-sent
//!   blindly.
//! * The pause check before release is not atomic with the release itself, so
//!   a concurrent re-pause simply surfaces as a revert the caller retries.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{
    ChainGateway, ChainResult, CreateEscrowParams, CreatedEscrow, EscrowContract, OnChainEscrow,
    OnChainStatus, TxOutcome, TxReceipt,
};
use crate::config::{ChainConfig, ContractVariant};
use crate::errors::ChainError;
use crate::models::now_ts;

pub struct EscrowClient {
    gateway: Arc<dyn ChainGateway>,
    config: ChainConfig,
}

impl EscrowClient {
    pub fn new(gateway: Arc<dyn ChainGateway>, config: ChainConfig) -> Self {
        Self { gateway, config }
    }

    /// Send a write and block until it is mined or the timeout elapses.
    async fn send_and_confirm(&self, to: &str, method: &str, args: Vec<Value>) -> ChainResult<TxReceipt> {
        let tx_hash = self.gateway.send(to, method, args).await?;
        debug!(method, %tx_hash, "Transaction submitted");
        let receipt = self.wait_for_receipt(&tx_hash).await?;
        if !receipt.success {
            return Err(ChainError::Reverted {
                reason: receipt
                    .revert_reason
                    .unwrap_or_else(|| format!("{method} reverted without reason")),
            });
        }
        Ok(receipt)
    }

    async fn wait_for_receipt(&self, tx_hash: &str) -> ChainResult<TxReceipt> {
        let deadline = Instant::now() + self.config.confirmation_timeout;
        loop {
            if let Some(receipt) = self.gateway.receipt(tx_hash).await? {
                return Ok(receipt);
            }
            if Instant::now() >= deadline {
                warn!(%tx_hash, "No receipt before confirmation timeout");
                return Err(ChainError::Inconclusive {
                    tx_hash: tx_hash.to_string(),
                });
            }
            tokio::time::sleep(self.config.confirmation_poll).await;
        }
    }

    /// Raise the escrow contract's allowance on `token` to at least `required`
    /// base units.  Some tokens refuse to change one non-zero allowance to
    /// another, so a stale non-zero allowance is reset to zero first.
    async fn ensure_allowance(&self, token: &str, required: &str) -> ChainResult<()> {
        let current = self
            .gateway
            .call(
                token,
                "allowance",
                vec![json!(self.config.bridge_wallet), json!(self.config.escrow_contract)],
            )
            .await?;
        let current = parse_units(&current)?;
        let required_units = Decimal::from_str(required)
            .map_err(|e| ChainError::InvalidParameters(format!("amount {required}: {e}")))?;

        if current >= required_units {
            return Ok(());
        }
        if !current.is_zero() {
            info!(%token, %current, "Resetting stale allowance");
            self.send_and_confirm(token, "approve", vec![json!(self.config.escrow_contract), json!("0")])
                .await?;
        }
        self.send_and_confirm(token, "approve", vec![json!(self.config.escrow_contract), json!(required)])
            .await?;
        Ok(())
    }
}

#[async_trait]
impl EscrowContract for EscrowClient {
    async fn is_reachable(&self) -> ChainResult<bool> {
        self.gateway.has_code(&self.config.escrow_contract).await
    }

    async fn ensure_unpaused(&self) -> ChainResult<bool> {
        if self.config.variant == ContractVariant::Standard {
            return Ok(false);
        }
        let paused = self
            .gateway
            .call(&self.config.escrow_contract, "paused", vec![])
            .await?
            .as_bool()
            .unwrap_or(false);
        if !paused {
            return Ok(false);
        }
        if !self.config.can_unpause {
            return Err(ChainError::Reverted {
                reason: "contract is paused and signer lacks the pauser role".into(),
            });
        }
        warn!(contract = %self.config.escrow_contract, "Escrow contract paused, unpausing");
        self.send_and_confirm(&self.config.escrow_contract, "unpause", vec![])
            .await?;
        Ok(true)
    }

    async fn submit_create(&self, params: &CreateEscrowParams) -> ChainResult<String> {
        if params.payee.trim().is_empty() {
            return Err(ChainError::InvalidParameters("payee address is empty".into()));
        }
        if params.amount <= Decimal::ZERO {
            return Err(ChainError::InvalidParameters(format!(
                "escrow amount must be positive, got {}",
                params.amount
            )));
        }
        if params.deadline <= now_ts() {
            return Err(ChainError::InvalidParameters(format!(
                "deadline {} is in the past",
                params.deadline
            )));
        }
        let units = to_base_units(params.amount, self.config.token_decimals)?;

        self.gateway
            .send(
                &self.config.escrow_contract,
                "createEscrow",
                vec![
                    json!(params.payer),
                    json!(params.payee),
                    json!(params.token),
                    json!(units),
                    json!(params.deadline),
                    json!(params.vertical),
                    json!(params.clabe),
                    json!(params.conditions),
                ],
            )
            .await
    }

    async fn created_escrow_from_tx(&self, tx_hash: &str) -> ChainResult<CreatedEscrow> {
        let receipt = self.wait_for_receipt(tx_hash).await?;
        if !receipt.success {
            return Err(ChainError::Reverted {
                reason: receipt
                    .revert_reason
                    .unwrap_or_else(|| "createEscrow reverted without reason".into()),
            });
        }
        let escrow_id = escrow_id_from_receipt(
            &receipt,
            &self.config.escrow_contract,
            self.config.escrow_created_topic.as_deref(),
        )
        .ok_or_else(|| ChainError::MissingEscrowId {
            tx_hash: tx_hash.to_string(),
        })?;

        info!(%escrow_id, %tx_hash, "Escrow created on-chain");
        Ok(CreatedEscrow {
            escrow_id,
            tx_hash: tx_hash.to_string(),
        })
    }

    async fn fund_escrow(&self, escrow_id: &str, token: &str, amount: Decimal) -> ChainResult<String> {
        let units = to_base_units(amount, self.config.token_decimals)?;
        if units == "0" {
            return Err(ChainError::InvalidParameters("funding amount is zero".into()));
        }
        self.ensure_allowance(token, &units).await?;
        let receipt = self
            .send_and_confirm(
                &self.config.escrow_contract,
                "fundEscrow",
                vec![json!(escrow_id), json!(token), json!(units)],
            )
            .await?;
        info!(%escrow_id, tx_hash = %receipt.tx_hash, "Escrow funded");
        Ok(receipt.tx_hash)
    }

    async fn release(&self, escrow_id: &str) -> ChainResult<String> {
        self.ensure_unpaused().await?;
        let receipt = self
            .send_and_confirm(&self.config.escrow_contract, "release", vec![json!(escrow_id)])
            .await?;
        info!(%escrow_id, tx_hash = %receipt.tx_hash, "Escrow released");
        Ok(receipt.tx_hash)
    }

    async fn dispute(&self, escrow_id: &str, reason: &str) -> ChainResult<String> {
        if reason.trim().is_empty() {
            return Err(ChainError::InvalidParameters("dispute reason is empty".into()));
        }
        let receipt = self
            .send_and_confirm(
                &self.config.escrow_contract,
                "dispute",
                vec![json!(escrow_id), json!(reason)],
            )
            .await?;
        Ok(receipt.tx_hash)
    }

    async fn resolve_dispute(&self, escrow_id: &str, in_favor_of_seller: bool) -> ChainResult<String> {
        let receipt = self
            .send_and_confirm(
                &self.config.escrow_contract,
                "resolveDispute",
                vec![json!(escrow_id), json!(in_favor_of_seller)],
            )
            .await?;
        Ok(receipt.tx_hash)
    }

    async fn escrow_state(&self, escrow_id: &str) -> ChainResult<OnChainEscrow> {
        let raw = self
            .gateway
            .call(&self.config.escrow_contract, "getEscrow", vec![json!(escrow_id)])
            .await?;
        let status = raw
            .get("status")
            .and_then(Value::as_u64)
            .and_then(|s| u8::try_from(s).ok())
            .ok_or_else(|| ChainError::InvalidParameters(format!("escrow {escrow_id} has no status")))?;
        let amount = match raw.get("amount") {
            Some(v) => from_base_units(&parse_units(v)?.to_string(), self.config.token_decimals)?,
            None => Decimal::ZERO,
        };
        Ok(OnChainEscrow {
            status: OnChainStatus::from(status),
            amount,
        })
    }

    async fn tx_outcome(&self, tx_hash: &str) -> ChainResult<TxOutcome> {
        Ok(match self.gateway.receipt(tx_hash).await? {
            None => TxOutcome::Pending,
            Some(r) if r.success => TxOutcome::Confirmed,
            Some(r) => TxOutcome::Reverted(r.revert_reason.unwrap_or_default()),
        })
    }
}

// ─────────────────────────────────────────────────────────
// Encoding helpers
// ─────────────────────────────────────────────────────────

/// Scale a token amount to base units.  Amounts finer than the token's
/// precision are rejected rather than rounded.
pub fn to_base_units(amount: Decimal, decimals: u32) -> ChainResult<String> {
    let mut scaled = amount;
    for _ in 0..decimals {
        scaled = scaled
            .checked_mul(Decimal::TEN)
            .ok_or_else(|| ChainError::InvalidParameters(format!("amount {amount} overflows")))?;
    }
    if !scaled.fract().is_zero() {
        return Err(ChainError::InvalidParameters(format!(
            "amount {amount} has more than {decimals} decimals"
        )));
    }
    Ok(scaled.trunc().normalize().to_string())
}

pub fn from_base_units(raw: &str, decimals: u32) -> ChainResult<Decimal> {
    let units: i128 = raw
        .parse()
        .map_err(|_| ChainError::InvalidParameters(format!("'{raw}' is not an integer amount")))?;
    Decimal::try_from_i128_with_scale(units, decimals)
        .map(|d| d.normalize())
        .map_err(|e| ChainError::InvalidParameters(format!("amount {raw}: {e}")))
}

/// The relayer returns uint256 values either as JSON numbers or as strings.
fn parse_units(v: &Value) -> ChainResult<Decimal> {
    let s = match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => {
            return Err(ChainError::InvalidParameters(format!(
                "expected integer, got {other}"
            )))
        }
    };
    Decimal::from_str(&s).map_err(|e| ChainError::InvalidParameters(format!("'{s}': {e}")))
}

/// Find the id of a freshly created escrow in a receipt: first the
/// relayer-decoded `EscrowCreated` event, then the first indexed topic of a
/// raw log emitted by the contract.  Returns `None` rather than guessing.
pub fn escrow_id_from_receipt(receipt: &TxReceipt, contract: &str, topic0: Option<&str>) -> Option<String> {
    let decoded = receipt
        .events
        .iter()
        .filter(|e| e.name == "EscrowCreated")
        .find_map(|e| match e.args.get("escrowId") {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        });
    if decoded.is_some() {
        return decoded;
    }

    receipt
        .logs
        .iter()
        .filter(|log| log.address.eq_ignore_ascii_case(contract))
        .filter(|log| match (topic0, log.topics.first()) {
            (Some(want), Some(got)) => want.eq_ignore_ascii_case(got),
            (Some(_), None) => false,
            (None, _) => true,
        })
        .find_map(|log| log.topics.get(1).and_then(|t| decode_uint_topic(t)))
}

/// Decode a 32-byte indexed `uint256` topic.  Values that do not fit in 128
/// bits are not plausible escrow ids and are refused.
fn decode_uint_topic(topic: &str) -> Option<String> {
    let bytes = hex::decode(topic.trim_start_matches("0x")).ok()?;
    if bytes.len() != 32 || bytes[..16].iter().any(|b| *b != 0) {
        return None;
    }
    let mut low = [0u8; 16];
    low.copy_from_slice(&bytes[16..]);
    Some(u128::from_be_bytes(low).to_string())
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
