//! Escrow contract client.
//!
//! The rest of the engine only sees [`EscrowContract`].  The production
//! implementation is [`EscrowClient`], which speaks to a transaction relayer
//! through a [`ChainGateway`]; tests substitute their own implementations of
//! either trait.

mod client;
mod rpc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ChainError;

pub use client::{escrow_id_from_receipt, from_base_units, to_base_units, EscrowClient};
pub use rpc::RelayerGateway;

pub type ChainResult<T> = std::result::Result<T, ChainError>;

/// Arguments of the contract's `createEscrow`.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateEscrowParams {
    pub payer: String,
    pub payee: String,
    pub token: String,
    pub amount: Decimal,
    /// Unix seconds after which the escrow may be released.
    pub deadline: i64,
    pub vertical: String,
    pub clabe: String,
    pub conditions: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedEscrow {
    pub escrow_id: String,
    pub tx_hash: String,
}

/// Escrow status as stored by the contract (`uint8`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnChainStatus {
    Created,
    Funded,
    Released,
    Disputed,
    Unknown(u8),
}

impl From<u8> for OnChainStatus {
    fn from(raw: u8) -> Self {
        match raw {
            0 => Self::Created,
            1 => Self::Funded,
            2 => Self::Released,
            3 => Self::Disputed,
            other => Self::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OnChainEscrow {
    pub status: OnChainStatus,
    pub amount: Decimal,
}

/// What became of a previously submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOutcome {
    Confirmed,
    Reverted(String),
    /// No receipt yet.
    Pending,
}

/// Logical interface of the escrow contract, identical for every deployed
/// variant.  Write calls return only after confirmation; a confirmation
/// timeout is reported as [`ChainError::Inconclusive`].
#[async_trait]
pub trait EscrowContract: Send + Sync {
    /// Whether the node answers and the contract has code at its address.
    async fn is_reachable(&self) -> ChainResult<bool>;

    /// Unpause the contract if it is paused and we are allowed to.
    /// Returns `true` when an unpause transaction was sent.
    async fn ensure_unpaused(&self) -> ChainResult<bool>;

    /// Submit `createEscrow` without waiting; returns the tx hash.
    async fn submit_create(&self, params: &CreateEscrowParams) -> ChainResult<String>;

    /// Wait for a create tx and extract the new escrow id from its receipt.
    async fn created_escrow_from_tx(&self, tx_hash: &str) -> ChainResult<CreatedEscrow>;

    async fn create_escrow(&self, params: &CreateEscrowParams) -> ChainResult<CreatedEscrow> {
        let tx_hash = self.submit_create(params).await?;
        self.created_escrow_from_tx(&tx_hash).await
    }

    async fn fund_escrow(&self, escrow_id: &str, token: &str, amount: Decimal) -> ChainResult<String>;

    async fn release(&self, escrow_id: &str) -> ChainResult<String>;

    async fn dispute(&self, escrow_id: &str, reason: &str) -> ChainResult<String>;

    async fn resolve_dispute(&self, escrow_id: &str, in_favor_of_seller: bool) -> ChainResult<String>;

    async fn escrow_state(&self, escrow_id: &str) -> ChainResult<OnChainEscrow>;

    async fn tx_outcome(&self, tx_hash: &str) -> ChainResult<TxOutcome>;
}

// ─────────────────────────────────────────────────────────
// Relayer transport
// ─────────────────────────────────────────────────────────

/// A log entry exactly as emitted by the EVM.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawLog {
    pub address: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: String,
}

/// An event the relayer already decoded against the contract ABI.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DecodedEvent {
    #[serde(rename = "event")]
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TxReceipt {
    pub tx_hash: String,
    pub success: bool,
    pub revert_reason: Option<String>,
    pub events: Vec<DecodedEvent>,
    pub logs: Vec<RawLog>,
}

/// Low-level access to a relayer that holds the signing key.
#[async_trait]
pub trait ChainGateway: Send + Sync {
    /// Read-only contract call.
    async fn call(&self, to: &str, method: &str, args: Vec<Value>) -> ChainResult<Value>;

    /// Sign and broadcast; returns the tx hash without waiting.
    async fn send(&self, to: &str, method: &str, args: Vec<Value>) -> ChainResult<String>;

    /// `None` while the tx is not yet mined.
    async fn receipt(&self, tx_hash: &str) -> ChainResult<Option<TxReceipt>>;

    async fn has_code(&self, address: &str) -> ChainResult<bool>;
}
