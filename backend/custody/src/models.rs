//! Ledger rows and their status machines.
//!
//! Amounts are persisted as decimal TEXT and timestamps as unix seconds, so
//! every row type decodes itself through a hand-written [`FromRow`] impl.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};

/// Current unix time in seconds.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Implements `as_str`, `Display` and `FromStr` for a status enum whose
/// variants map one-to-one onto lowercase storage strings.
macro_rules! status_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant),)+
                    other => Err(format!("unknown {} '{}'", stringify!($name), other)),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Registered, waiting for the fiat deposit.
    Pending,
    /// Claimed by the payout watcher; redemption/payout in flight.
    Processing,
    /// Fiat deposit detected; escrow not yet active on-chain.
    Funded,
    /// Custody active on-chain.
    Escrowed,
    /// Escrow released; payout not yet sent.
    Released,
    Completed,
    Refunded,
    Failed,
}

status_enum!(PaymentStatus {
    Pending => "pending",
    Processing => "processing",
    Funded => "funded",
    Escrowed => "escrowed",
    Released => "released",
    Completed => "completed",
    Refunded => "refunded",
    Failed => "failed",
});

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Refunded | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    Pending,
    Active,
    Released,
    Disputed,
    Completed,
    Refunded,
}

status_enum!(EscrowStatus {
    Pending => "pending",
    Active => "active",
    Released => "released",
    Disputed => "disputed",
    Completed => "completed",
    Refunded => "refunded",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    Executed,
}

status_enum!(ApprovalStatus {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
    Expired => "expired",
    Executed => "executed",
});

/// The money movement an approval request authorises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    /// Release custody on the escrow contract.
    Release,
    /// Redeem and pay out through the banking rail.
    Payout,
}

status_enum!(ApprovalKind {
    Release => "release",
    Payout => "payout",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    PendingRetry,
    MaxRetriesReached,
    Recovered,
}

status_enum!(RecoveryStatus {
    PendingRetry => "pending_retry",
    MaxRetriesReached => "max_retries_reached",
    Recovered => "recovered",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: i64,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub payer_id: String,
    pub payee_id: String,
    /// Bank account (CLABE) the payer deposits into.
    pub deposit_account: String,
    /// Registered bank account the payee is paid out to.
    pub payout_account: String,
    pub payee_wallet: Option<String>,
    pub vertical: Option<String>,
    /// Banking-rail id of the matched deposit.
    pub deposit_ref: Option<String>,
    pub withdrawal_ref: Option<String>,
    pub redemption_ref: Option<String>,
    pub payout_ref: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escrow {
    pub id: i64,
    pub payment_id: i64,
    /// Null until on-chain creation *and* funding have both succeeded.
    pub smart_contract_escrow_id: Option<String>,
    pub custody_amount: Decimal,
    pub custody_end: i64,
    pub release_amount: Decimal,
    pub status: EscrowStatus,
    pub create_tx_hash: Option<String>,
    pub fund_tx_hash: Option<String>,
    pub release_tx_hash: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: i64,
    pub payment_id: i64,
    pub kind: ApprovalKind,
    pub wallet_address: String,
    pub required_signatures: u32,
    pub current_signatures: u32,
    pub status: ApprovalStatus,
    pub amount: Decimal,
    pub amount_usd: Decimal,
    pub recipient: String,
    pub created_by: String,
    pub expires_at: i64,
    pub executed_tx_hash: Option<String>,
    pub executed_by: Option<String>,
    pub rejection_reason: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ApprovalRequest {
    pub fn is_expired_at(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    pub id: i64,
    pub approval_request_id: i64,
    pub signer_address: String,
    /// Hex-encoded signature bytes.
    pub signature: String,
    pub signed_at: i64,
}

/// Crash-safe recovery ledger for one payment's escrow provisioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowRecovery {
    pub payment_id: i64,
    pub attempts: u32,
    pub status: RecoveryStatus,
    /// On-chain id of an escrow that was created but not yet funded.
    pub pending_escrow_id: Option<String>,
    pub pending_create_tx: Option<String>,
    /// Fund tx whose confirmation timed out; checked before funding again.
    pub pending_fund_tx: Option<String>,
    pub last_error: Option<String>,
    pub locked_until: i64,
    pub updated_at: i64,
}

// ─────────────────────────────────────────────────────────
// Row decoding
// ─────────────────────────────────────────────────────────

fn decode_err(column: &str, msg: impl fmt::Display) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: msg.to_string().into(),
    }
}

fn decimal(row: &SqliteRow, column: &str) -> sqlx::Result<Decimal> {
    let raw: String = row.try_get(column)?;
    Decimal::from_str(&raw).map_err(|e| decode_err(column, e))
}

fn parsed<T: FromStr<Err = String>>(row: &SqliteRow, column: &str) -> sqlx::Result<T> {
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|e| decode_err(column, e))
}

fn count(row: &SqliteRow, column: &str) -> sqlx::Result<u32> {
    let raw: i64 = row.try_get(column)?;
    u32::try_from(raw).map_err(|e| decode_err(column, e))
}

impl<'r> FromRow<'r, SqliteRow> for Payment {
    fn from_row(row: &'r SqliteRow) -> sqlx::Result<Self> {
        Ok(Payment {
            id: row.try_get("id")?,
            amount: decimal(row, "amount")?,
            currency: row.try_get("currency")?,
            status: parsed(row, "status")?,
            payer_id: row.try_get("payer_id")?,
            payee_id: row.try_get("payee_id")?,
            deposit_account: row.try_get("deposit_account")?,
            payout_account: row.try_get("payout_account")?,
            payee_wallet: row.try_get("payee_wallet")?,
            vertical: row.try_get("vertical")?,
            deposit_ref: row.try_get("deposit_ref")?,
            withdrawal_ref: row.try_get("withdrawal_ref")?,
            redemption_ref: row.try_get("redemption_ref")?,
            payout_ref: row.try_get("payout_ref")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl<'r> FromRow<'r, SqliteRow> for Escrow {
    fn from_row(row: &'r SqliteRow) -> sqlx::Result<Self> {
        Ok(Escrow {
            id: row.try_get("id")?,
            payment_id: row.try_get("payment_id")?,
            smart_contract_escrow_id: row.try_get("smart_contract_escrow_id")?,
            custody_amount: decimal(row, "custody_amount")?,
            custody_end: row.try_get("custody_end")?,
            release_amount: decimal(row, "release_amount")?,
            status: parsed(row, "status")?,
            create_tx_hash: row.try_get("create_tx_hash")?,
            fund_tx_hash: row.try_get("fund_tx_hash")?,
            release_tx_hash: row.try_get("release_tx_hash")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl<'r> FromRow<'r, SqliteRow> for ApprovalRequest {
    fn from_row(row: &'r SqliteRow) -> sqlx::Result<Self> {
        Ok(ApprovalRequest {
            id: row.try_get("id")?,
            payment_id: row.try_get("payment_id")?,
            kind: parsed(row, "kind")?,
            wallet_address: row.try_get("wallet_address")?,
            required_signatures: count(row, "required_signatures")?,
            current_signatures: count(row, "current_signatures")?,
            status: parsed(row, "status")?,
            amount: decimal(row, "amount")?,
            amount_usd: decimal(row, "amount_usd")?,
            recipient: row.try_get("recipient")?,
            created_by: row.try_get("created_by")?,
            expires_at: row.try_get("expires_at")?,
            executed_tx_hash: row.try_get("executed_tx_hash")?,
            executed_by: row.try_get("executed_by")?,
            rejection_reason: row.try_get("rejection_reason")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl<'r> FromRow<'r, SqliteRow> for Signature {
    fn from_row(row: &'r SqliteRow) -> sqlx::Result<Self> {
        Ok(Signature {
            id: row.try_get("id")?,
            approval_request_id: row.try_get("approval_request_id")?,
            signer_address: row.try_get("signer_address")?,
            signature: row.try_get("signature")?,
            signed_at: row.try_get("signed_at")?,
        })
    }
}

impl<'r> FromRow<'r, SqliteRow> for EscrowRecovery {
    fn from_row(row: &'r SqliteRow) -> sqlx::Result<Self> {
        Ok(EscrowRecovery {
            payment_id: row.try_get("payment_id")?,
            attempts: count(row, "attempts")?,
            status: parsed(row, "status")?,
            pending_escrow_id: row.try_get("pending_escrow_id")?,
            pending_create_tx: row.try_get("pending_create_tx")?,
            pending_fund_tx: row.try_get("pending_fund_tx")?,
            last_error: row.try_get("last_error")?,
            locked_until: row.try_get("locked_until")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}
