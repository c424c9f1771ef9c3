//! Typed audit-log entries.
//!
//! Every state transition anywhere in the engine appends one [`PaymentEvent`].
//! The kind is a closed enumeration so the chronological order of a payment's
//! stages can be checked mechanically; the description carries free-form
//! detail (tx hashes, remote references, error text).

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};

/// All recognised payment event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentEventKind {
    PaymentCreated,
    /// A matching fiat deposit was found and claimed.
    DepositDetected,
    /// Fiat converted to tokens and sent to the bridge wallet.
    BridgeWithdrawalInitiated,
    EscrowCreated,
    /// Custody is active: the escrow exists on-chain and holds the funds.
    EscrowFunded,
    EscrowReleased,
    RedemptionInitiated,
    PayoutCompleted,
    /// A lifecycle stage failed; the row is left for the next tick.
    StageFailed,
    /// A stage failed in a way another tick will not fix by itself.
    StageRejected,
    /// Repeated rejections escalated to operators.
    ManualInterventionRequired,
    EscrowRecoverySuccess,
    EscrowRecoveryFailed,
    /// Recovery could not tell whether a submitted tx landed.
    EscrowRecoveryDeferred,
    RollbackInitiated,
    ApprovalRequested,
    ApprovalSigned,
    ApprovalGranted,
    ApprovalRejected,
    ApprovalExpired,
    ApprovalExecuted,
    ApprovalExecutionFailed,
    /// Routing fell back to single-sig because a multi-sig wallet is missing.
    MultisigDegraded,
    BlockchainSync,
    /// Local and on-chain state disagree in a way sync will not overwrite.
    SyncInconsistent,
    EscrowDisputed,
}

impl PaymentEventKind {
    /// Return a short identifier string suitable for storage in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PaymentCreated => "payment_created",
            Self::DepositDetected => "deposit_detected",
            Self::BridgeWithdrawalInitiated => "bridge_withdrawal_initiated",
            Self::EscrowCreated => "escrow_created",
            Self::EscrowFunded => "escrow_funded",
            Self::EscrowReleased => "escrow_released",
            Self::RedemptionInitiated => "redemption_initiated",
            Self::PayoutCompleted => "payout_completed",
            Self::StageFailed => "stage_failed",
            Self::StageRejected => "stage_rejected",
            Self::ManualInterventionRequired => "manual_intervention_required",
            Self::EscrowRecoverySuccess => "escrow_recovery_success",
            Self::EscrowRecoveryFailed => "escrow_recovery_failed",
            Self::EscrowRecoveryDeferred => "escrow_recovery_deferred",
            Self::RollbackInitiated => "rollback_initiated",
            Self::ApprovalRequested => "approval_requested",
            Self::ApprovalSigned => "approval_signed",
            Self::ApprovalGranted => "approval_granted",
            Self::ApprovalRejected => "approval_rejected",
            Self::ApprovalExpired => "approval_expired",
            Self::ApprovalExecuted => "approval_executed",
            Self::ApprovalExecutionFailed => "approval_execution_failed",
            Self::MultisigDegraded => "multisig_degraded",
            Self::BlockchainSync => "blockchain_sync",
            Self::SyncInconsistent => "sync_inconsistent",
            Self::EscrowDisputed => "escrow_disputed",
        }
    }

    /// Whether this kind marks a forward step of the happy-path lifecycle.
    pub fn is_lifecycle_stage(&self) -> bool {
        matches!(
            self,
            Self::PaymentCreated
                | Self::DepositDetected
                | Self::BridgeWithdrawalInitiated
                | Self::EscrowCreated
                | Self::EscrowFunded
                | Self::EscrowReleased
                | Self::RedemptionInitiated
                | Self::PayoutCompleted
        )
    }
}

impl FromStr for PaymentEventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "payment_created" => Self::PaymentCreated,
            "deposit_detected" => Self::DepositDetected,
            "bridge_withdrawal_initiated" => Self::BridgeWithdrawalInitiated,
            "escrow_created" => Self::EscrowCreated,
            "escrow_funded" => Self::EscrowFunded,
            "escrow_released" => Self::EscrowReleased,
            "redemption_initiated" => Self::RedemptionInitiated,
            "payout_completed" => Self::PayoutCompleted,
            "stage_failed" => Self::StageFailed,
            "stage_rejected" => Self::StageRejected,
            "manual_intervention_required" => Self::ManualInterventionRequired,
            "escrow_recovery_success" => Self::EscrowRecoverySuccess,
            "escrow_recovery_failed" => Self::EscrowRecoveryFailed,
            "escrow_recovery_deferred" => Self::EscrowRecoveryDeferred,
            "rollback_initiated" => Self::RollbackInitiated,
            "approval_requested" => Self::ApprovalRequested,
            "approval_signed" => Self::ApprovalSigned,
            "approval_granted" => Self::ApprovalGranted,
            "approval_rejected" => Self::ApprovalRejected,
            "approval_expired" => Self::ApprovalExpired,
            "approval_executed" => Self::ApprovalExecuted,
            "approval_execution_failed" => Self::ApprovalExecutionFailed,
            "multisig_degraded" => Self::MultisigDegraded,
            "blockchain_sync" => Self::BlockchainSync,
            "sync_inconsistent" => Self::SyncInconsistent,
            "escrow_disputed" => Self::EscrowDisputed,
            other => return Err(format!("unknown payment event kind '{other}'")),
        };
        Ok(kind)
    }
}

/// An audit record as stored in / read from the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub id: i64,
    pub payment_id: i64,
    pub kind: PaymentEventKind,
    pub description: String,
    pub created_at: i64,
}

impl<'r> FromRow<'r, SqliteRow> for PaymentEvent {
    fn from_row(row: &'r SqliteRow) -> sqlx::Result<Self> {
        let raw: String = row.try_get("kind")?;
        let kind = raw.parse().map_err(|e: String| sqlx::Error::ColumnDecode {
            index: "kind".to_string(),
            source: e.into(),
        })?;
        Ok(PaymentEvent {
            id: row.try_get("id")?,
            payment_id: row.try_get("payment_id")?,
            kind,
            description: row.try_get("description")?,
            created_at: row.try_get("created_at")?,
        })
    }
}
