//! Escrow safety & recovery.
//!
//! A payment is *stuck* when its fiat deposit was claimed (`funded`) but its
//! escrow never made it on-chain (no `smart_contract_escrow_id`).  Recovery
//! retries provisioning once per sweep, counting failures in the
//! `escrow_recoveries` ledger.  At the ceiling the case is escalated to
//! operators; the fiat leg is never reversed automatically.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{error, info, warn};

use crate::db;
use crate::errors::{CustodyError, Result};
use crate::events::PaymentEventKind;
use crate::models::{PaymentStatus, RecoveryStatus};
use crate::stages::{ProvisionOutcome, Stages};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    Recovered { escrow_id: String },
    /// The escrow already has an on-chain id.
    AlreadyProvisioned,
    /// Another worker is provisioning this payment right now.
    Busy,
    /// A transaction is awaiting confirmation; not counted as an attempt.
    Deferred { tx_hash: String },
    Failed { attempts: u32 },
    /// Ceiling reached on this attempt; manual intervention required.
    Escalated { attempts: u32 },
    /// Escalated earlier and still waiting for an operator.
    AwaitingOperator,
}

pub struct SafetyService {
    pool: SqlitePool,
    stages: Arc<Stages>,
    max_attempts: u32,
}

impl SafetyService {
    pub fn new(pool: SqlitePool, stages: Arc<Stages>, max_attempts: u32) -> Self {
        Self {
            pool,
            stages,
            max_attempts,
        }
    }

    /// Ids of funded payments without an on-chain escrow.
    pub async fn detect(&self) -> Result<Vec<i64>> {
        db::stuck_payment_ids(&self.pool).await
    }

    /// One bounded recovery attempt for a payment.
    pub async fn recover(&self, payment_id: i64) -> Result<RecoveryOutcome> {
        if let Some(r) = db::get_recovery(&self.pool, payment_id).await? {
            if r.status == RecoveryStatus::MaxRetriesReached {
                return Ok(RecoveryOutcome::AwaitingOperator);
            }
        }

        match self.attempt(payment_id).await {
            Ok(ProvisionOutcome::Activated { escrow_id }) => {
                db::append_event(
                    &self.pool,
                    payment_id,
                    PaymentEventKind::EscrowRecoverySuccess,
                    &format!("escrow {escrow_id} recovered"),
                )
                .await?;
                info!(payment_id, %escrow_id, "Stuck escrow recovered");
                Ok(RecoveryOutcome::Recovered { escrow_id })
            }
            Ok(ProvisionOutcome::AlreadyProvisioned) => Ok(RecoveryOutcome::AlreadyProvisioned),
            Ok(ProvisionOutcome::Busy) => Ok(RecoveryOutcome::Busy),
            Ok(ProvisionOutcome::Deferred { tx_hash }) => {
                db::append_event(
                    &self.pool,
                    payment_id,
                    PaymentEventKind::EscrowRecoveryDeferred,
                    &format!("waiting on unconfirmed tx {tx_hash}"),
                )
                .await?;
                Ok(RecoveryOutcome::Deferred { tx_hash })
            }
            Err(e) => self.record_failure(payment_id, &e).await,
        }
    }

    async fn attempt(&self, payment_id: i64) -> Result<ProvisionOutcome> {
        let payment = db::get_payment(&self.pool, payment_id).await?;
        let escrow = db::get_escrow_for_payment(&self.pool, payment_id).await?;

        if escrow.smart_contract_escrow_id.is_some() {
            return Ok(ProvisionOutcome::AlreadyProvisioned);
        }
        if payment.status != PaymentStatus::Funded {
            return Err(CustodyError::Validation(format!(
                "payment {payment_id} is {}, not funded",
                payment.status
            )));
        }
        if escrow.custody_amount <= Decimal::ZERO || escrow.custody_end <= 0 {
            return Err(CustodyError::Validation(format!(
                "escrow {} has no custody terms",
                escrow.id
            )));
        }

        let contract = self.stages.contract();
        if !contract.is_reachable().await? {
            return Err(CustodyError::ExternalUnavailable(
                "escrow contract has no code at its address".into(),
            ));
        }
        if contract.ensure_unpaused().await? {
            info!(payment_id, "Unpaused escrow contract before recovery");
        }

        self.stages.provision(payment_id).await
    }

    async fn record_failure(&self, payment_id: i64, cause: &CustodyError) -> Result<RecoveryOutcome> {
        let recovery =
            db::record_recovery_failure(&self.pool, payment_id, &cause.to_string(), self.max_attempts)
                .await?;
        db::append_event(
            &self.pool,
            payment_id,
            PaymentEventKind::EscrowRecoveryFailed,
            &format!(
                "attempt {}/{} failed: {cause}",
                recovery.attempts, self.max_attempts
            ),
        )
        .await?;

        if recovery.status != RecoveryStatus::MaxRetriesReached {
            warn!(payment_id, attempts = recovery.attempts, "Escrow recovery failed: {cause}");
            return Ok(RecoveryOutcome::Failed {
                attempts: recovery.attempts,
            });
        }

        let escalation = CustodyError::ExhaustedRetries(format!(
            "escrow recovery for payment {payment_id} after {} attempts",
            recovery.attempts
        ));
        db::append_event(
            &self.pool,
            payment_id,
            PaymentEventKind::RollbackInitiated,
            &format!("{escalation}; manual compensation required, fiat leg untouched"),
        )
        .await?;
        error!(
            target: "operator_alert",
            payment_id,
            attempts = recovery.attempts,
            last_error = %cause,
            "{escalation}"
        );
        Ok(RecoveryOutcome::Escalated {
            attempts: recovery.attempts,
        })
    }
}
