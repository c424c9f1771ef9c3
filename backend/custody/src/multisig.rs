//! Multi-signature approval engine.
//!
//! One table, one state machine:
//!
//! ```text
//! pending ──(threshold reached)──▶ approved ──(execute ok)──▶ executed
//!    │                                 │
//!    ├──(owner rejects)──▶ rejected    └──(execute fails)──▶ approved (retry)
//!    └──(sweep past expires_at)──▶ expired
//! ```
//!
//! Signer authorization is checked against the wallet's owner set as
//! configured when the signature arrives.  Signatures never carry over to a
//! new request.

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::config::MultisigWallet;
use crate::db::{self, NewApproval, SignatureWrite};
use crate::errors::{CustodyError, Result};
use crate::events::PaymentEventKind;
use crate::models::{now_ts, ApprovalKind, ApprovalRequest, ApprovalStatus, EscrowStatus};
use crate::router::TransactionRouter;
use crate::stages::{PayoutOutcome, ReleaseOutcome, Stages};

#[derive(Debug, Clone)]
pub struct Proposal {
    pub payment_id: i64,
    pub kind: ApprovalKind,
    pub amount: Decimal,
    pub recipient: String,
    pub created_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Executed { reference: String },
    /// Submitted but unconfirmed; the request stays `approved`.
    Pending { reference: String },
    /// Another worker is moving the funds right now; the request stays `approved`.
    InProgress,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub expired: u32,
    pub reconciled: u32,
}

pub struct MultisigEngine {
    pool: SqlitePool,
    router: Arc<TransactionRouter>,
    stages: Arc<Stages>,
    ttl: ChronoDuration,
}

impl MultisigEngine {
    pub fn new(
        pool: SqlitePool,
        router: Arc<TransactionRouter>,
        stages: Arc<Stages>,
        ttl: ChronoDuration,
    ) -> Self {
        Self {
            pool,
            router,
            stages,
            ttl,
        }
    }

    /// Open a `pending` request.  An open (pending, or approved and unexpired)
    /// request for the same payment and kind is returned instead of a new one.
    pub async fn propose(&self, proposal: &Proposal) -> Result<ApprovalRequest> {
        let now = now_ts();
        if let Some(existing) = db::latest_approval(&self.pool, proposal.payment_id, proposal.kind).await? {
            let open = matches!(existing.status, ApprovalStatus::Pending | ApprovalStatus::Approved)
                && !existing.is_expired_at(now);
            if open {
                return Ok(existing);
            }
            if existing.status == ApprovalStatus::Pending && db::expire_approval(&self.pool, existing.id, now).await? {
                self.log_expired(&existing).await?;
            }
        }

        let decision = self.router.route(proposal.amount, proposal.kind).await?;
        let threshold = match (decision.requires_approval, decision.threshold) {
            (true, Some(t)) => t,
            _ => {
                return Err(CustodyError::Validation(format!(
                    "{} for payment {} does not require approval: {}",
                    proposal.kind, proposal.payment_id, decision.reason
                )))
            }
        };

        let request = db::insert_approval(
            &self.pool,
            &NewApproval {
                payment_id: proposal.payment_id,
                kind: proposal.kind,
                wallet_address: decision.wallet_address,
                required_signatures: threshold,
                amount: proposal.amount,
                amount_usd: decision.amount_reference,
                recipient: proposal.recipient.clone(),
                created_by: proposal.created_by.clone(),
                expires_at: now + self.ttl.num_seconds(),
            },
        )
        .await?;

        info!(
            approval_id = request.id,
            payment_id = request.payment_id,
            required = request.required_signatures,
            wallet = %request.wallet_address,
            "Approval requested"
        );
        Ok(request)
    }

    /// Record one owner's signature.  A repeat signer, an expired request or a
    /// rejected one is an error; signing an already-approved request is a
    /// no-op reported as [`SignatureWrite::NotPending`].
    pub async fn submit_signature(
        &self,
        request_id: i64,
        signer: &str,
        signature_hex: &str,
    ) -> Result<SignatureWrite> {
        let request = db::get_approval(&self.pool, request_id).await?;
        self.authorize(&request, signer)?;

        let bytes = hex::decode(signature_hex.trim_start_matches("0x"))
            .map_err(|e| CustodyError::Validation(format!("signature is not hex: {e}")))?;
        if bytes.is_empty() {
            return Err(CustodyError::Validation("signature is empty".into()));
        }

        let now = now_ts();
        let outcome =
            db::record_signature(&self.pool, request_id, signer, &hex::encode(&bytes), now).await?;
        match outcome {
            SignatureWrite::Duplicate => Err(CustodyError::Validation(format!(
                "{signer} already signed approval {request_id}"
            ))),
            SignatureWrite::Expired => {
                if db::expire_approval(&self.pool, request_id, now).await? {
                    self.log_expired(&request).await?;
                }
                Err(CustodyError::Validation(format!("approval {request_id} has expired")))
            }
            SignatureWrite::NotPending(status @ (ApprovalStatus::Rejected | ApprovalStatus::Expired)) => {
                Err(CustodyError::Validation(format!(
                    "approval {request_id} is {status}, signatures are closed"
                )))
            }
            SignatureWrite::ThresholdReached { required } => {
                info!(approval_id = request_id, required, "Approval threshold reached");
                Ok(outcome)
            }
            other => Ok(other),
        }
    }

    /// An owner vetoes a pending request.
    pub async fn reject(&self, request_id: i64, signer: &str, reason: &str) -> Result<()> {
        let request = db::get_approval(&self.pool, request_id).await?;
        self.authorize(&request, signer)?;

        if !db::reject_approval(&self.pool, request_id, reason).await? {
            return Err(CustodyError::Validation(format!(
                "approval {request_id} is {}, only pending requests can be rejected",
                request.status
            )));
        }
        db::append_event(
            &self.pool,
            request.payment_id,
            PaymentEventKind::ApprovalRejected,
            &format!("approval {request_id} rejected by {signer}: {reason}"),
        )
        .await?;
        warn!(approval_id = request_id, %signer, "Approval rejected");
        Ok(())
    }

    /// Perform the approved movement.  Only an `approved`, unexpired request
    /// executes; a failure leaves it `approved` so no signature is lost.
    pub async fn execute(&self, request_id: i64, executor: &str) -> Result<ExecutionOutcome> {
        let request = db::get_approval(&self.pool, request_id).await?;
        if request.status != ApprovalStatus::Approved {
            return Err(CustodyError::Validation(format!(
                "approval {request_id} is {}, only approved requests execute",
                request.status
            )));
        }
        if request.is_expired_at(now_ts()) {
            return Err(CustodyError::Validation(format!(
                "approval {request_id} expired at {}",
                request.expires_at
            )));
        }

        let result = match request.kind {
            ApprovalKind::Release => self.stages.release(request.payment_id).await.map(|o| match o {
                ReleaseOutcome::Released { tx_hash } => ExecutionOutcome::Executed { reference: tx_hash },
                ReleaseOutcome::AlreadyReleased => ExecutionOutcome::Executed {
                    reference: "already-released".into(),
                },
                ReleaseOutcome::Pending { tx_hash } => ExecutionOutcome::Pending { reference: tx_hash },
                ReleaseOutcome::Busy => ExecutionOutcome::InProgress,
            }),
            ApprovalKind::Payout => self.stages.payout(request.payment_id).await.map(|o| match o {
                PayoutOutcome::Completed { payout_ref } => ExecutionOutcome::Executed { reference: payout_ref },
                PayoutOutcome::Busy => ExecutionOutcome::InProgress,
            }),
        };

        match result {
            Ok(ExecutionOutcome::Executed { reference }) => {
                self.mark_executed(&request, &reference, executor).await?;
                Ok(ExecutionOutcome::Executed { reference })
            }
            Ok(pending) => Ok(pending),
            Err(e) => {
                db::append_event(
                    &self.pool,
                    request.payment_id,
                    PaymentEventKind::ApprovalExecutionFailed,
                    &format!("approval {request_id} execution by {executor} failed: {e}"),
                )
                .await?;
                warn!(approval_id = request_id, "Approval execution failed: {e}");
                Err(e)
            }
        }
    }

    /// Expire overdue pending requests and close the current approved release
    /// request of an escrow that was released by another path (sync watcher
    /// settling an unconfirmed release).  Superseded requests stay as they are.
    pub async fn sweep(&self, now: i64) -> Result<SweepSummary> {
        let mut summary = SweepSummary::default();

        for request in db::overdue_approvals(&self.pool, now).await? {
            if db::expire_approval(&self.pool, request.id, now).await? {
                self.log_expired(&request).await?;
                summary.expired += 1;
            }
        }

        for request in db::approvals_with_status(&self.pool, ApprovalStatus::Approved).await? {
            if request.kind != ApprovalKind::Release {
                continue;
            }
            let latest = db::latest_approval(&self.pool, request.payment_id, ApprovalKind::Release).await?;
            if latest.map(|r| r.id) != Some(request.id) {
                continue;
            }
            let escrow = db::get_escrow_for_payment(&self.pool, request.payment_id).await?;
            if matches!(escrow.status, EscrowStatus::Released | EscrowStatus::Completed) {
                let reference = escrow
                    .release_tx_hash
                    .unwrap_or_else(|| "released-out-of-band".into());
                self.mark_executed(&request, &reference, "sweep").await?;
                summary.reconciled += 1;
            }
        }
        Ok(summary)
    }

    fn authorize(&self, request: &ApprovalRequest, signer: &str) -> Result<&MultisigWallet> {
        let wallet = self.router.wallet(&request.wallet_address).ok_or_else(|| {
            CustodyError::Validation(format!(
                "wallet {} of approval {} is no longer configured",
                request.wallet_address, request.id
            ))
        })?;
        if !wallet.is_owner(signer) {
            return Err(CustodyError::Validation(format!(
                "{signer} is not an owner of {}",
                wallet.address
            )));
        }
        Ok(wallet)
    }

    async fn mark_executed(&self, request: &ApprovalRequest, reference: &str, executor: &str) -> Result<()> {
        if db::mark_approval_executed(&self.pool, request.id, reference, executor).await? {
            db::append_event(
                &self.pool,
                request.payment_id,
                PaymentEventKind::ApprovalExecuted,
                &format!("approval {} executed by {executor}, ref {reference}", request.id),
            )
            .await?;
            info!(approval_id = request.id, %reference, "Approval executed");
        }
        Ok(())
    }

    async fn log_expired(&self, request: &ApprovalRequest) -> Result<()> {
        db::append_event(
            &self.pool,
            request.payment_id,
            PaymentEventKind::ApprovalExpired,
            &format!(
                "approval {} expired with {}/{} signatures",
                request.id, request.current_signatures, request.required_signatures
            ),
        )
        .await
    }
}
