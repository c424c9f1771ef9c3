//! Custody-expiry watcher: releases escrows whose custody window closed,
//! through a multi-sig approval when the router asks for one, then hands the
//! payment to payout.

use tracing::{info, warn};

use super::{row_failed, Job, JobSummary, RowResult, SchedulerState};
use crate::db;
use crate::errors::{CustodyError, Result};
use crate::events::PaymentEventKind;
use crate::models::{now_ts, ApprovalKind, ApprovalStatus, Escrow};
use crate::multisig::{ExecutionOutcome, Proposal};
use crate::stages::{PayoutOutcome, ReleaseOutcome};

const EXECUTOR: &str = "custody_expiry_watcher";

pub(super) async fn run(state: &SchedulerState) -> Result<JobSummary> {
    let mut summary = JobSummary::default();
    let due = db::expired_custodies(&state.pool, now_ts()).await?;
    summary.scanned = due.len() as u32;

    for escrow in &due {
        match release_due(state, escrow).await {
            Ok(row) => summary.record(row),
            Err(e) => row_failed(state, &mut summary, Job::CustodyExpiry, escrow.payment_id, &e).await,
        }
    }
    Ok(summary)
}

async fn release_due(state: &SchedulerState, escrow: &Escrow) -> Result<RowResult> {
    let payment_id = escrow.payment_id;
    let decision = state.router.route(escrow.release_amount, ApprovalKind::Release).await?;

    if decision.degraded {
        db::append_event(
            &state.pool,
            payment_id,
            PaymentEventKind::MultisigDegraded,
            &decision.reason,
        )
        .await?;
    }

    let released = if decision.requires_approval {
        match approved_release(state, escrow).await? {
            Some(done) => done,
            None => return Ok(RowResult::Skipped),
        }
    } else {
        match state.stages.release(payment_id).await? {
            ReleaseOutcome::Released { .. } | ReleaseOutcome::AlreadyReleased => true,
            ReleaseOutcome::Pending { tx_hash } => {
                info!(payment_id, %tx_hash, "Release awaiting confirmation");
                false
            }
            ReleaseOutcome::Busy => false,
        }
    };

    if !released {
        return Ok(RowResult::Skipped);
    }

    // Payout failures are retried by the payout watcher.
    match state.stages.payout(payment_id).await {
        Ok(PayoutOutcome::Completed { .. }) | Ok(PayoutOutcome::Busy) => {}
        Err(e) => warn!(payment_id, "Payout after release deferred to payout watcher: {e}"),
    }
    Ok(RowResult::Processed)
}

/// Drive the release approval one step.  `Some(true)` once released,
/// `Some(false)` while confirmation is pending, `None` while waiting on
/// signers.  A rejected request is an error until an operator acts.
async fn approved_release(state: &SchedulerState, escrow: &Escrow) -> Result<Option<bool>> {
    let payment_id = escrow.payment_id;
    let now = now_ts();
    let latest = db::latest_approval(&state.pool, payment_id, ApprovalKind::Release).await?;

    match latest {
        Some(r) if r.status == ApprovalStatus::Approved && !r.is_expired_at(now) => {
            match state.multisig.execute(r.id, EXECUTOR).await? {
                ExecutionOutcome::Executed { .. } => Ok(Some(true)),
                ExecutionOutcome::Pending { .. } | ExecutionOutcome::InProgress => Ok(Some(false)),
            }
        }
        Some(r) if r.status == ApprovalStatus::Pending && !r.is_expired_at(now) => {
            Ok(None)
        }
        // Counted as a rejection each tick, so it escalates once it recurs.
        Some(r) if r.status == ApprovalStatus::Rejected => Err(CustodyError::Rejected(format!(
            "release approval {} rejected by signers: {}",
            r.id,
            r.rejection_reason.as_deref().unwrap_or("no reason given")
        ))),
        Some(r) if r.status == ApprovalStatus::Executed => {
            warn!(payment_id, approval_id = r.id, "Release approval executed but escrow still active");
            Ok(None)
        }
        _ => {
            let payment = db::get_payment(&state.pool, payment_id).await?;
            let request = state
                .multisig
                .propose(&Proposal {
                    payment_id,
                    kind: ApprovalKind::Release,
                    amount: escrow.release_amount,
                    recipient: payment.payee_wallet.unwrap_or(payment.payee_id),
                    created_by: EXECUTOR.into(),
                })
                .await?;
            info!(payment_id, approval_id = request.id, "Release awaiting signatures");
            Ok(None)
        }
    }
}
