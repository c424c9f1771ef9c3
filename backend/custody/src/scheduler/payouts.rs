//! Payout watcher: `released → completed`.

use super::{row_failed, Job, JobSummary, RowResult, SchedulerState};
use crate::db;
use crate::errors::Result;
use crate::models::{EscrowStatus, PaymentStatus};
use crate::stages::PayoutOutcome;

pub(super) async fn run(state: &SchedulerState) -> Result<JobSummary> {
    let mut summary = JobSummary::default();
    let released = db::escrows_with_status(&state.pool, EscrowStatus::Released).await?;
    summary.scanned = released.len() as u32;

    for escrow in &released {
        match pay_out(state, escrow.payment_id).await {
            Ok(row) => summary.record(row),
            Err(e) => row_failed(state, &mut summary, Job::Payouts, escrow.payment_id, &e).await,
        }
    }
    Ok(summary)
}

async fn pay_out(state: &SchedulerState, payment_id: i64) -> Result<RowResult> {
    let payment = db::get_payment(&state.pool, payment_id).await?;
    if !matches!(payment.status, PaymentStatus::Released | PaymentStatus::Processing) {
        return Ok(RowResult::Skipped);
    }
    Ok(match state.stages.payout(payment_id).await? {
        PayoutOutcome::Completed { .. } => RowResult::Processed,
        PayoutOutcome::Busy => RowResult::Skipped,
    })
}
