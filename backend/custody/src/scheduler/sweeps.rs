//! Long-interval sweeps: stuck-escrow recovery and approval expiry.

use super::{row_failed, Job, JobSummary, RowResult, SchedulerState};
use crate::errors::Result;
use crate::models::now_ts;
use crate::safety::RecoveryOutcome;

pub(super) async fn safety(state: &SchedulerState) -> Result<JobSummary> {
    let mut summary = JobSummary::default();
    let stuck = state.safety.detect().await?;
    summary.scanned = stuck.len() as u32;

    for payment_id in stuck {
        match state.safety.recover(payment_id).await {
            Ok(RecoveryOutcome::Recovered { .. }) => summary.record(RowResult::Processed),
            Ok(RecoveryOutcome::Failed { .. }) | Ok(RecoveryOutcome::Escalated { .. }) => summary.failed += 1,
            Ok(_) => summary.record(RowResult::Skipped),
            Err(e) => row_failed(state, &mut summary, Job::SafetySweep, payment_id, &e).await,
        }
    }
    Ok(summary)
}

pub(super) async fn approvals(state: &SchedulerState) -> Result<JobSummary> {
    let swept = state.multisig.sweep(now_ts()).await?;
    let touched = swept.expired + swept.reconciled;
    Ok(JobSummary {
        scanned: touched,
        processed: touched,
        ..JobSummary::default()
    })
}
