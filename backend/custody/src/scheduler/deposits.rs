//! Deposit watcher: `pending → funded → escrowed`.

use std::collections::HashSet;

use tracing::{debug, info};

use super::{row_failed, Job, JobSummary, RowResult, SchedulerState};
use crate::bank::BankTransaction;
use crate::db;
use crate::errors::Result;
use crate::models::{Payment, PaymentStatus};
use crate::stages::ProvisionOutcome;

pub(super) async fn run(state: &SchedulerState) -> Result<JobSummary> {
    let mut summary = JobSummary::default();

    let pending = db::payments_with_status(&state.pool, PaymentStatus::Pending).await?;
    summary.scanned = pending.len() as u32;
    if pending.is_empty() {
        return Ok(summary);
    }

    let deposits: Vec<BankTransaction> = state
        .bank
        .list_transactions()
        .await?
        .into_iter()
        .filter(BankTransaction::is_settled_deposit)
        .collect();
    debug!(deposits = deposits.len(), pending = pending.len(), "Matching deposits");

    let mut matched: HashSet<i64> = HashSet::new();
    for deposit in &deposits {
        let Some(payment) = find_match(&pending, &matched, deposit) else {
            continue;
        };

        if !db::claim_deposit(&state.pool, payment.id, &deposit.id).await? {
            // Deposit already attached elsewhere or payment claimed by another worker.
            summary.record(RowResult::Skipped);
            continue;
        }
        matched.insert(payment.id);
        info!(payment_id = payment.id, deposit = %deposit.id, amount = %deposit.amount, "Deposit claimed");

        match state.stages.provision(payment.id).await {
            Ok(ProvisionOutcome::Activated { .. }) | Ok(ProvisionOutcome::AlreadyProvisioned) => {
                summary.record(RowResult::Processed)
            }
            Ok(ProvisionOutcome::Busy) | Ok(ProvisionOutcome::Deferred { .. }) => {
                summary.record(RowResult::Skipped)
            }
            // Left `funded` without an escrow: the safety sweep takes over.
            Err(e) => row_failed(state, &mut summary, Job::Deposits, payment.id, &e).await,
        }
    }

    Ok(summary)
}

/// Oldest unmatched pending payment with the deposit's amount and account.
fn find_match<'a>(
    pending: &'a [Payment],
    matched: &HashSet<i64>,
    deposit: &BankTransaction,
) -> Option<&'a Payment> {
    pending.iter().find(|p| {
        !matched.contains(&p.id)
            && p.amount == deposit.amount
            && p.deposit_account == deposit.account_ref
    })
}
