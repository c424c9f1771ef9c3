//! Blockchain-sync watcher.
//!
//! Reconciles `active` escrows against the contract: settles releases whose
//! confirmation timed out, adopts releases and disputes that happened outside
//! the engine, and flags disagreements it must not resolve on its own.

use tracing::{info, warn};

use super::{row_failed, Job, JobSummary, RowResult, SchedulerState};
use crate::chain::{OnChainStatus, TxOutcome};
use crate::db;
use crate::errors::{CustodyError, Result};
use crate::events::PaymentEventKind;
use crate::models::{Escrow, EscrowStatus};

pub(super) async fn run(state: &SchedulerState) -> Result<JobSummary> {
    let mut summary = JobSummary::default();
    let active = db::escrows_with_status(&state.pool, EscrowStatus::Active).await?;
    summary.scanned = active.len() as u32;

    for escrow in &active {
        match reconcile(state, escrow).await {
            Ok(row) => summary.record(row),
            Err(e) => {
                row_failed(state, &mut summary, Job::BlockchainSync, escrow.payment_id, &e).await
            }
        }
    }
    Ok(summary)
}

async fn reconcile(state: &SchedulerState, escrow: &Escrow) -> Result<RowResult> {
    let Some(onchain_id) = escrow.smart_contract_escrow_id.as_deref() else {
        return Ok(RowResult::Skipped);
    };
    let contract = state.stages.contract();
    let pool = &state.pool;
    let payment_id = escrow.payment_id;

    if let Some(tx_hash) = escrow.release_tx_hash.as_deref() {
        return match contract.tx_outcome(tx_hash).await? {
            TxOutcome::Pending => Ok(RowResult::Skipped),
            TxOutcome::Confirmed => {
                db::mark_escrow_released(pool, escrow, Some(tx_hash)).await?;
                db::append_event(
                    pool,
                    payment_id,
                    PaymentEventKind::BlockchainSync,
                    &format!("release tx {tx_hash} confirmed late"),
                )
                .await?;
                info!(payment_id, %tx_hash, "Late release confirmation settled");
                Ok(RowResult::Processed)
            }
            TxOutcome::Reverted(reason) => {
                db::clear_release_tx(pool, escrow.id).await?;
                Err(CustodyError::Rejected(format!(
                    "release tx {tx_hash} reverted: {reason}"
                )))
            }
        };
    }

    let onchain = contract.escrow_state(onchain_id).await?;
    match onchain.status {
        OnChainStatus::Funded => Ok(RowResult::Skipped),
        OnChainStatus::Released => {
            if db::mark_escrow_released(pool, escrow, None).await? {
                db::append_event(
                    pool,
                    payment_id,
                    PaymentEventKind::BlockchainSync,
                    &format!("escrow {onchain_id} released out-of-band"),
                )
                .await?;
            }
            Ok(RowResult::Processed)
        }
        OnChainStatus::Disputed => {
            if db::transition_escrow(pool, escrow.id, EscrowStatus::Active, EscrowStatus::Disputed).await? {
                db::append_event(
                    pool,
                    payment_id,
                    PaymentEventKind::EscrowDisputed,
                    &format!("escrow {onchain_id} disputed on-chain"),
                )
                .await?;
            }
            Ok(RowResult::Processed)
        }
        other => {
            let detail = format!("escrow {onchain_id} is active locally but {other:?} on-chain");
            warn!(payment_id, "{detail}");
            db::append_event(pool, payment_id, PaymentEventKind::SyncInconsistent, &detail).await?;
            Err(CustodyError::Inconsistent(detail))
        }
    }
}
