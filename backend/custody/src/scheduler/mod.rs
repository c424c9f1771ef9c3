//! Payment lifecycle scheduler.
//!
//! Every job is an independent task that wakes on a jittered interval, scans
//! the rows in the status it owns and pushes each one forward through
//! [`Stages`].  The database claim is the only coordination between jobs and
//! between engine instances, so running several instances side by side is
//! safe.  A failing row is recorded as a `stage_failed` event (or
//! `stage_rejected` when retrying alone will not fix it) and left where it
//! was; it never aborts the rest of the batch.  Rejections that keep recurring
//! for the same payment and job are escalated to operators.

mod custody;
mod deposits;
mod payouts;
mod sweeps;
mod sync;

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bank::BankingRail;
use crate::config::ScheduleConfig;
use crate::db;
use crate::errors::{CustodyError, Result};
use crate::events::PaymentEventKind;
use crate::multisig::MultisigEngine;
use crate::router::TransactionRouter;
use crate::safety::SafetyService;
use crate::stages::Stages;

/// Everything a job needs, constructed once in `main`.
pub struct SchedulerState {
    pub pool: SqlitePool,
    pub bank: Arc<dyn BankingRail>,
    pub router: Arc<TransactionRouter>,
    pub stages: Arc<Stages>,
    pub multisig: Arc<MultisigEngine>,
    pub safety: Arc<SafetyService>,
    /// Consecutive rejections of one payment by one job before operators are alerted.
    pub escalate_after: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    Deposits,
    CustodyExpiry,
    Payouts,
    BlockchainSync,
    SafetySweep,
    ApprovalSweep,
}

impl Job {
    pub const ALL: [Job; 6] = [
        Job::Deposits,
        Job::CustodyExpiry,
        Job::Payouts,
        Job::BlockchainSync,
        Job::SafetySweep,
        Job::ApprovalSweep,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Deposits => "deposit_watcher",
            Self::CustodyExpiry => "custody_expiry_watcher",
            Self::Payouts => "payout_watcher",
            Self::BlockchainSync => "blockchain_sync_watcher",
            Self::SafetySweep => "safety_sweep",
            Self::ApprovalSweep => "approval_sweep",
        }
    }

    fn interval(&self, schedule: &ScheduleConfig) -> Duration {
        match self {
            Self::Deposits => schedule.deposit_interval,
            Self::CustodyExpiry => schedule.custody_interval,
            Self::Payouts => schedule.payout_interval,
            Self::BlockchainSync => schedule.sync_interval,
            Self::SafetySweep => schedule.safety_interval,
            Self::ApprovalSweep => schedule.approval_sweep_interval,
        }
    }
}

/// Per-run counters, logged after every run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub scanned: u32,
    pub processed: u32,
    pub skipped: u32,
    pub failed: u32,
}

/// What happened to one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowResult {
    Processed,
    Skipped,
}

impl JobSummary {
    fn record(&mut self, row: RowResult) {
        match row {
            RowResult::Processed => self.processed += 1,
            RowResult::Skipped => self.skipped += 1,
        }
    }
}

/// Spawn one task per job.  Tasks exit when `shutdown` is cancelled.
pub fn spawn_all(
    state: Arc<SchedulerState>,
    schedule: ScheduleConfig,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    Job::ALL
        .into_iter()
        .map(|job| {
            let period = job.interval(&schedule);
            tokio::spawn(run_job(
                job,
                state.clone(),
                period,
                schedule.jitter_pct,
                shutdown.clone(),
            ))
        })
        .collect()
}

async fn run_job(
    job: Job,
    state: Arc<SchedulerState>,
    period: Duration,
    jitter_pct: u8,
    shutdown: CancellationToken,
) {
    info!(job = job.name(), "Job starting, every {period:?} ±{jitter_pct}%");

    loop {
        let delay = jittered(period, jitter_pct, &mut rand::thread_rng());
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!(job = job.name(), "Job stopping");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        match run_once(job, &state).await {
            Ok(s) => info!(
                job = job.name(),
                scanned = s.scanned,
                processed = s.processed,
                skipped = s.skipped,
                failed = s.failed,
                "Job run complete"
            ),
            Err(e) => error!(job = job.name(), "Job run aborted: {e}"),
        }
    }
}

/// Execute a single run of `job`.  Errors returned here are batch-level (the
/// scan itself failed); row-level errors are counted in the summary.
pub async fn run_once(job: Job, state: &SchedulerState) -> Result<JobSummary> {
    match job {
        Job::Deposits => deposits::run(state).await,
        Job::CustodyExpiry => custody::run(state).await,
        Job::Payouts => payouts::run(state).await,
        Job::BlockchainSync => sync::run(state).await,
        Job::SafetySweep => sweeps::safety(state).await,
        Job::ApprovalSweep => sweeps::approvals(state).await,
    }
}

/// `period` shifted by a uniform random offset of at most `pct` percent.
fn jittered(period: Duration, pct: u8, rng: &mut impl Rng) -> Duration {
    let spread = period.as_millis() as u64 * u64::from(pct.min(100)) / 100;
    if spread == 0 {
        return period;
    }
    let base = period.as_millis() as u64;
    let offset = rng.gen_range(0..=2 * spread);
    Duration::from_millis(base - spread + offset)
}

/// Count and record a row-level failure without touching the row's status.
async fn row_failed(state: &SchedulerState, summary: &mut JobSummary, job: Job, payment_id: i64, err: &CustodyError) {
    summary.failed += 1;
    warn!(job = job.name(), payment_id, retryable = err.is_retryable(), "Row failed: {err}");
    if let Err(e) = record_failure(state, job, payment_id, err).await {
        error!(job = job.name(), payment_id, "Could not record stage failure: {e}");
    }
}

async fn record_failure(state: &SchedulerState, job: Job, payment_id: i64, err: &CustodyError) -> Result<()> {
    let pool = &state.pool;
    if err.is_retryable() {
        return db::append_event(
            pool,
            payment_id,
            PaymentEventKind::StageFailed,
            &format!("{}: {err}", job.name()),
        )
        .await;
    }

    db::append_event(
        pool,
        payment_id,
        PaymentEventKind::StageRejected,
        &format!("{}: {err}", job.name()),
    )
    .await?;
    let streak = db::rejection_streak(pool, payment_id, job.name()).await?;
    if streak < state.escalate_after {
        return Ok(());
    }

    let escalation = CustodyError::ExhaustedRetries(format!(
        "{} rejected payment {payment_id} {streak} times in a row",
        job.name()
    ));
    db::append_event(
        pool,
        payment_id,
        PaymentEventKind::ManualInterventionRequired,
        &format!("{}: {escalation}; last error: {err}", job.name()),
    )
    .await?;
    error!(
        target: "operator_alert",
        job = job.name(),
        payment_id,
        rejections = streak,
        last_error = %err,
        "{escalation}"
    );
    Ok(())
}
