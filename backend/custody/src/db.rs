//! Database layer: migrations, queries, and the conditional "claim" updates
//! that serialise concurrent workers.
//!
//! The database is the only synchronisation point of the engine.  Every
//! money-moving transition is gated by an `UPDATE … WHERE id = ? AND status = ?`
//! whose `rows_affected()` tells the caller whether it won the row; zero means
//! another worker already claimed it and the caller must move on.

use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, Executor, Sqlite, SqlitePool};
use tracing::info;

use crate::errors::{CustodyError, Result};
use crate::events::{PaymentEvent, PaymentEventKind};
use crate::models::{
    now_ts, ApprovalKind, ApprovalRequest, ApprovalStatus, Escrow, EscrowRecovery, EscrowStatus,
    Payment, PaymentStatus, RecoveryStatus, Signature,
};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    // Make sure the file is created if it doesn't exist yet.
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };
    let url = if url.contains(":memory:") || url.contains("mode=") {
        url
    } else if url.contains('?') {
        format!("{url}&mode=rwc")
    } else {
        format!("{url}?mode=rwc")
    };

    // Every connection to `:memory:` is its own database.
    let max_connections = if url.contains(":memory:") { 1 } else { 5 };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(&url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

// ─────────────────────────────────────────────────────────
// Audit log
// ─────────────────────────────────────────────────────────

/// Append one audit entry.  Accepts a pool or an open transaction.
pub async fn append_event<'e, E>(
    executor: E,
    payment_id: i64,
    kind: PaymentEventKind,
    description: &str,
) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO payment_events (payment_id, kind, description, created_at) VALUES (?1, ?2, ?3, ?4)",
    )
    .bind(payment_id)
    .bind(kind.as_str())
    .bind(description)
    .bind(now_ts())
    .execute(executor)
    .await?;
    Ok(())
}

/// All events for a payment in insertion order.
pub async fn events_for_payment(pool: &SqlitePool, payment_id: i64) -> Result<Vec<PaymentEvent>> {
    let rows = sqlx::query_as::<_, PaymentEvent>(
        r#"
        SELECT id, payment_id, kind, description, created_at
        FROM   payment_events
        WHERE  payment_id = ?1
        ORDER  BY id ASC
        "#,
    )
    .bind(payment_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Non-retryable failures `job` has recorded for a payment since the payment
/// last moved forward or was last escalated for that job.
pub async fn rejection_streak(pool: &SqlitePool, payment_id: i64, job: &str) -> Result<u32> {
    let prefix = format!("{job}:");
    let (count,): (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*)
        FROM   payment_events
        WHERE  payment_id = ?1
          AND  kind = 'stage_rejected'
          AND  instr(description, ?2) = 1
          AND  id > COALESCE((
                   SELECT MAX(id) FROM payment_events
                   WHERE  payment_id = ?1
                     AND  (kind IN ('payment_created', 'deposit_detected', 'bridge_withdrawal_initiated',
                                    'escrow_created', 'escrow_funded', 'escrow_released',
                                    'redemption_initiated', 'payout_completed')
                           OR (kind = 'manual_intervention_required' AND instr(description, ?2) = 1))
               ), 0)
        "#,
    )
    .bind(payment_id)
    .bind(prefix)
    .fetch_one(pool)
    .await?;
    Ok(count as u32)
}

// ─────────────────────────────────────────────────────────
// Payments & escrows
// ─────────────────────────────────────────────────────────

/// Deposit intent as registered by the payer-facing surface.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub amount: Decimal,
    pub currency: String,
    pub payer_id: String,
    pub payee_id: String,
    pub deposit_account: String,
    pub payout_account: String,
    pub payee_wallet: Option<String>,
    pub vertical: Option<String>,
}

/// Create a `pending` Payment together with its `pending` Escrow.
/// The whole amount is held in custody until `custody_end`.
pub async fn register_payment(
    pool: &SqlitePool,
    new: &NewPayment,
    custody_end: i64,
) -> Result<(Payment, Escrow)> {
    if new.amount <= Decimal::ZERO {
        return Err(CustodyError::Validation(format!(
            "payment amount must be positive, got {}",
            new.amount
        )));
    }

    let now = now_ts();
    let mut tx = pool.begin().await?;

    let payment_id = sqlx::query(
        r#"
        INSERT INTO payments
            (amount, currency, status, payer_id, payee_id, deposit_account,
             payout_account, payee_wallet, vertical, created_at, updated_at)
        VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
        "#,
    )
    .bind(new.amount.to_string())
    .bind(&new.currency)
    .bind(&new.payer_id)
    .bind(&new.payee_id)
    .bind(&new.deposit_account)
    .bind(&new.payout_account)
    .bind(&new.payee_wallet)
    .bind(&new.vertical)
    .bind(now)
    .execute(&mut *tx)
    .await?
    .last_insert_rowid();

    sqlx::query(
        r#"
        INSERT INTO escrows
            (payment_id, custody_amount, custody_end, release_amount, status, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?2, 'pending', ?4, ?4)
        "#,
    )
    .bind(payment_id)
    .bind(new.amount.to_string())
    .bind(custody_end)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    append_event(
        &mut *tx,
        payment_id,
        PaymentEventKind::PaymentCreated,
        &format!("{} {} awaiting deposit to {}", new.amount, new.currency, new.deposit_account),
    )
    .await?;

    tx.commit().await?;

    let payment = get_payment(pool, payment_id).await?;
    let escrow = get_escrow_for_payment(pool, payment_id).await?;
    Ok((payment, escrow))
}

const PAYMENT_COLUMNS: &str = "id, amount, currency, status, payer_id, payee_id, deposit_account, \
     payout_account, payee_wallet, vertical, deposit_ref, withdrawal_ref, redemption_ref, \
     payout_ref, created_at, updated_at";

const ESCROW_COLUMNS: &str = "id, payment_id, smart_contract_escrow_id, custody_amount, custody_end, \
     release_amount, status, create_tx_hash, fund_tx_hash, release_tx_hash, created_at, updated_at";

pub async fn get_payment(pool: &SqlitePool, payment_id: i64) -> Result<Payment> {
    sqlx::query_as::<_, Payment>(&format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = ?1"))
        .bind(payment_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| CustodyError::NotFound(format!("payment {payment_id}")))
}

pub async fn payments_with_status(pool: &SqlitePool, status: PaymentStatus) -> Result<Vec<Payment>> {
    let rows = sqlx::query_as::<_, Payment>(&format!(
        "SELECT {PAYMENT_COLUMNS} FROM payments WHERE status = ?1 ORDER BY id ASC"
    ))
    .bind(status.as_str())
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn get_escrow_for_payment(pool: &SqlitePool, payment_id: i64) -> Result<Escrow> {
    sqlx::query_as::<_, Escrow>(&format!(
        "SELECT {ESCROW_COLUMNS} FROM escrows WHERE payment_id = ?1"
    ))
    .bind(payment_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| CustodyError::NotFound(format!("escrow for payment {payment_id}")))
}

pub async fn escrows_with_status(pool: &SqlitePool, status: EscrowStatus) -> Result<Vec<Escrow>> {
    let rows = sqlx::query_as::<_, Escrow>(&format!(
        "SELECT {ESCROW_COLUMNS} FROM escrows WHERE status = ?1 ORDER BY id ASC"
    ))
    .bind(status.as_str())
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Active escrows whose custody window has closed and whose release has not
/// already been submitted.
pub async fn expired_custodies(pool: &SqlitePool, now: i64) -> Result<Vec<Escrow>> {
    let rows = sqlx::query_as::<_, Escrow>(&format!(
        r#"
        SELECT {ESCROW_COLUMNS} FROM escrows
        WHERE  status = 'active'
          AND  custody_end <= ?1
          AND  smart_contract_escrow_id IS NOT NULL
          AND  release_tx_hash IS NULL
        ORDER  BY custody_end ASC
        "#
    ))
    .bind(now)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Funded payments whose escrow never made it on-chain.
pub async fn stuck_payment_ids(pool: &SqlitePool) -> Result<Vec<i64>> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        r#"
        SELECT p.id
        FROM   payments p
        JOIN   escrows  e ON e.payment_id = p.id
        WHERE  p.status = 'funded'
          AND  e.smart_contract_escrow_id IS NULL
        ORDER  BY p.id ASC
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

// ─────────────────────────────────────────────────────────
// Claims
// ─────────────────────────────────────────────────────────

/// Generic status-guarded hand-off.  Returns `false` when the row was no
/// longer in `from`.
pub async fn claim_payment(
    pool: &SqlitePool,
    payment_id: i64,
    from: PaymentStatus,
    to: PaymentStatus,
) -> Result<bool> {
    let affected = sqlx::query(
        "UPDATE payments SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
    )
    .bind(to.as_str())
    .bind(now_ts())
    .bind(payment_id)
    .bind(from.as_str())
    .execute(pool)
    .await?
    .rows_affected();
    Ok(affected == 1)
}

/// Claim a `pending` payment for a matched deposit: `pending → funded`,
/// recording the deposit reference.  A deposit reference can only ever be
/// attached to one payment.
pub async fn claim_deposit(pool: &SqlitePool, payment_id: i64, deposit_ref: &str) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let affected = sqlx::query(
        r#"
        UPDATE payments
        SET    status = 'funded', deposit_ref = ?1, updated_at = ?2
        WHERE  id = ?3 AND status = 'pending' AND deposit_ref IS NULL
          AND  NOT EXISTS (SELECT 1 FROM payments WHERE deposit_ref = ?1)
        "#,
    )
    .bind(deposit_ref)
    .bind(now_ts())
    .bind(payment_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if affected == 1 {
        append_event(
            &mut *tx,
            payment_id,
            PaymentEventKind::DepositDetected,
            &format!("deposit {deposit_ref} matched"),
        )
        .await?;
    }
    tx.commit().await?;
    Ok(affected == 1)
}

/// Claim a released payment for payout: `released → processing`.  A payment
/// stuck in `processing` since before `stale_before` (crashed worker) can be
/// reclaimed; the persisted redemption/payout references keep that safe.
pub async fn claim_payout(pool: &SqlitePool, payment_id: i64, stale_before: i64) -> Result<bool> {
    let affected = sqlx::query(
        r#"
        UPDATE payments SET status = 'processing', updated_at = ?1
        WHERE  id = ?2
          AND  (status = 'released' OR (status = 'processing' AND updated_at < ?3))
        "#,
    )
    .bind(now_ts())
    .bind(payment_id)
    .bind(stale_before)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(affected == 1)
}

// ─────────────────────────────────────────────────────────
// Stage bookkeeping
// ─────────────────────────────────────────────────────────

/// Which banking-rail reference column to persist.
#[derive(Debug, Clone, Copy)]
pub enum BankRef {
    Withdrawal,
    Redemption,
    Payout,
}

impl BankRef {
    fn column(&self) -> &'static str {
        match self {
            Self::Withdrawal => "withdrawal_ref",
            Self::Redemption => "redemption_ref",
            Self::Payout => "payout_ref",
        }
    }
}

/// Persist a banking-rail reference once; later writes never overwrite it.
pub async fn set_bank_ref(
    pool: &SqlitePool,
    payment_id: i64,
    which: BankRef,
    reference: &str,
) -> Result<bool> {
    let col = which.column();
    let affected = sqlx::query(&format!(
        "UPDATE payments SET {col} = ?1, updated_at = ?2 WHERE id = ?3 AND {col} IS NULL"
    ))
    .bind(reference)
    .bind(now_ts())
    .bind(payment_id)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(affected == 1)
}

/// Escrow exists on-chain and holds the funds: Escrow `pending → active`,
/// Payment `funded → escrowed`, in one transaction.
pub async fn activate_escrow(
    pool: &SqlitePool,
    payment_id: i64,
    onchain_id: &str,
    create_tx: &str,
    fund_tx: Option<&str>,
) -> Result<bool> {
    let now = now_ts();
    let mut tx = pool.begin().await?;

    let escrow_rows = sqlx::query(
        r#"
        UPDATE escrows
        SET    smart_contract_escrow_id = ?1, create_tx_hash = ?2, fund_tx_hash = ?3,
               status = 'active', updated_at = ?4
        WHERE  payment_id = ?5 AND status = 'pending' AND smart_contract_escrow_id IS NULL
        "#,
    )
    .bind(onchain_id)
    .bind(create_tx)
    .bind(fund_tx)
    .bind(now)
    .bind(payment_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    let payment_rows = sqlx::query(
        "UPDATE payments SET status = 'escrowed', updated_at = ?1 WHERE id = ?2 AND status = 'funded'",
    )
    .bind(now)
    .bind(payment_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if escrow_rows != 1 || payment_rows != 1 {
        tx.rollback().await?;
        return Ok(false);
    }
    tx.commit().await?;
    Ok(true)
}

/// Claim an active escrow for release until `claim_until`.  Fails while
/// another worker holds the claim or a release tx is already out.
pub async fn claim_release(pool: &SqlitePool, escrow_id: i64, now: i64, claim_until: i64) -> Result<bool> {
    let affected = sqlx::query(
        r#"
        UPDATE escrows
        SET    release_claimed_until = ?1, updated_at = ?2
        WHERE  id = ?3
          AND  status = 'active'
          AND  release_tx_hash IS NULL
          AND  release_claimed_until <= ?2
        "#,
    )
    .bind(claim_until)
    .bind(now)
    .bind(escrow_id)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(affected == 1)
}

pub async fn drop_release_claim(pool: &SqlitePool, escrow_id: i64) -> Result<()> {
    sqlx::query("UPDATE escrows SET release_claimed_until = 0 WHERE id = ?1")
        .bind(escrow_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Remember a release tx whose confirmation timed out.  The custody watcher
/// skips escrows carrying one; the sync watcher settles it.
pub async fn mark_release_submitted(pool: &SqlitePool, escrow_id: i64, tx_hash: &str) -> Result<()> {
    sqlx::query(
        "UPDATE escrows SET release_tx_hash = ?1, updated_at = ?2 WHERE id = ?3 AND status = 'active'",
    )
    .bind(tx_hash)
    .bind(now_ts())
    .bind(escrow_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Forget a release tx that turned out to have reverted, so release is retried.
pub async fn clear_release_tx(pool: &SqlitePool, escrow_id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE escrows SET release_tx_hash = NULL, updated_at = ?1 WHERE id = ?2 AND status = 'active'",
    )
    .bind(now_ts())
    .bind(escrow_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Escrow `active → released` and Payment `escrowed → released`.
pub async fn mark_escrow_released(
    pool: &SqlitePool,
    escrow: &Escrow,
    tx_hash: Option<&str>,
) -> Result<bool> {
    let now = now_ts();
    let mut tx = pool.begin().await?;

    let escrow_rows = sqlx::query(
        r#"
        UPDATE escrows
        SET    status = 'released', release_tx_hash = COALESCE(?1, release_tx_hash), updated_at = ?2
        WHERE  id = ?3 AND status = 'active'
        "#,
    )
    .bind(tx_hash)
    .bind(now)
    .bind(escrow.id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if escrow_rows != 1 {
        tx.rollback().await?;
        return Ok(false);
    }

    sqlx::query(
        "UPDATE payments SET status = 'released', updated_at = ?1 WHERE id = ?2 AND status = 'escrowed'",
    )
    .bind(now)
    .bind(escrow.payment_id)
    .execute(&mut *tx)
    .await?;

    append_event(
        &mut *tx,
        escrow.payment_id,
        PaymentEventKind::EscrowReleased,
        &format!(
            "escrow {} released, tx {}",
            escrow.smart_contract_escrow_id.as_deref().unwrap_or("?"),
            tx_hash.unwrap_or("observed on-chain")
        ),
    )
    .await?;

    tx.commit().await?;
    Ok(true)
}

/// Status-guarded escrow transition.
pub async fn transition_escrow(
    pool: &SqlitePool,
    escrow_id: i64,
    from: EscrowStatus,
    to: EscrowStatus,
) -> Result<bool> {
    let affected = sqlx::query(
        "UPDATE escrows SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
    )
    .bind(to.as_str())
    .bind(now_ts())
    .bind(escrow_id)
    .bind(from.as_str())
    .execute(pool)
    .await?
    .rows_affected();
    Ok(affected == 1)
}

/// Close a dispute.  In favour of the seller the escrow is released and the
/// payment continues to payout; otherwise both rows end `refunded` and the
/// fiat refund is left to operators.
pub async fn settle_dispute(
    pool: &SqlitePool,
    escrow: &Escrow,
    in_favor_of_seller: bool,
    tx_hash: &str,
) -> Result<bool> {
    let (escrow_to, payment_to) = if in_favor_of_seller {
        (EscrowStatus::Released, PaymentStatus::Released)
    } else {
        (EscrowStatus::Refunded, PaymentStatus::Refunded)
    };
    let now = now_ts();
    let mut tx = pool.begin().await?;

    let escrow_rows = sqlx::query(
        r#"
        UPDATE escrows SET status = ?1, release_tx_hash = ?2, updated_at = ?3
        WHERE  id = ?4 AND status = 'disputed'
        "#,
    )
    .bind(escrow_to.as_str())
    .bind(tx_hash)
    .bind(now)
    .bind(escrow.id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if escrow_rows != 1 {
        tx.rollback().await?;
        return Ok(false);
    }

    sqlx::query(
        "UPDATE payments SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = 'escrowed'",
    )
    .bind(payment_to.as_str())
    .bind(now)
    .bind(escrow.payment_id)
    .execute(&mut *tx)
    .await?;

    let kind = if in_favor_of_seller {
        PaymentEventKind::EscrowReleased
    } else {
        PaymentEventKind::EscrowDisputed
    };
    append_event(
        &mut *tx,
        escrow.payment_id,
        kind,
        &format!(
            "dispute resolved in favour of {}, tx {tx_hash}",
            if in_favor_of_seller { "seller" } else { "buyer" }
        ),
    )
    .await?;

    tx.commit().await?;
    Ok(true)
}

/// Payout sent: Payment `processing → completed`, Escrow `released → completed`.
pub async fn complete_payout(pool: &SqlitePool, payment_id: i64, payout_ref: &str) -> Result<bool> {
    let now = now_ts();
    let mut tx = pool.begin().await?;

    let payment_rows = sqlx::query(
        "UPDATE payments SET status = 'completed', updated_at = ?1 WHERE id = ?2 AND status = 'processing'",
    )
    .bind(now)
    .bind(payment_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    let escrow_rows = sqlx::query(
        "UPDATE escrows SET status = 'completed', updated_at = ?1 WHERE payment_id = ?2 AND status = 'released'",
    )
    .bind(now)
    .bind(payment_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if payment_rows != 1 || escrow_rows != 1 {
        tx.rollback().await?;
        return Ok(false);
    }

    append_event(
        &mut *tx,
        payment_id,
        PaymentEventKind::PayoutCompleted,
        &format!("payout {payout_ref} sent"),
    )
    .await?;

    tx.commit().await?;
    Ok(true)
}

// ─────────────────────────────────────────────────────────
// Approval requests
// ─────────────────────────────────────────────────────────

const APPROVAL_COLUMNS: &str = "id, payment_id, kind, wallet_address, required_signatures, \
     current_signatures, status, amount, amount_usd, recipient, created_by, expires_at, \
     executed_tx_hash, executed_by, rejection_reason, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct NewApproval {
    pub payment_id: i64,
    pub kind: ApprovalKind,
    pub wallet_address: String,
    pub required_signatures: u32,
    pub amount: Decimal,
    pub amount_usd: Decimal,
    pub recipient: String,
    pub created_by: String,
    pub expires_at: i64,
}

pub async fn insert_approval(pool: &SqlitePool, new: &NewApproval) -> Result<ApprovalRequest> {
    let now = now_ts();
    let mut tx = pool.begin().await?;

    let id = sqlx::query(
        r#"
        INSERT INTO approval_requests
            (payment_id, kind, wallet_address, required_signatures, current_signatures, status,
             amount, amount_usd, recipient, created_by, expires_at, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, 0, 'pending', ?5, ?6, ?7, ?8, ?9, ?10, ?10)
        "#,
    )
    .bind(new.payment_id)
    .bind(new.kind.as_str())
    .bind(&new.wallet_address)
    .bind(i64::from(new.required_signatures))
    .bind(new.amount.to_string())
    .bind(new.amount_usd.to_string())
    .bind(&new.recipient)
    .bind(&new.created_by)
    .bind(new.expires_at)
    .bind(now)
    .execute(&mut *tx)
    .await?
    .last_insert_rowid();

    append_event(
        &mut *tx,
        new.payment_id,
        PaymentEventKind::ApprovalRequested,
        &format!(
            "approval {id} ({}) needs {} signatures on {}",
            new.kind, new.required_signatures, new.wallet_address
        ),
    )
    .await?;

    tx.commit().await?;
    get_approval(pool, id).await
}

pub async fn get_approval(pool: &SqlitePool, id: i64) -> Result<ApprovalRequest> {
    sqlx::query_as::<_, ApprovalRequest>(&format!(
        "SELECT {APPROVAL_COLUMNS} FROM approval_requests WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| CustodyError::NotFound(format!("approval request {id}")))
}

/// Most recent request of `kind` for a payment, if any.
pub async fn latest_approval(
    pool: &SqlitePool,
    payment_id: i64,
    kind: ApprovalKind,
) -> Result<Option<ApprovalRequest>> {
    let row = sqlx::query_as::<_, ApprovalRequest>(&format!(
        r#"
        SELECT {APPROVAL_COLUMNS} FROM approval_requests
        WHERE  payment_id = ?1 AND kind = ?2
        ORDER  BY id DESC
        LIMIT  1
        "#
    ))
    .bind(payment_id)
    .bind(kind.as_str())
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn approvals_with_status(
    pool: &SqlitePool,
    status: ApprovalStatus,
) -> Result<Vec<ApprovalRequest>> {
    let rows = sqlx::query_as::<_, ApprovalRequest>(&format!(
        "SELECT {APPROVAL_COLUMNS} FROM approval_requests WHERE status = ?1 ORDER BY id ASC"
    ))
    .bind(status.as_str())
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn signatures_for(pool: &SqlitePool, approval_id: i64) -> Result<Vec<Signature>> {
    let rows = sqlx::query_as::<_, Signature>(
        r#"
        SELECT id, approval_request_id, signer_address, signature, signed_at
        FROM   approval_signatures
        WHERE  approval_request_id = ?1
        ORDER  BY id ASC
        "#,
    )
    .bind(approval_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Outcome of persisting one signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureWrite {
    /// Stored; the request is still short of its threshold.
    Recorded { current: u32, required: u32 },
    /// Stored, and this signature crossed the threshold.
    ThresholdReached { required: u32 },
    /// This signer already signed this request; nothing changed.
    Duplicate,
    /// The request is no longer pending and not expired (already approved or
    /// beyond); nothing changed.
    NotPending(ApprovalStatus),
    /// The request passed its expiry; nothing changed.
    Expired,
}

/// Insert a signature and bump the counter atomically.  The status flips to
/// `approved` in the same statement that makes `current == required`.
pub async fn record_signature(
    pool: &SqlitePool,
    approval_id: i64,
    signer: &str,
    signature_hex: &str,
    now: i64,
) -> Result<SignatureWrite> {
    let mut tx = pool.begin().await?;

    let request = sqlx::query_as::<_, ApprovalRequest>(&format!(
        "SELECT {APPROVAL_COLUMNS} FROM approval_requests WHERE id = ?1"
    ))
    .bind(approval_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| CustodyError::NotFound(format!("approval request {approval_id}")))?;

    let already: Option<(i64,)> = sqlx::query_as(
        "SELECT id FROM approval_signatures WHERE approval_request_id = ?1 AND signer_address = ?2 COLLATE NOCASE",
    )
    .bind(approval_id)
    .bind(signer)
    .fetch_optional(&mut *tx)
    .await?;
    if already.is_some() {
        tx.rollback().await?;
        return Ok(SignatureWrite::Duplicate);
    }

    if request.status != ApprovalStatus::Pending {
        tx.rollback().await?;
        return Ok(SignatureWrite::NotPending(request.status));
    }
    if request.is_expired_at(now) {
        tx.rollback().await?;
        return Ok(SignatureWrite::Expired);
    }

    sqlx::query(
        r#"
        INSERT INTO approval_signatures (approval_request_id, signer_address, signature, signed_at)
        VALUES (?1, ?2, ?3, ?4)
        "#,
    )
    .bind(approval_id)
    .bind(signer)
    .bind(signature_hex)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    let affected = sqlx::query(
        r#"
        UPDATE approval_requests
        SET    current_signatures = current_signatures + 1,
               status = CASE WHEN current_signatures + 1 >= required_signatures
                             THEN 'approved' ELSE status END,
               updated_at = ?1
        WHERE  id = ?2 AND status = 'pending' AND current_signatures < required_signatures
        "#,
    )
    .bind(now)
    .bind(approval_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if affected != 1 {
        tx.rollback().await?;
        return Ok(SignatureWrite::NotPending(request.status));
    }

    let current = request.current_signatures + 1;
    let required = request.required_signatures;
    append_event(
        &mut *tx,
        request.payment_id,
        PaymentEventKind::ApprovalSigned,
        &format!("approval {approval_id} signed by {signer} ({current}/{required})"),
    )
    .await?;
    if current >= required {
        append_event(
            &mut *tx,
            request.payment_id,
            PaymentEventKind::ApprovalGranted,
            &format!("approval {approval_id} reached {required} signatures"),
        )
        .await?;
    }

    tx.commit().await?;

    if current >= required {
        Ok(SignatureWrite::ThresholdReached { required })
    } else {
        Ok(SignatureWrite::Recorded { current, required })
    }
}

/// `pending → rejected`.
pub async fn reject_approval(pool: &SqlitePool, approval_id: i64, reason: &str) -> Result<bool> {
    let affected = sqlx::query(
        r#"
        UPDATE approval_requests SET status = 'rejected', rejection_reason = ?1, updated_at = ?2
        WHERE  id = ?3 AND status = 'pending'
        "#,
    )
    .bind(reason)
    .bind(now_ts())
    .bind(approval_id)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(affected == 1)
}

/// `approved → executed`.
pub async fn mark_approval_executed(
    pool: &SqlitePool,
    approval_id: i64,
    tx_hash: &str,
    executor: &str,
) -> Result<bool> {
    let affected = sqlx::query(
        r#"
        UPDATE approval_requests
        SET    status = 'executed', executed_tx_hash = ?1, executed_by = ?2, updated_at = ?3
        WHERE  id = ?4 AND status = 'approved'
        "#,
    )
    .bind(tx_hash)
    .bind(executor)
    .bind(now_ts())
    .bind(approval_id)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(affected == 1)
}

/// Expire one pending request past its deadline.
pub async fn expire_approval(pool: &SqlitePool, approval_id: i64, now: i64) -> Result<bool> {
    let affected = sqlx::query(
        r#"
        UPDATE approval_requests SET status = 'expired', updated_at = ?1
        WHERE  id = ?2 AND status = 'pending' AND expires_at <= ?1
        "#,
    )
    .bind(now)
    .bind(approval_id)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(affected == 1)
}

pub async fn overdue_approvals(pool: &SqlitePool, now: i64) -> Result<Vec<ApprovalRequest>> {
    let rows = sqlx::query_as::<_, ApprovalRequest>(&format!(
        "SELECT {APPROVAL_COLUMNS} FROM approval_requests WHERE status = 'pending' AND expires_at <= ?1 ORDER BY id ASC"
    ))
    .bind(now)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Escrow recovery ledger
// ─────────────────────────────────────────────────────────

const RECOVERY_COLUMNS: &str = "payment_id, attempts, status, pending_escrow_id, pending_create_tx, \
     pending_fund_tx, last_error, locked_until, updated_at";

pub async fn get_recovery(pool: &SqlitePool, payment_id: i64) -> Result<Option<EscrowRecovery>> {
    let row = sqlx::query_as::<_, EscrowRecovery>(&format!(
        "SELECT {RECOVERY_COLUMNS} FROM escrow_recoveries WHERE payment_id = ?1"
    ))
    .bind(payment_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Take the provisioning lease for a payment until `lease_until`.  Creates the
/// recovery row on first use.  Returns `false` while another worker holds it.
pub async fn acquire_provisioning_lease(
    pool: &SqlitePool,
    payment_id: i64,
    now: i64,
    lease_until: i64,
) -> Result<bool> {
    let affected = sqlx::query(
        r#"
        INSERT INTO escrow_recoveries (payment_id, attempts, status, locked_until, updated_at)
        VALUES (?1, 0, 'pending_retry', ?2, ?3)
        ON CONFLICT (payment_id) DO UPDATE
            SET locked_until = excluded.locked_until, updated_at = excluded.updated_at
            WHERE escrow_recoveries.locked_until <= ?3
        "#,
    )
    .bind(payment_id)
    .bind(lease_until)
    .bind(now)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(affected == 1)
}

pub async fn release_provisioning_lease(pool: &SqlitePool, payment_id: i64) -> Result<()> {
    sqlx::query("UPDATE escrow_recoveries SET locked_until = 0 WHERE payment_id = ?1")
        .bind(payment_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Persist the create tx before waiting on it, so a crash mid-confirmation
/// resumes from the receipt instead of creating a second escrow.
pub async fn save_pending_create(
    pool: &SqlitePool,
    payment_id: i64,
    create_tx: &str,
    escrow_id: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE escrow_recoveries
        SET    pending_create_tx = ?1, pending_escrow_id = COALESCE(?2, pending_escrow_id), updated_at = ?3
        WHERE  payment_id = ?4
        "#,
    )
    .bind(create_tx)
    .bind(escrow_id)
    .bind(now_ts())
    .bind(payment_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Drop a pending create tx that reverted, so the next attempt re-creates.
pub async fn clear_pending_create(pool: &SqlitePool, payment_id: i64) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE escrow_recoveries
        SET    pending_create_tx = NULL, pending_escrow_id = NULL, pending_fund_tx = NULL,
               updated_at = ?1
        WHERE  payment_id = ?2
        "#,
    )
    .bind(now_ts())
    .bind(payment_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Remember a fund tx whose confirmation timed out.  Resuming checks its
/// outcome instead of sending a second fund.
pub async fn save_pending_fund(pool: &SqlitePool, payment_id: i64, fund_tx: &str) -> Result<()> {
    sqlx::query(
        "UPDATE escrow_recoveries SET pending_fund_tx = ?1, updated_at = ?2 WHERE payment_id = ?3",
    )
    .bind(fund_tx)
    .bind(now_ts())
    .bind(payment_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Drop a pending fund tx that reverted, so the next attempt funds again.
pub async fn clear_pending_fund(pool: &SqlitePool, payment_id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE escrow_recoveries SET pending_fund_tx = NULL, updated_at = ?1 WHERE payment_id = ?2",
    )
    .bind(now_ts())
    .bind(payment_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Count one failed recovery attempt.  The row flips to
/// `max_retries_reached` on the attempt that hits `max_attempts`.
pub async fn record_recovery_failure(
    pool: &SqlitePool,
    payment_id: i64,
    error: &str,
    max_attempts: u32,
) -> Result<EscrowRecovery> {
    let now = now_ts();
    sqlx::query(
        r#"
        INSERT INTO escrow_recoveries (payment_id, attempts, status, last_error, updated_at)
        VALUES (?1, 1, CASE WHEN 1 >= ?2 THEN 'max_retries_reached' ELSE 'pending_retry' END, ?3, ?4)
        ON CONFLICT (payment_id) DO UPDATE
            SET attempts   = escrow_recoveries.attempts + 1,
                status     = CASE WHEN escrow_recoveries.attempts + 1 >= ?2
                                  THEN 'max_retries_reached' ELSE 'pending_retry' END,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            WHERE escrow_recoveries.status = 'pending_retry'
        "#,
    )
    .bind(payment_id)
    .bind(i64::from(max_attempts))
    .bind(error)
    .bind(now)
    .execute(pool)
    .await?;

    get_recovery(pool, payment_id)
        .await?
        .ok_or_else(|| CustodyError::NotFound(format!("recovery for payment {payment_id}")))
}

pub async fn mark_recovered(pool: &SqlitePool, payment_id: i64) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE escrow_recoveries
        SET    status = 'recovered', pending_create_tx = NULL, pending_escrow_id = NULL,
               pending_fund_tx = NULL, last_error = NULL, locked_until = 0, updated_at = ?1
        WHERE  payment_id = ?2
        "#,
    )
    .bind(now_ts())
    .bind(payment_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn recoveries_with_status(
    pool: &SqlitePool,
    status: RecoveryStatus,
) -> Result<Vec<EscrowRecovery>> {
    let rows = sqlx::query_as::<_, EscrowRecovery>(&format!(
        "SELECT {RECOVERY_COLUMNS} FROM escrow_recoveries WHERE status = ?1 ORDER BY payment_id ASC"
    ))
    .bind(status.as_str())
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    async fn pool() -> SqlitePool {
        init_pool("sqlite::memory:").await.unwrap()
    }

    fn new_payment(amount: &str) -> NewPayment {
        NewPayment {
            amount: Decimal::from_str(amount).unwrap(),
            currency: "MXN".into(),
            payer_id: "payer-1".into(),
            payee_id: "payee-1".into(),
            deposit_account: "646180157000000001".into(),
            payout_account: "bank-acct-1".into(),
            payee_wallet: Some("0xPAYEE".into()),
            vertical: None,
        }
    }

    #[tokio::test]
    async fn register_creates_pending_pair_and_event() {
        let pool = pool().await;
        let (payment, escrow) = register_payment(&pool, &new_payment("1500.00"), 1_000)
            .await
            .unwrap();

        assert_eq!(payment.status, PaymentStatus::Pending);
        assert_eq!(escrow.status, EscrowStatus::Pending);
        assert_eq!(escrow.custody_amount, payment.amount);
        assert!(escrow.smart_contract_escrow_id.is_none());

        let events = events_for_payment(&pool, payment.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, PaymentEventKind::PaymentCreated);
    }

    #[tokio::test]
    async fn register_rejects_non_positive_amount() {
        let pool = pool().await;
        let err = register_payment(&pool, &new_payment("0"), 1_000).await.unwrap_err();
        assert!(matches!(err, CustodyError::Validation(_)));
    }

    #[tokio::test]
    async fn concurrent_deposit_claims_yield_one_winner() {
        let pool = pool().await;
        let (payment, _) = register_payment(&pool, &new_payment("100"), 1_000).await.unwrap();

        let (a, b) = tokio::join!(
            claim_deposit(&pool, payment.id, "dep-1"),
            claim_deposit(&pool, payment.id, "dep-1"),
        );
        let wins = [a.unwrap(), b.unwrap()].iter().filter(|w| **w).count();
        assert_eq!(wins, 1);

        let stored = get_payment(&pool, payment.id).await.unwrap();
        assert_eq!(stored.status, PaymentStatus::Funded);
        assert_eq!(stored.deposit_ref.as_deref(), Some("dep-1"));
    }

    #[tokio::test]
    async fn deposit_ref_is_never_attached_twice() {
        let pool = pool().await;
        let (first, _) = register_payment(&pool, &new_payment("100"), 1_000).await.unwrap();
        let (second, _) = register_payment(&pool, &new_payment("100"), 1_000).await.unwrap();

        assert!(claim_deposit(&pool, first.id, "dep-7").await.unwrap());
        assert!(!claim_deposit(&pool, second.id, "dep-7").await.unwrap());
        assert_eq!(
            get_payment(&pool, second.id).await.unwrap().status,
            PaymentStatus::Pending
        );
    }

    #[tokio::test]
    async fn activation_requires_funded_payment_and_bare_escrow() {
        let pool = pool().await;
        let (payment, _) = register_payment(&pool, &new_payment("100"), 1_000).await.unwrap();

        // Still pending: no activation.
        assert!(!activate_escrow(&pool, payment.id, "7", "0xc", Some("0xf")).await.unwrap());

        claim_deposit(&pool, payment.id, "dep-1").await.unwrap();
        assert!(activate_escrow(&pool, payment.id, "7", "0xc", Some("0xf")).await.unwrap());
        // Second activation is a no-op.
        assert!(!activate_escrow(&pool, payment.id, "8", "0xc2", Some("0xf2")).await.unwrap());

        let escrow = get_escrow_for_payment(&pool, payment.id).await.unwrap();
        assert_eq!(escrow.status, EscrowStatus::Active);
        assert_eq!(escrow.smart_contract_escrow_id.as_deref(), Some("7"));
        assert_eq!(
            get_payment(&pool, payment.id).await.unwrap().status,
            PaymentStatus::Escrowed
        );
    }

    #[tokio::test]
    async fn bank_refs_are_write_once() {
        let pool = pool().await;
        let (payment, _) = register_payment(&pool, &new_payment("100"), 1_000).await.unwrap();

        assert!(set_bank_ref(&pool, payment.id, BankRef::Withdrawal, "w-1").await.unwrap());
        assert!(!set_bank_ref(&pool, payment.id, BankRef::Withdrawal, "w-2").await.unwrap());
        assert_eq!(
            get_payment(&pool, payment.id).await.unwrap().withdrawal_ref.as_deref(),
            Some("w-1")
        );
    }

    #[tokio::test]
    async fn provisioning_lease_is_exclusive_until_expiry() {
        let pool = pool().await;
        let (payment, _) = register_payment(&pool, &new_payment("100"), 1_000).await.unwrap();

        assert!(acquire_provisioning_lease(&pool, payment.id, 100, 400).await.unwrap());
        assert!(!acquire_provisioning_lease(&pool, payment.id, 200, 500).await.unwrap());
        assert!(acquire_provisioning_lease(&pool, payment.id, 400, 700).await.unwrap());

        release_provisioning_lease(&pool, payment.id).await.unwrap();
        assert!(acquire_provisioning_lease(&pool, payment.id, 401, 800).await.unwrap());
    }

    #[tokio::test]
    async fn release_claim_is_exclusive_until_expiry() {
        let pool = pool().await;
        let (payment, _) = register_payment(&pool, &new_payment("100"), 1_000).await.unwrap();
        claim_deposit(&pool, payment.id, "dep-1").await.unwrap();
        activate_escrow(&pool, payment.id, "7", "0xc", Some("0xf")).await.unwrap();
        let escrow = get_escrow_for_payment(&pool, payment.id).await.unwrap();

        let (a, b) = tokio::join!(
            claim_release(&pool, escrow.id, 100, 1_000),
            claim_release(&pool, escrow.id, 100, 1_000),
        );
        assert_eq!([a.unwrap(), b.unwrap()].iter().filter(|w| **w).count(), 1);
        assert!(!claim_release(&pool, escrow.id, 500, 1_400).await.unwrap());
        assert!(claim_release(&pool, escrow.id, 1_000, 1_900).await.unwrap());

        drop_release_claim(&pool, escrow.id).await.unwrap();
        assert!(claim_release(&pool, escrow.id, 1_001, 1_901).await.unwrap());

        // Once a release tx is recorded nobody claims again.
        drop_release_claim(&pool, escrow.id).await.unwrap();
        mark_release_submitted(&pool, escrow.id, "0xrel").await.unwrap();
        assert!(!claim_release(&pool, escrow.id, 2_000, 2_900).await.unwrap());
    }

    #[tokio::test]
    async fn recovery_failures_hit_ceiling_on_third_attempt() {
        let pool = pool().await;
        let (payment, _) = register_payment(&pool, &new_payment("100"), 1_000).await.unwrap();

        let r1 = record_recovery_failure(&pool, payment.id, "rpc down", 3).await.unwrap();
        assert_eq!((r1.attempts, r1.status), (1, RecoveryStatus::PendingRetry));
        let r2 = record_recovery_failure(&pool, payment.id, "rpc down", 3).await.unwrap();
        assert_eq!((r2.attempts, r2.status), (2, RecoveryStatus::PendingRetry));
        let r3 = record_recovery_failure(&pool, payment.id, "rpc down", 3).await.unwrap();
        assert_eq!((r3.attempts, r3.status), (3, RecoveryStatus::MaxRetriesReached));

        // Past the ceiling the counter stops moving.
        let r4 = record_recovery_failure(&pool, payment.id, "rpc down", 3).await.unwrap();
        assert_eq!(r4.attempts, 3);
    }

    #[tokio::test]
    async fn stuck_detection_finds_funded_without_onchain_id() {
        let pool = pool().await;
        let (stuck, _) = register_payment(&pool, &new_payment("100"), 1_000).await.unwrap();
        let (healthy, _) = register_payment(&pool, &new_payment("200"), 1_000).await.unwrap();
        let (_waiting, _) = register_payment(&pool, &new_payment("300"), 1_000).await.unwrap();

        claim_deposit(&pool, stuck.id, "dep-a").await.unwrap();
        claim_deposit(&pool, healthy.id, "dep-b").await.unwrap();
        activate_escrow(&pool, healthy.id, "9", "0xc", Some("0xf")).await.unwrap();

        assert_eq!(stuck_payment_ids(&pool).await.unwrap(), vec![stuck.id]);
    }
}
