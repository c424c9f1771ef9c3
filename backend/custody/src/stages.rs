//! Single-payment stage transitions.
//!
//! Each stage re-reads the rows it acts on, checks persisted state before any
//! external call, and writes the external reference back as soon as it has
//! one.  Running a stage twice for the same payment therefore never moves
//! money twice: a repeated call either finds the work already done or resumes
//! from the last persisted step.

use std::sync::Arc;

use rust_decimal::Decimal;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::bank::BankingRail;
use crate::chain::{CreateEscrowParams, CreatedEscrow, EscrowContract, OnChainStatus, TxOutcome};
use crate::config::Config;
use crate::db::{self, BankRef};
use crate::errors::{ChainError, CustodyError, Result};
use crate::events::PaymentEventKind;
use crate::models::{now_ts, Escrow, EscrowStatus, Payment, PaymentStatus};

/// How long one worker may hold the provisioning lease.  Covers a create and a
/// fund confirmation wait plus the allowance transactions.
const PROVISION_LEASE_SECS: i64 = 900;
/// How long one worker may hold the release claim on an escrow.
const RELEASE_CLAIM_SECS: i64 = 900;
/// A `processing` payout claim older than this belongs to a dead worker.
const PAYOUT_CLAIM_STALE_SECS: i64 = 900;
/// Minimum time left on an escrow deadline when it is (re-)created late.
const MIN_DEADLINE_SECS: i64 = 3600;

#[derive(Debug, Clone)]
pub struct StageSettings {
    pub token_address: String,
    pub bridge_wallet: String,
    pub token_asset: String,
    pub redemption_account: String,
}

impl StageSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            token_address: config.chain.token_address.clone(),
            bridge_wallet: config.chain.bridge_wallet.clone(),
            token_asset: config.bank.token_asset.clone(),
            redemption_account: config.bank.redemption_account.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    Activated { escrow_id: String },
    /// The escrow already carries an on-chain id; nothing was done.
    AlreadyProvisioned,
    /// Another worker holds the provisioning lease.
    Busy,
    /// A submitted transaction has not confirmed yet; re-evaluated next tick.
    Deferred { tx_hash: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released { tx_hash: String },
    AlreadyReleased,
    /// Release submitted but not confirmed; the sync watcher settles it.
    Pending { tx_hash: String },
    /// Another worker holds the release claim.
    Busy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayoutOutcome {
    Completed { payout_ref: String },
    Busy,
}

enum Step<T> {
    Done(T),
    Deferred(String),
}

pub struct Stages {
    pool: SqlitePool,
    contract: Arc<dyn EscrowContract>,
    bank: Arc<dyn BankingRail>,
    settings: StageSettings,
}

impl Stages {
    pub fn new(
        pool: SqlitePool,
        contract: Arc<dyn EscrowContract>,
        bank: Arc<dyn BankingRail>,
        settings: StageSettings,
    ) -> Self {
        Self {
            pool,
            contract,
            bank,
            settings,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn contract(&self) -> &Arc<dyn EscrowContract> {
        &self.contract
    }

    // ─────────────────────────────────────────────────────────
    // funded → escrowed
    // ─────────────────────────────────────────────────────────

    /// Bridge the deposit to tokens, create the on-chain escrow and fund it.
    pub async fn provision(&self, payment_id: i64) -> Result<ProvisionOutcome> {
        let payment = db::get_payment(&self.pool, payment_id).await?;
        let escrow = db::get_escrow_for_payment(&self.pool, payment_id).await?;

        if escrow.smart_contract_escrow_id.is_some() {
            return Ok(ProvisionOutcome::AlreadyProvisioned);
        }
        if payment.status != PaymentStatus::Funded {
            return Err(CustodyError::Validation(format!(
                "payment {payment_id} is {}, expected funded",
                payment.status
            )));
        }

        let now = now_ts();
        if !db::acquire_provisioning_lease(&self.pool, payment_id, now, now + PROVISION_LEASE_SECS).await? {
            debug!(payment_id, "Provisioning already in progress elsewhere");
            return Ok(ProvisionOutcome::Busy);
        }

        let result = self.provision_leased(&payment, &escrow).await;
        if let Err(e) = db::release_provisioning_lease(&self.pool, payment_id).await {
            warn!(payment_id, "Failed to release provisioning lease: {e}");
        }
        result
    }

    async fn provision_leased(&self, payment: &Payment, escrow: &Escrow) -> Result<ProvisionOutcome> {
        let id = payment.id;

        if payment.withdrawal_ref.is_none() {
            let reference = self
                .bank
                .withdraw(
                    escrow.custody_amount,
                    &self.settings.token_asset,
                    &self.settings.bridge_wallet,
                    &idempotency_key(id, "withdrawal"),
                )
                .await?;
            db::set_bank_ref(&self.pool, id, BankRef::Withdrawal, &reference).await?;
            db::append_event(
                &self.pool,
                id,
                PaymentEventKind::BridgeWithdrawalInitiated,
                &format!(
                    "{} {} sent to bridge wallet, ref {reference}",
                    escrow.custody_amount, self.settings.token_asset
                ),
            )
            .await?;
        }

        let created = match self.created_escrow(payment, escrow).await? {
            Step::Done(c) => c,
            Step::Deferred(tx_hash) => return Ok(ProvisionOutcome::Deferred { tx_hash }),
        };

        let fund_tx = match self.fund(id, &created.escrow_id, escrow.custody_amount).await? {
            Step::Done(tx) => tx,
            Step::Deferred(tx_hash) => return Ok(ProvisionOutcome::Deferred { tx_hash }),
        };

        if !db::activate_escrow(
            &self.pool,
            id,
            &created.escrow_id,
            &created.tx_hash,
            fund_tx.as_deref(),
        )
        .await?
        {
            return Err(CustodyError::Inconsistent(format!(
                "payment {id} changed state while escrow {} was provisioned",
                created.escrow_id
            )));
        }
        db::append_event(
            &self.pool,
            id,
            PaymentEventKind::EscrowFunded,
            &format!(
                "escrow {} holds {}, fund tx {}",
                created.escrow_id,
                escrow.custody_amount,
                fund_tx.as_deref().unwrap_or("already funded")
            ),
        )
        .await?;
        db::mark_recovered(&self.pool, id).await?;

        info!(payment_id = id, escrow_id = %created.escrow_id, "Custody active");
        Ok(ProvisionOutcome::Activated {
            escrow_id: created.escrow_id,
        })
    }

    /// Resume from whatever the recovery ledger remembers: a known escrow id,
    /// an unconfirmed create tx, or nothing.
    async fn created_escrow(&self, payment: &Payment, escrow: &Escrow) -> Result<Step<CreatedEscrow>> {
        let id = payment.id;
        let (pending_id, pending_tx) = db::get_recovery(&self.pool, id)
            .await?
            .map(|r| (r.pending_escrow_id, r.pending_create_tx))
            .unwrap_or((None, None));

        if let Some(escrow_id) = pending_id {
            debug!(payment_id = id, %escrow_id, "Resuming created-but-unfunded escrow");
            return Ok(Step::Done(CreatedEscrow {
                escrow_id,
                tx_hash: pending_tx.unwrap_or_default(),
            }));
        }

        let tx_hash = match pending_tx {
            Some(tx) => tx,
            None => {
                let params = self.create_params(payment, escrow)?;
                let tx = self.contract.submit_create(&params).await?;
                db::save_pending_create(&self.pool, id, &tx, None).await?;
                tx
            }
        };

        match self.contract.created_escrow_from_tx(&tx_hash).await {
            Ok(created) => {
                db::save_pending_create(&self.pool, id, &created.tx_hash, Some(&created.escrow_id))
                    .await?;
                db::append_event(
                    &self.pool,
                    id,
                    PaymentEventKind::EscrowCreated,
                    &format!("escrow {} created, tx {}", created.escrow_id, created.tx_hash),
                )
                .await?;
                Ok(Step::Done(created))
            }
            Err(ChainError::Inconclusive { tx_hash }) => Ok(Step::Deferred(tx_hash)),
            Err(e @ ChainError::Reverted { .. }) => {
                // Nothing exists on-chain; the next attempt creates afresh.
                db::clear_pending_create(&self.pool, id).await?;
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fund unless the contract already reports the escrow funded.  A fund tx
    /// an earlier attempt left unconfirmed is settled before anything is sent.
    async fn fund(&self, payment_id: i64, escrow_id: &str, amount: Decimal) -> Result<Step<Option<String>>> {
        let pending = db::get_recovery(&self.pool, payment_id)
            .await?
            .and_then(|r| r.pending_fund_tx);
        if let Some(tx_hash) = pending {
            match self.contract.tx_outcome(&tx_hash).await? {
                TxOutcome::Pending => return Ok(Step::Deferred(tx_hash)),
                TxOutcome::Confirmed => return Ok(Step::Done(Some(tx_hash))),
                TxOutcome::Reverted(reason) => {
                    warn!(payment_id, %tx_hash, "Fund tx reverted, funding again: {reason}");
                    db::clear_pending_fund(&self.pool, payment_id).await?;
                }
            }
        }

        let state = self.contract.escrow_state(escrow_id).await?;
        match state.status {
            OnChainStatus::Created => {}
            OnChainStatus::Funded => {
                info!(%escrow_id, "Escrow already funded on-chain, skipping fund");
                return Ok(Step::Done(None));
            }
            other => {
                return Err(CustodyError::Inconsistent(format!(
                    "escrow {escrow_id} is {other:?} on-chain before funding"
                )))
            }
        }

        match self
            .contract
            .fund_escrow(escrow_id, &self.settings.token_address, amount)
            .await
        {
            Ok(tx) => Ok(Step::Done(Some(tx))),
            Err(ChainError::Inconclusive { tx_hash }) => {
                db::save_pending_fund(&self.pool, payment_id, &tx_hash).await?;
                Ok(Step::Deferred(tx_hash))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn create_params(&self, payment: &Payment, escrow: &Escrow) -> Result<CreateEscrowParams> {
        let payee = payment
            .payee_wallet
            .clone()
            .filter(|w| !w.trim().is_empty())
            .ok_or_else(|| {
                CustodyError::Validation(format!("payment {} has no payee wallet", payment.id))
            })?;
        Ok(CreateEscrowParams {
            payer: self.settings.bridge_wallet.clone(),
            payee,
            token: self.settings.token_address.clone(),
            amount: escrow.custody_amount,
            deadline: escrow.custody_end.max(now_ts() + MIN_DEADLINE_SECS),
            vertical: payment.vertical.clone().unwrap_or_else(|| "general".into()),
            clabe: payment.deposit_account.clone(),
            conditions: format!("custody until {}", escrow.custody_end),
        })
    }

    // ─────────────────────────────────────────────────────────
    // escrowed → released
    // ─────────────────────────────────────────────────────────

    pub async fn release(&self, payment_id: i64) -> Result<ReleaseOutcome> {
        let escrow = db::get_escrow_for_payment(&self.pool, payment_id).await?;
        match escrow.status {
            EscrowStatus::Active => {}
            EscrowStatus::Released | EscrowStatus::Completed => return Ok(ReleaseOutcome::AlreadyReleased),
            other => {
                return Err(CustodyError::Validation(format!(
                    "escrow {} is {other}, cannot release",
                    escrow.id
                )))
            }
        }
        if let Some(tx_hash) = escrow.release_tx_hash.clone() {
            return Ok(ReleaseOutcome::Pending { tx_hash });
        }
        let onchain_id = escrow.smart_contract_escrow_id.as_deref().ok_or_else(|| {
            CustodyError::Inconsistent(format!("active escrow {} has no on-chain id", escrow.id))
        })?;

        let now = now_ts();
        if !db::claim_release(&self.pool, escrow.id, now, now + RELEASE_CLAIM_SECS).await? {
            debug!(payment_id, "Release already in progress elsewhere");
            return Ok(ReleaseOutcome::Busy);
        }

        let result = self.release_claimed(&escrow, onchain_id).await;
        if let Err(e) = db::drop_release_claim(&self.pool, escrow.id).await {
            warn!(payment_id, "Failed to drop release claim: {e}");
        }
        result
    }

    async fn release_claimed(&self, escrow: &Escrow, onchain_id: &str) -> Result<ReleaseOutcome> {
        let payment_id = escrow.payment_id;
        let state = self.contract.escrow_state(onchain_id).await?;
        match state.status {
            OnChainStatus::Funded => {}
            OnChainStatus::Released => {
                db::mark_escrow_released(&self.pool, escrow, None).await?;
                return Ok(ReleaseOutcome::AlreadyReleased);
            }
            OnChainStatus::Disputed => {
                return Err(CustodyError::Rejected(format!(
                    "escrow {onchain_id} is disputed on-chain"
                )))
            }
            other => {
                return Err(CustodyError::Inconsistent(format!(
                    "escrow {onchain_id} is {other:?} on-chain, expected funded"
                )))
            }
        }

        match self.contract.release(onchain_id).await {
            Ok(tx_hash) => {
                if !db::mark_escrow_released(&self.pool, escrow, Some(&tx_hash)).await? {
                    warn!(payment_id, %tx_hash, "Escrow row moved on during release");
                }
                Ok(ReleaseOutcome::Released { tx_hash })
            }
            Err(ChainError::Inconclusive { tx_hash }) => {
                db::mark_release_submitted(&self.pool, escrow.id, &tx_hash).await?;
                Ok(ReleaseOutcome::Pending { tx_hash })
            }
            Err(e) => Err(e.into()),
        }
    }

    // ─────────────────────────────────────────────────────────
    // released → completed
    // ─────────────────────────────────────────────────────────

    /// Redeem the released tokens and pay the payee out.
    pub async fn payout(&self, payment_id: i64) -> Result<PayoutOutcome> {
        let stale_before = now_ts() - PAYOUT_CLAIM_STALE_SECS;
        if !db::claim_payout(&self.pool, payment_id, stale_before).await? {
            return Ok(PayoutOutcome::Busy);
        }

        match self.payout_claimed(payment_id).await {
            Ok(payout_ref) => Ok(PayoutOutcome::Completed { payout_ref }),
            Err(e) => {
                if !db::claim_payment(&self.pool, payment_id, PaymentStatus::Processing, PaymentStatus::Released)
                    .await?
                {
                    warn!(payment_id, "Payout claim was not ours to hand back");
                }
                Err(e)
            }
        }
    }

    async fn payout_claimed(&self, payment_id: i64) -> Result<String> {
        let payment = db::get_payment(&self.pool, payment_id).await?;
        let escrow = db::get_escrow_for_payment(&self.pool, payment_id).await?;
        if escrow.status != EscrowStatus::Released {
            return Err(CustodyError::Inconsistent(format!(
                "payment {payment_id} is released but its escrow is {}",
                escrow.status
            )));
        }
        let amount = escrow.release_amount;

        if payment.redemption_ref.is_none() {
            let reference = self
                .bank
                .redeem(
                    amount,
                    &self.settings.redemption_account,
                    &idempotency_key(payment_id, "redemption"),
                )
                .await?;
            db::set_bank_ref(&self.pool, payment_id, BankRef::Redemption, &reference).await?;
            db::append_event(
                &self.pool,
                payment_id,
                PaymentEventKind::RedemptionInitiated,
                &format!("{amount} {} redeemed, ref {reference}", self.settings.token_asset),
            )
            .await?;
        }

        let payout_ref = match payment.payout_ref {
            Some(r) => r,
            None => {
                let reference = self
                    .bank
                    .payout(
                        &payment.payout_account,
                        amount,
                        &format!("custody payment {payment_id}"),
                        &idempotency_key(payment_id, "payout"),
                    )
                    .await?;
                db::set_bank_ref(&self.pool, payment_id, BankRef::Payout, &reference).await?;
                reference
            }
        };

        if !db::complete_payout(&self.pool, payment_id, &payout_ref).await? {
            return Err(CustodyError::Inconsistent(format!(
                "payment {payment_id} could not be completed after payout {payout_ref}"
            )));
        }
        info!(payment_id, %payout_ref, "Payment completed");
        Ok(payout_ref)
    }

    // ─────────────────────────────────────────────────────────
    // Disputes
    // ─────────────────────────────────────────────────────────

    pub async fn dispute(&self, payment_id: i64, reason: &str) -> Result<String> {
        let escrow = db::get_escrow_for_payment(&self.pool, payment_id).await?;
        if escrow.status != EscrowStatus::Active {
            return Err(CustodyError::Validation(format!(
                "escrow {} is {}, only active escrows can be disputed",
                escrow.id, escrow.status
            )));
        }
        let onchain_id = escrow.smart_contract_escrow_id.as_deref().ok_or_else(|| {
            CustodyError::Inconsistent(format!("active escrow {} has no on-chain id", escrow.id))
        })?;

        let tx_hash = self.contract.dispute(onchain_id, reason).await?;
        if db::transition_escrow(&self.pool, escrow.id, EscrowStatus::Active, EscrowStatus::Disputed).await? {
            db::append_event(
                &self.pool,
                payment_id,
                PaymentEventKind::EscrowDisputed,
                &format!("escrow {onchain_id} disputed: {reason}, tx {tx_hash}"),
            )
            .await?;
        }
        Ok(tx_hash)
    }

    pub async fn resolve_dispute(&self, payment_id: i64, in_favor_of_seller: bool) -> Result<String> {
        let escrow = db::get_escrow_for_payment(&self.pool, payment_id).await?;
        if escrow.status != EscrowStatus::Disputed {
            return Err(CustodyError::Validation(format!(
                "escrow {} is {}, not disputed",
                escrow.id, escrow.status
            )));
        }
        let onchain_id = escrow.smart_contract_escrow_id.as_deref().ok_or_else(|| {
            CustodyError::Inconsistent(format!("disputed escrow {} has no on-chain id", escrow.id))
        })?;

        let tx_hash = self.contract.resolve_dispute(onchain_id, in_favor_of_seller).await?;
        db::settle_dispute(&self.pool, &escrow, in_favor_of_seller, &tx_hash).await?;
        Ok(tx_hash)
    }
}

fn idempotency_key(payment_id: i64, stage: &str) -> String {
    format!("custody-{payment_id}-{stage}")
}
