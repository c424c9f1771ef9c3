mod common;

use rust_decimal_macros::dec;

use common::{harness, register, routing, Harness, DEPOSIT_ACCOUNT};
use custody_engine::chain::{OnChainStatus, TxOutcome};
use custody_engine::db;
use custody_engine::events::PaymentEventKind;
use custody_engine::models::{now_ts, EscrowStatus, PaymentStatus, RecoveryStatus};
use custody_engine::safety::RecoveryOutcome;
use custody_engine::scheduler::{run_once, Job};
use custody_engine::stages::ProvisionOutcome;

/// A payment whose deposit was claimed but whose escrow never got funded.
async fn stuck_payment(h: &Harness) -> i64 {
    let payment = register(h, dec!(1500), now_ts() + 3600).await;
    h.bank.add_deposit("dep-1", dec!(1500), DEPOSIT_ACCOUNT);
    let deposits = run_once(Job::Deposits, &h.state).await.unwrap();
    assert_eq!(deposits.failed, 1);
    payment.id
}

async fn count(h: &Harness, payment_id: i64, kind: PaymentEventKind) -> usize {
    db::events_for_payment(&h.state.pool, payment_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == kind)
        .count()
}

#[tokio::test]
async fn failed_provisioning_is_detected_as_stuck() {
    let h = harness(routing(None, true)).await;
    h.contract.state.lock().unwrap().create_failures = 1;
    let payment_id = stuck_payment(&h).await;

    assert_eq!(
        db::get_payment(&h.state.pool, payment_id).await.unwrap().status,
        PaymentStatus::Funded
    );
    assert_eq!(h.state.safety.detect().await.unwrap(), vec![payment_id]);
    assert_eq!(count(&h, payment_id, PaymentEventKind::StageFailed).await, 1);
}

#[tokio::test]
async fn recovery_provisions_the_escrow() {
    let h = harness(routing(None, true)).await;
    h.contract.state.lock().unwrap().create_failures = 1;
    let payment_id = stuck_payment(&h).await;

    let sweep = run_once(Job::SafetySweep, &h.state).await.unwrap();
    assert_eq!(sweep.processed, 1);

    let escrow = db::get_escrow_for_payment(&h.state.pool, payment_id).await.unwrap();
    assert_eq!(escrow.status, EscrowStatus::Active);
    assert!(escrow.smart_contract_escrow_id.is_some());
    assert_eq!(
        db::get_recovery(&h.state.pool, payment_id).await.unwrap().unwrap().status,
        RecoveryStatus::Recovered
    );
    assert_eq!(count(&h, payment_id, PaymentEventKind::EscrowRecoverySuccess).await, 1);
    // The fiat leg was bridged once, on the first attempt.
    assert_eq!(h.bank.state.lock().unwrap().withdrawals.len(), 1);
    assert!(h.state.safety.detect().await.unwrap().is_empty());
}

#[tokio::test]
async fn created_but_unfunded_escrow_is_resumed_not_recreated() {
    let h = harness(routing(None, true)).await;
    h.contract.state.lock().unwrap().fund_failures = 1;
    let payment_id = stuck_payment(&h).await;

    let ledger = db::get_recovery(&h.state.pool, payment_id).await.unwrap().unwrap();
    assert_eq!(ledger.pending_escrow_id.as_deref(), Some("1"));
    assert!(db::get_escrow_for_payment(&h.state.pool, payment_id)
        .await
        .unwrap()
        .smart_contract_escrow_id
        .is_none());

    let outcome = h.state.safety.recover(payment_id).await.unwrap();
    assert_eq!(outcome, RecoveryOutcome::Recovered { escrow_id: "1".into() });

    let chain = h.contract.state.lock().unwrap();
    assert_eq!((chain.creates, chain.funds), (1, 1));
}

#[tokio::test]
async fn three_failures_escalate_and_stop_retrying() {
    let h = harness(routing(None, true)).await;
    h.contract.state.lock().unwrap().create_failures = 100;
    let payment_id = stuck_payment(&h).await;

    let safety = &h.state.safety;
    assert_eq!(safety.recover(payment_id).await.unwrap(), RecoveryOutcome::Failed { attempts: 1 });
    assert_eq!(safety.recover(payment_id).await.unwrap(), RecoveryOutcome::Failed { attempts: 2 });
    assert_eq!(safety.recover(payment_id).await.unwrap(), RecoveryOutcome::Escalated { attempts: 3 });

    let ledger = db::get_recovery(&h.state.pool, payment_id).await.unwrap().unwrap();
    assert_eq!(ledger.status, RecoveryStatus::MaxRetriesReached);
    assert_eq!(ledger.attempts, 3);
    assert!(ledger.last_error.is_some());
    assert_eq!(count(&h, payment_id, PaymentEventKind::EscrowRecoveryFailed).await, 3);
    assert_eq!(count(&h, payment_id, PaymentEventKind::RollbackInitiated).await, 1);

    // Parked for an operator: no further attempts, the fiat leg is untouched.
    let creates_before = h.contract.state.lock().unwrap().create_failures;
    assert_eq!(safety.recover(payment_id).await.unwrap(), RecoveryOutcome::AwaitingOperator);
    assert_eq!(h.contract.state.lock().unwrap().create_failures, creates_before);
    assert_eq!(
        db::get_payment(&h.state.pool, payment_id).await.unwrap().status,
        PaymentStatus::Funded
    );
    assert_eq!(h.bank.state.lock().unwrap().withdrawals.len(), 1);
}

#[tokio::test]
async fn recovery_is_a_no_op_once_provisioned() {
    let h = harness(routing(None, true)).await;
    let payment = register(&h, dec!(1500), now_ts() + 3600).await;
    h.bank.add_deposit("dep-1", dec!(1500), DEPOSIT_ACCOUNT);
    run_once(Job::Deposits, &h.state).await.unwrap();

    let outcome = h.state.safety.recover(payment.id).await.unwrap();
    assert_eq!(outcome, RecoveryOutcome::AlreadyProvisioned);
    assert_eq!(h.contract.state.lock().unwrap().creates, 1);
}

#[tokio::test]
async fn recovery_backs_off_while_another_worker_holds_the_lease() {
    let h = harness(routing(None, true)).await;
    h.contract.state.lock().unwrap().create_failures = 1;
    let payment_id = stuck_payment(&h).await;

    let now = now_ts();
    assert!(db::acquire_provisioning_lease(&h.state.pool, payment_id, now, now + 600)
        .await
        .unwrap());

    assert_eq!(h.state.safety.recover(payment_id).await.unwrap(), RecoveryOutcome::Busy);
    let ledger = db::get_recovery(&h.state.pool, payment_id).await.unwrap().unwrap();
    assert_eq!(ledger.attempts, 0);
}

#[tokio::test]
async fn unreachable_contract_counts_as_a_failed_attempt() {
    let h = harness(routing(None, true)).await;
    h.contract.state.lock().unwrap().create_failures = 1;
    let payment_id = stuck_payment(&h).await;
    h.contract.state.lock().unwrap().reachable = false;

    let outcome = h.state.safety.recover(payment_id).await.unwrap();
    assert_eq!(outcome, RecoveryOutcome::Failed { attempts: 1 });
    assert_eq!(h.contract.state.lock().unwrap().creates, 0);
}

/// A payment whose fund tx was sent but never confirmed within the timeout.
async fn unconfirmed_fund(h: &Harness) -> i64 {
    h.contract.state.lock().unwrap().fund_inconclusive = true;
    let payment = register(h, dec!(1500), now_ts() + 3600).await;
    h.bank.add_deposit("dep-1", dec!(1500), DEPOSIT_ACCOUNT);
    let deposits = run_once(Job::Deposits, &h.state).await.unwrap();
    assert_eq!(deposits.skipped, 1);
    payment.id
}

#[tokio::test]
async fn unconfirmed_fund_is_awaited_not_resent() {
    let h = harness(routing(None, true)).await;
    let payment_id = unconfirmed_fund(&h).await;

    let ledger = db::get_recovery(&h.state.pool, payment_id).await.unwrap().unwrap();
    assert_eq!(ledger.pending_fund_tx.as_deref(), Some("0xfund1-1"));

    let again = h.state.stages.provision(payment_id).await.unwrap();
    assert_eq!(again, ProvisionOutcome::Deferred { tx_hash: "0xfund1-1".into() });
    let recovered = h.state.safety.recover(payment_id).await.unwrap();
    assert_eq!(recovered, RecoveryOutcome::Deferred { tx_hash: "0xfund1-1".into() });
    assert_eq!(h.contract.state.lock().unwrap().funds, 1);
    assert_eq!(
        db::get_recovery(&h.state.pool, payment_id).await.unwrap().unwrap().attempts,
        0
    );

    // The original tx lands.
    {
        let mut chain = h.contract.state.lock().unwrap();
        chain.outcomes.insert("0xfund1-1".into(), TxOutcome::Confirmed);
        chain.escrows.insert("1".into(), OnChainStatus::Funded);
    }
    let done = h.state.stages.provision(payment_id).await.unwrap();
    assert_eq!(done, ProvisionOutcome::Activated { escrow_id: "1".into() });

    let escrow = db::get_escrow_for_payment(&h.state.pool, payment_id).await.unwrap();
    assert_eq!(escrow.status, EscrowStatus::Active);
    assert_eq!(escrow.fund_tx_hash.as_deref(), Some("0xfund1-1"));
    assert_eq!(h.contract.state.lock().unwrap().funds, 1);
}

#[tokio::test]
async fn reverted_fund_is_sent_again() {
    let h = harness(routing(None, true)).await;
    let payment_id = unconfirmed_fund(&h).await;

    {
        let mut chain = h.contract.state.lock().unwrap();
        chain.fund_inconclusive = false;
        chain
            .outcomes
            .insert("0xfund1-1".into(), TxOutcome::Reverted("out of gas".into()));
    }
    let done = h.state.stages.provision(payment_id).await.unwrap();
    assert_eq!(done, ProvisionOutcome::Activated { escrow_id: "1".into() });

    let escrow = db::get_escrow_for_payment(&h.state.pool, payment_id).await.unwrap();
    assert_eq!(escrow.fund_tx_hash.as_deref(), Some("0xfund1-2"));
    let ledger = db::get_recovery(&h.state.pool, payment_id).await.unwrap().unwrap();
    assert!(ledger.pending_fund_tx.is_none());
    let chain = h.contract.state.lock().unwrap();
    assert_eq!((chain.creates, chain.funds), (1, 2));
}
