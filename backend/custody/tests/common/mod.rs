//! In-memory stand-ins for the escrow contract, the banking rail and the rate
//! feed, plus a fully wired scheduler state on a `sqlite::memory:` pool.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use custody_engine::bank::{BankTransaction, BankingRail};
use custody_engine::chain::{
    ChainResult, CreateEscrowParams, CreatedEscrow, EscrowContract, OnChainEscrow, OnChainStatus,
    TxOutcome,
};
use custody_engine::config::{MultisigWallet, RoutingConfig};
use custody_engine::db::{self, NewPayment};
use custody_engine::errors::{ChainError, CustodyError, Result};
use custody_engine::models::Payment;
use custody_engine::multisig::MultisigEngine;
use custody_engine::rates::RateSource;
use custody_engine::router::TransactionRouter;
use custody_engine::safety::SafetyService;
use custody_engine::scheduler::SchedulerState;
use custody_engine::stages::{StageSettings, Stages};

pub const DEPOSIT_ACCOUNT: &str = "646180157000000001";
pub const PAYOUT_ACCOUNT: &str = "012180015000000002";
pub const REDEMPTION_ACCOUNT: &str = "platform-redemptions";
pub const BRIDGE: &str = "0xBRIDGE";
pub const OWNERS: [&str; 3] = ["0xAAA", "0xBBB", "0xCCC"];

// ─────────────────────────────────────────────────────────
// Escrow contract
// ─────────────────────────────────────────────────────────

pub struct ContractState {
    pub reachable: bool,
    pub next_id: u64,
    pub escrows: HashMap<String, OnChainStatus>,
    pub create_txs: HashMap<String, String>,
    pub outcomes: HashMap<String, TxOutcome>,
    /// Upcoming `submit_create` calls that fail with `ChainUnavailable`.
    pub create_failures: u32,
    /// Upcoming `fund_escrow` calls that fail with `ChainUnavailable`.
    pub fund_failures: u32,
    /// `fund_escrow` is sent but times out waiting for its receipt.
    pub fund_inconclusive: bool,
    /// `release` times out waiting for its receipt.
    pub release_inconclusive: bool,
    /// `release` reverts with `Pausable: paused`.
    pub release_reverts: bool,
    /// `release` waits this long before it lands.
    pub release_delay_ms: u64,
    pub creates: u32,
    pub funds: u32,
    pub releases: u32,
}

pub struct MockContract {
    pub state: Mutex<ContractState>,
}

impl MockContract {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ContractState {
                reachable: true,
                next_id: 0,
                escrows: HashMap::new(),
                create_txs: HashMap::new(),
                outcomes: HashMap::new(),
                create_failures: 0,
                fund_failures: 0,
                fund_inconclusive: false,
                release_inconclusive: false,
                release_reverts: false,
                release_delay_ms: 0,
                creates: 0,
                funds: 0,
                releases: 0,
            }),
        }
    }

    pub fn set_status(&self, escrow_id: &str, status: OnChainStatus) {
        self.state.lock().unwrap().escrows.insert(escrow_id.into(), status);
    }

    pub fn status(&self, escrow_id: &str) -> Option<OnChainStatus> {
        self.state.lock().unwrap().escrows.get(escrow_id).copied()
    }
}

#[async_trait]
impl EscrowContract for MockContract {
    async fn is_reachable(&self) -> ChainResult<bool> {
        Ok(self.state.lock().unwrap().reachable)
    }

    async fn ensure_unpaused(&self) -> ChainResult<bool> {
        Ok(false)
    }

    async fn submit_create(&self, _params: &CreateEscrowParams) -> ChainResult<String> {
        let mut s = self.state.lock().unwrap();
        if s.create_failures > 0 {
            s.create_failures -= 1;
            return Err(ChainError::ChainUnavailable("node timeout".into()));
        }
        s.next_id += 1;
        s.creates += 1;
        let escrow_id = s.next_id.to_string();
        let tx_hash = format!("0xcreate{escrow_id}");
        s.create_txs.insert(tx_hash.clone(), escrow_id);
        Ok(tx_hash)
    }

    async fn created_escrow_from_tx(&self, tx_hash: &str) -> ChainResult<CreatedEscrow> {
        let mut s = self.state.lock().unwrap();
        let escrow_id = s
            .create_txs
            .get(tx_hash)
            .cloned()
            .ok_or_else(|| ChainError::MissingEscrowId {
                tx_hash: tx_hash.into(),
            })?;
        s.escrows.entry(escrow_id.clone()).or_insert(OnChainStatus::Created);
        Ok(CreatedEscrow {
            escrow_id,
            tx_hash: tx_hash.into(),
        })
    }

    async fn fund_escrow(&self, escrow_id: &str, _token: &str, _amount: Decimal) -> ChainResult<String> {
        let mut s = self.state.lock().unwrap();
        if s.fund_failures > 0 {
            s.fund_failures -= 1;
            return Err(ChainError::ChainUnavailable("node timeout".into()));
        }
        if s.escrows.get(escrow_id) != Some(&OnChainStatus::Created) {
            return Err(ChainError::Reverted {
                reason: "Escrow: not in created state".into(),
            });
        }
        s.funds += 1;
        let tx_hash = format!("0xfund{escrow_id}-{}", s.funds);
        if s.fund_inconclusive {
            s.outcomes.insert(tx_hash.clone(), TxOutcome::Pending);
            return Err(ChainError::Inconclusive { tx_hash });
        }
        s.escrows.insert(escrow_id.into(), OnChainStatus::Funded);
        Ok(tx_hash)
    }

    async fn release(&self, escrow_id: &str) -> ChainResult<String> {
        let delay = self.state.lock().unwrap().release_delay_ms;
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        let mut s = self.state.lock().unwrap();
        let tx_hash = format!("0xrelease{escrow_id}");
        if s.release_reverts {
            return Err(ChainError::Reverted {
                reason: "Pausable: paused".into(),
            });
        }
        if s.release_inconclusive {
            s.outcomes.insert(tx_hash.clone(), TxOutcome::Pending);
            return Err(ChainError::Inconclusive { tx_hash });
        }
        if s.escrows.get(escrow_id) != Some(&OnChainStatus::Funded) {
            return Err(ChainError::Reverted {
                reason: "Escrow: not funded".into(),
            });
        }
        s.escrows.insert(escrow_id.into(), OnChainStatus::Released);
        s.releases += 1;
        Ok(tx_hash)
    }

    async fn dispute(&self, escrow_id: &str, _reason: &str) -> ChainResult<String> {
        self.set_status(escrow_id, OnChainStatus::Disputed);
        Ok(format!("0xdispute{escrow_id}"))
    }

    async fn resolve_dispute(&self, escrow_id: &str, in_favor_of_seller: bool) -> ChainResult<String> {
        let status = if in_favor_of_seller {
            OnChainStatus::Released
        } else {
            OnChainStatus::Unknown(4)
        };
        self.set_status(escrow_id, status);
        Ok(format!("0xresolve{escrow_id}"))
    }

    async fn escrow_state(&self, escrow_id: &str) -> ChainResult<OnChainEscrow> {
        let status = self
            .status(escrow_id)
            .ok_or_else(|| ChainError::InvalidParameters(format!("unknown escrow {escrow_id}")))?;
        Ok(OnChainEscrow {
            status,
            amount: Decimal::ZERO,
        })
    }

    async fn tx_outcome(&self, tx_hash: &str) -> ChainResult<TxOutcome> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .outcomes
            .get(tx_hash)
            .cloned()
            .unwrap_or(TxOutcome::Pending))
    }
}

// ─────────────────────────────────────────────────────────
// Banking rail
// ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct BankState {
    pub deposits: Vec<BankTransaction>,
    /// Idempotency keys of every withdrawal sent.
    pub withdrawals: Vec<String>,
    /// `(account, idempotency key)` of every redemption sent.
    pub redemptions: Vec<(String, String)>,
    /// `(account, amount)` of every payout sent.
    pub payouts: Vec<(String, Decimal)>,
    pub fail_payouts: bool,
}

#[derive(Default)]
pub struct MockBank {
    pub state: Mutex<BankState>,
}

impl MockBank {
    pub fn add_deposit(&self, id: &str, amount: Decimal, account: &str) {
        self.state.lock().unwrap().deposits.push(BankTransaction {
            id: id.into(),
            kind: "deposit".into(),
            status: "complete".into(),
            amount,
            account_ref: account.into(),
        });
    }
}

#[async_trait]
impl BankingRail for MockBank {
    async fn list_transactions(&self) -> Result<Vec<BankTransaction>> {
        Ok(self.state.lock().unwrap().deposits.clone())
    }

    async fn withdraw(
        &self,
        _amount: Decimal,
        _asset: &str,
        _destination: &str,
        idempotency_key: &str,
    ) -> Result<String> {
        let mut s = self.state.lock().unwrap();
        s.withdrawals.push(idempotency_key.into());
        Ok(format!("wd-{}", s.withdrawals.len()))
    }

    async fn redeem(&self, _amount: Decimal, account: &str, idempotency_key: &str) -> Result<String> {
        let mut s = self.state.lock().unwrap();
        s.redemptions.push((account.into(), idempotency_key.into()));
        Ok(format!("rd-{}", s.redemptions.len()))
    }

    async fn payout(&self, account: &str, amount: Decimal, _memo: &str, _key: &str) -> Result<String> {
        let mut s = self.state.lock().unwrap();
        if s.fail_payouts {
            return Err(CustodyError::ExternalUnavailable("SPEI window closed".into()));
        }
        s.payouts.push((account.into(), amount));
        Ok(format!("po-{}", s.payouts.len()))
    }
}

// ─────────────────────────────────────────────────────────
// Rates
// ─────────────────────────────────────────────────────────

/// Always quotes `rate` local units per reference unit; `None` fails.
pub struct FixedRate(pub Option<Decimal>);

#[async_trait]
impl RateSource for FixedRate {
    async fn rate(&self, _from: &str, _to: &str) -> Result<Decimal> {
        self.0
            .ok_or_else(|| CustodyError::ExternalUnavailable("rate feed down".into()))
    }
}

// ─────────────────────────────────────────────────────────
// Wiring
// ─────────────────────────────────────────────────────────

pub fn wallet(address: &str, threshold: u32) -> MultisigWallet {
    MultisigWallet {
        address: address.into(),
        threshold,
        owners: OWNERS.iter().map(|o| o.to_string()).collect(),
    }
}

/// Thresholds at 1 000 / 10 000 USD with the high-value wallet optional.
pub fn routing(high_value: Option<MultisigWallet>, fail_open: bool) -> RoutingConfig {
    RoutingConfig {
        rate_api_url: "http://rates.invalid".into(),
        local_currency: "MXN".into(),
        reference_currency: "USD".into(),
        fallback_rate: dec!(18),
        high_value_threshold: dec!(1000),
        enterprise_threshold: dec!(10000),
        bridge_wallet: BRIDGE.into(),
        high_value_wallet: high_value,
        enterprise_wallet: None,
        fail_open,
    }
}

pub struct Harness {
    pub contract: Arc<MockContract>,
    pub bank: Arc<MockBank>,
    pub state: SchedulerState,
}

/// Engine on a fresh in-memory database; the rate feed quotes 20 MXN/USD.
pub async fn harness(routing: RoutingConfig) -> Harness {
    let pool = db::init_pool("sqlite::memory:").await.unwrap();
    let contract = Arc::new(MockContract::new());
    let bank = Arc::new(MockBank::default());

    let router = Arc::new(TransactionRouter::new(routing, Arc::new(FixedRate(Some(dec!(20))))));
    let stages = Arc::new(Stages::new(
        pool.clone(),
        contract.clone(),
        bank.clone(),
        StageSettings {
            token_address: "0xTOKEN".into(),
            bridge_wallet: BRIDGE.into(),
            token_asset: "MXNB".into(),
            redemption_account: REDEMPTION_ACCOUNT.into(),
        },
    ));
    let multisig = Arc::new(MultisigEngine::new(
        pool.clone(),
        router.clone(),
        stages.clone(),
        chrono::Duration::hours(24),
    ));
    let safety = Arc::new(SafetyService::new(pool.clone(), stages.clone(), 3));

    Harness {
        contract,
        bank: bank.clone(),
        state: SchedulerState {
            pool,
            bank,
            router,
            stages,
            multisig,
            safety,
            escalate_after: 3,
        },
    }
}

/// Register a payment with its whole amount in custody until `custody_end`.
pub async fn register(h: &Harness, amount: Decimal, custody_end: i64) -> Payment {
    let (payment, _) = db::register_payment(
        &h.state.pool,
        &NewPayment {
            amount,
            currency: "MXN".into(),
            payer_id: "payer-1".into(),
            payee_id: "payee-1".into(),
            deposit_account: DEPOSIT_ACCOUNT.into(),
            payout_account: PAYOUT_ACCOUNT.into(),
            payee_wallet: Some("0xPAYEE".into()),
            vertical: Some("real_estate".into()),
        },
        custody_end,
    )
    .await
    .unwrap();
    payment
}
