//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;

use crate::errors::{CustodyError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    pub chain: ChainConfig,
    pub bank: BankConfig,
    pub routing: RoutingConfig,
    pub approvals: ApprovalConfig,
    pub safety: SafetyConfig,
    pub schedule: ScheduleConfig,
}

/// Which escrow contract ABI is deployed on the configured network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractVariant {
    /// Exposes `paused()` / `unpause()`; release fails while paused.
    Pausable,
    /// No pause switch.
    Standard,
}

impl FromStr for ContractVariant {
    type Err = CustodyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pausable" => Ok(Self::Pausable),
            "standard" | "legacy" => Ok(Self::Standard),
            other => Err(CustodyError::Config(format!(
                "unsupported CONTRACT_VARIANT: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// JSON-RPC endpoint of the transaction relayer
    pub rpc_url: String,
    pub escrow_contract: String,
    /// ERC-20 token held in custody
    pub token_address: String,
    /// Single-sig wallet that pays into and receives from the escrow contract
    pub bridge_wallet: String,
    pub variant: ContractVariant,
    pub token_decimals: u32,
    pub confirmation_timeout: Duration,
    pub confirmation_poll: Duration,
    /// Topic-0 of `EscrowCreated`, used to filter raw logs when the relayer
    /// returns no decoded event.
    pub escrow_created_topic: Option<String>,
    /// Whether our signer holds the pauser role.
    pub can_unpause: bool,
}

#[derive(Debug, Clone)]
pub struct BankConfig {
    pub api_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub token_asset: String,
    /// Platform bank account that redemptions settle into before payout.
    pub redemption_account: String,
}

/// A multi-signature wallet and its owner set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultisigWallet {
    pub address: String,
    pub threshold: u32,
    pub owners: Vec<String>,
}

impl MultisigWallet {
    pub fn is_owner(&self, signer: &str) -> bool {
        self.owners.iter().any(|o| o.eq_ignore_ascii_case(signer))
    }
}

#[derive(Debug, Clone)]
pub struct RoutingConfig {
    pub rate_api_url: String,
    /// Currency deposits are denominated in
    pub local_currency: String,
    /// Currency the thresholds are expressed in
    pub reference_currency: String,
    /// Local units per reference unit used when the live lookup fails.
    pub fallback_rate: Decimal,
    pub high_value_threshold: Decimal,
    pub enterprise_threshold: Decimal,
    pub bridge_wallet: String,
    pub high_value_wallet: Option<MultisigWallet>,
    pub enterprise_wallet: Option<MultisigWallet>,
    /// Degrade to single-sig when a band's wallet is missing instead of
    /// rejecting the transaction.
    pub fail_open: bool,
}

#[derive(Debug, Clone)]
pub struct ApprovalConfig {
    pub ttl: chrono::Duration,
}

#[derive(Debug, Clone)]
pub struct SafetyConfig {
    pub max_attempts: u32,
    /// Rejections of one payment by one job before it is escalated.
    pub max_rejections: u32,
    pub custody_days: i64,
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub deposit_interval: Duration,
    pub custody_interval: Duration,
    pub payout_interval: Duration,
    pub sync_interval: Duration,
    pub safety_interval: Duration,
    pub approval_sweep_interval: Duration,
    /// Maximum +/- deviation applied to every interval, in percent.
    pub jitter_pct: u8,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let bridge_wallet = required("BRIDGE_WALLET_ADDRESS")?;
        let local_currency = env_or("DEPOSIT_CURRENCY", "MXN");

        Ok(Config {
            database_url: env_or("DATABASE_URL", "sqlite:./custody.db"),
            api_port: parse_env("API_PORT", "3002")?,
            chain: ChainConfig {
                rpc_url: env_or("CHAIN_RPC_URL", "http://127.0.0.1:8545"),
                escrow_contract: required("ESCROW_CONTRACT_ADDRESS")?,
                token_address: required("TOKEN_ADDRESS")?,
                bridge_wallet: bridge_wallet.clone(),
                variant: parse_env("CONTRACT_VARIANT", "pausable")?,
                token_decimals: parse_env("TOKEN_DECIMALS", "6")?,
                confirmation_timeout: Duration::from_secs(parse_env(
                    "CONFIRMATION_TIMEOUT_SECS",
                    "120",
                )?),
                confirmation_poll: Duration::from_millis(parse_env("CONFIRMATION_POLL_MS", "2000")?),
                escrow_created_topic: env_var("ESCROW_CREATED_TOPIC").ok(),
                can_unpause: parse_env("CAN_UNPAUSE", "true")?,
            },
            bank: BankConfig {
                api_url: env_or("BANK_API_URL", "https://stage.buildwithjuno.com"),
                api_key: required("BANK_API_KEY")?,
                api_secret: required("BANK_API_SECRET")?,
                token_asset: env_or("TOKEN_ASSET", "MXNB"),
                redemption_account: required("BANK_REDEMPTION_ACCOUNT")?,
            },
            routing: RoutingConfig {
                rate_api_url: env_or("RATE_API_URL", "https://api.exchangerate-api.com/v4/latest"),
                local_currency,
                reference_currency: env_or("REFERENCE_CURRENCY", "USD"),
                fallback_rate: parse_env("FALLBACK_RATE", "18")?,
                high_value_threshold: parse_env("MULTISIG_HIGH_VALUE_THRESHOLD", "1000")?,
                enterprise_threshold: parse_env("MULTISIG_ENTERPRISE_THRESHOLD", "10000")?,
                bridge_wallet,
                high_value_wallet: multisig_wallet("HIGH_VALUE_MULTISIG", "2")?,
                enterprise_wallet: multisig_wallet("ENTERPRISE_MULTISIG", "3")?,
                fail_open: parse_env("MULTISIG_FAIL_OPEN", "true")?,
            },
            approvals: ApprovalConfig {
                ttl: chrono::Duration::hours(parse_env("APPROVAL_TTL_HOURS", "24")?),
            },
            safety: SafetyConfig {
                max_attempts: parse_env("MAX_RECOVERY_ATTEMPTS", "3")?,
                max_rejections: parse_env("MAX_STAGE_REJECTIONS", "3")?,
                custody_days: parse_env("CUSTODY_DAYS", "7")?,
            },
            schedule: ScheduleConfig {
                deposit_interval: secs("DEPOSIT_INTERVAL_SECS", "60")?,
                custody_interval: secs("CUSTODY_INTERVAL_SECS", "600")?,
                payout_interval: secs("PAYOUT_INTERVAL_SECS", "120")?,
                sync_interval: secs("SYNC_INTERVAL_SECS", "300")?,
                safety_interval: secs("SAFETY_INTERVAL_SECS", "900")?,
                approval_sweep_interval: secs("APPROVAL_SWEEP_INTERVAL_SECS", "300")?,
                jitter_pct: parse_env("JOB_JITTER_PCT", "10")?,
            },
        })
    }
}

/// Reads `<PREFIX>_ADDRESS`, `<PREFIX>_THRESHOLD` and `<PREFIX>_OWNERS`.
/// An empty or missing address means the wallet is not configured.
fn multisig_wallet(prefix: &str, default_threshold: &str) -> Result<Option<MultisigWallet>> {
    let address = env_or(&format!("{prefix}_ADDRESS"), "");
    if address.trim().is_empty() {
        return Ok(None);
    }
    let threshold: u32 = parse_env(&format!("{prefix}_THRESHOLD"), default_threshold)?;
    let owners = parse_owners(&env_or(&format!("{prefix}_OWNERS"), ""));
    if !owners.is_empty() && (threshold as usize) > owners.len() {
        return Err(CustodyError::Config(format!(
            "{prefix}_THRESHOLD ({threshold}) exceeds owner count ({})",
            owners.len()
        )));
    }
    Ok(Some(MultisigWallet {
        address: address.trim().to_string(),
        threshold,
        owners,
    }))
}

fn parse_owners(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn secs(key: &str, default: &str) -> Result<Duration> {
    Ok(Duration::from_secs(parse_env(key, default)?))
}

fn parse_env<T: FromStr>(key: &str, default: &str) -> Result<T> {
    env_or(key, default)
        .parse()
        .map_err(|_| CustodyError::Config(format!("Invalid {key}")))
}

fn required(key: &str) -> Result<String> {
    env_var(key).map_err(|_| CustodyError::Config(format!("{key} environment variable is required")))
}

fn env_or(key: &str, default: &str) -> String {
    env_var(key).unwrap_or_else(|_| default.to_string())
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| CustodyError::Config(format!("Missing env var: {key}")))
}
