//! Transaction router: decides per transaction which wallet moves the funds
//! and how many signatures that takes.
//!
//! Amounts are classified in the reference currency into three bands:
//!
//! | band        | reference amount                  | wallet                  |
//! |-------------|-----------------------------------|-------------------------|
//! | standard    | `< high_value_threshold`          | single-sig bridge       |
//! | high value  | `< enterprise_threshold`          | high-value multi-sig    |
//! | enterprise  | `>= enterprise_threshold`         | enterprise multi-sig    |
//!
//! A band whose multi-sig wallet is not configured degrades to the bridge
//! wallet with a loud warning when `fail_open` is set, and is rejected
//! otherwise.

use std::sync::Arc;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use tracing::warn;

use crate::config::{MultisigWallet, RoutingConfig};
use crate::errors::{CustodyError, Result};
use crate::models::ApprovalKind;
use crate::rates::RateSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureMode {
    SingleSig,
    MultiSig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Band {
    Standard,
    HighValue,
    Enterprise,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingDecision {
    pub mode: SignatureMode,
    pub wallet_address: String,
    pub threshold: Option<u32>,
    pub requires_approval: bool,
    pub reason: String,
    pub band: Band,
    pub amount_reference: Decimal,
    /// The band called for multi-sig but fell back to single-sig.
    pub degraded: bool,
}

/// Result of [`TransactionRouter::validate_configuration`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConfigReport {
    pub missing: Vec<String>,
}

impl ConfigReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

pub struct TransactionRouter {
    config: RoutingConfig,
    rates: Arc<dyn RateSource>,
}

impl TransactionRouter {
    pub fn new(config: RoutingConfig, rates: Arc<dyn RateSource>) -> Self {
        Self { config, rates }
    }

    pub async fn route(&self, amount_local: Decimal, kind: ApprovalKind) -> Result<RoutingDecision> {
        if amount_local <= Decimal::ZERO {
            return Err(CustodyError::Validation(format!(
                "cannot route non-positive amount {amount_local}"
            )));
        }
        let amount_reference = self.to_reference(amount_local).await;
        self.classify(amount_reference, kind)
    }

    /// Convert to the reference currency, falling back to the configured rate.
    pub async fn to_reference(&self, amount_local: Decimal) -> Decimal {
        let cfg = &self.config;
        let rate = match self.rates.rate(&cfg.reference_currency, &cfg.local_currency).await {
            Ok(r) if r > Decimal::ZERO => r,
            Ok(r) => {
                warn!(rate = %r, fallback = %cfg.fallback_rate, "Rejecting non-positive live rate");
                cfg.fallback_rate
            }
            Err(e) => {
                warn!(fallback = %cfg.fallback_rate, "Rate lookup failed, using fallback: {e}");
                cfg.fallback_rate
            }
        };
        (amount_local / rate).round_dp_with_strategy(2, RoundingStrategy::AwayFromZero)
    }

    /// Pure band classification of an amount already in the reference currency.
    pub fn classify(&self, amount_reference: Decimal, kind: ApprovalKind) -> Result<RoutingDecision> {
        let cfg = &self.config;
        let ccy = &cfg.reference_currency;

        let (band, wallet) = if amount_reference < cfg.high_value_threshold {
            return Ok(RoutingDecision {
                mode: SignatureMode::SingleSig,
                wallet_address: cfg.bridge_wallet.clone(),
                threshold: None,
                requires_approval: false,
                reason: format!(
                    "{kind} of {amount_reference} {ccy} is below {} {ccy}",
                    cfg.high_value_threshold
                ),
                band: Band::Standard,
                amount_reference,
                degraded: false,
            });
        } else if amount_reference < cfg.enterprise_threshold {
            (Band::HighValue, cfg.high_value_wallet.as_ref())
        } else {
            (Band::Enterprise, cfg.enterprise_wallet.as_ref())
        };

        match wallet {
            Some(w) => Ok(RoutingDecision {
                mode: SignatureMode::MultiSig,
                wallet_address: w.address.clone(),
                threshold: Some(w.threshold),
                requires_approval: true,
                reason: format!(
                    "{kind} of {amount_reference} {ccy} needs {}-of-{} approval ({band:?})",
                    w.threshold,
                    w.owners.len()
                ),
                band,
                amount_reference,
                degraded: false,
            }),
            None if cfg.fail_open => {
                warn!(
                    alert = true,
                    band = ?band,
                    amount = %amount_reference,
                    "Multi-sig wallet not configured, degrading to single-sig bridge wallet"
                );
                Ok(RoutingDecision {
                    mode: SignatureMode::SingleSig,
                    wallet_address: cfg.bridge_wallet.clone(),
                    threshold: None,
                    requires_approval: false,
                    reason: format!(
                        "{kind} of {amount_reference} {ccy} falls in {band:?} band but no wallet is configured; degraded to single-sig"
                    ),
                    band,
                    amount_reference,
                    degraded: true,
                })
            }
            None => Err(CustodyError::Validation(format!(
                "{kind} of {amount_reference} {ccy} requires the {band:?} multi-sig wallet, which is not configured"
            ))),
        }
    }

    /// Owner set and threshold of a configured multi-sig wallet.
    pub fn wallet(&self, address: &str) -> Option<&MultisigWallet> {
        [&self.config.high_value_wallet, &self.config.enterprise_wallet]
            .into_iter()
            .flatten()
            .find(|w| w.address.eq_ignore_ascii_case(address))
    }

    pub fn validate_configuration(&self) -> ConfigReport {
        let mut report = ConfigReport::default();
        if self.config.bridge_wallet.trim().is_empty() {
            report.missing.push("bridge wallet".into());
        }
        for (name, wallet) in [
            ("high-value multi-sig wallet", &self.config.high_value_wallet),
            ("enterprise multi-sig wallet", &self.config.enterprise_wallet),
        ] {
            match wallet {
                None => report.missing.push(name.into()),
                Some(w) if w.owners.is_empty() => report.missing.push(format!("{name} owners")),
                Some(_) => {}
            }
        }
        report
    }

    pub fn fail_open(&self) -> bool {
        self.config.fail_open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    struct FixedRate(Option<Decimal>);

    #[async_trait]
    impl RateSource for FixedRate {
        async fn rate(&self, _from: &str, _to: &str) -> Result<Decimal> {
            self.0
                .ok_or_else(|| CustodyError::ExternalUnavailable("rate api down".into()))
        }
    }

    fn wallet(address: &str, threshold: u32, owners: usize) -> MultisigWallet {
        MultisigWallet {
            address: address.into(),
            threshold,
            owners: (0..owners).map(|i| format!("0xowner{i}")).collect(),
        }
    }

    fn config(high: bool, enterprise: bool, fail_open: bool) -> RoutingConfig {
        RoutingConfig {
            rate_api_url: "http://rates".into(),
            local_currency: "MXN".into(),
            reference_currency: "USD".into(),
            fallback_rate: dec!(18),
            high_value_threshold: dec!(1000),
            enterprise_threshold: dec!(10000),
            bridge_wallet: "0xBRIDGE".into(),
            high_value_wallet: high.then(|| wallet("0xHIGH", 2, 3)),
            enterprise_wallet: enterprise.then(|| wallet("0xENT", 3, 5)),
            fail_open,
        }
    }

    fn router(cfg: RoutingConfig, rate: Option<Decimal>) -> TransactionRouter {
        TransactionRouter::new(cfg, Arc::new(FixedRate(rate)))
    }

    #[tokio::test]
    async fn twelve_hundred_dollars_routes_to_two_of_three() {
        let r = router(config(true, true, true), Some(dec!(20)));
        let d = r.route(dec!(24000), ApprovalKind::Release).await.unwrap();
        assert_eq!(d.amount_reference, dec!(1200));
        assert_eq!(d.band, Band::HighValue);
        assert_eq!(d.mode, SignatureMode::MultiSig);
        assert_eq!(d.wallet_address, "0xHIGH");
        assert_eq!(d.threshold, Some(2));
        assert!(d.requires_approval);
    }

    #[tokio::test]
    async fn unconfigured_band_degrades_without_error() {
        let r = router(config(false, true, true), Some(dec!(20)));
        let d = r.route(dec!(24000), ApprovalKind::Release).await.unwrap();
        assert_eq!(d.mode, SignatureMode::SingleSig);
        assert_eq!(d.wallet_address, "0xBRIDGE");
        assert!(!d.requires_approval);
        assert!(d.degraded);
    }

    #[tokio::test]
    async fn unconfigured_band_fails_closed_when_asked() {
        let r = router(config(false, true, false), Some(dec!(20)));
        let err = r.route(dec!(24000), ApprovalKind::Payout).await.unwrap_err();
        assert!(matches!(err, CustodyError::Validation(_)));
    }

    #[test]
    fn band_edges() {
        let r = router(config(true, true, true), None);
        let k = ApprovalKind::Release;

        let below = r.classify(dec!(999.99), k).unwrap();
        assert_eq!((below.band, below.requires_approval), (Band::Standard, false));

        assert_eq!(r.classify(dec!(1000), k).unwrap().band, Band::HighValue);
        assert_eq!(r.classify(dec!(9999.99), k).unwrap().band, Band::HighValue);

        let top = r.classify(dec!(10000), k).unwrap();
        assert_eq!(top.band, Band::Enterprise);
        assert_eq!(top.wallet_address, "0xENT");
        assert_eq!(top.threshold, Some(3));
    }

    #[tokio::test]
    async fn rate_failure_uses_fallback() {
        let r = router(config(true, true, true), None);
        assert_eq!(r.to_reference(dec!(18000)).await, dec!(1000));
    }

    #[tokio::test]
    async fn non_positive_amount_is_a_validation_error() {
        let r = router(config(true, true, true), Some(dec!(18)));
        assert!(matches!(
            r.route(dec!(0), ApprovalKind::Release).await,
            Err(CustodyError::Validation(_))
        ));
    }

    #[test]
    fn configuration_report_lists_gaps() {
        assert!(router(config(true, true, true), None)
            .validate_configuration()
            .is_complete());
        let report = router(config(false, true, true), None).validate_configuration();
        assert_eq!(report.missing, vec!["high-value multi-sig wallet".to_string()]);
    }

    #[test]
    fn wallet_lookup_is_case_insensitive() {
        let r = router(config(true, true, true), None);
        assert_eq!(r.wallet("0xhigh").map(|w| w.threshold), Some(2));
        assert!(r.wallet("0xBRIDGE").is_none());
    }
}
