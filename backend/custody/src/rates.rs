//! Currency-rate lookup.

use std::str::FromStr;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;

use crate::errors::{CustodyError, Result};

#[async_trait]
pub trait RateSource: Send + Sync {
    /// Units of `to` per one unit of `from`.
    async fn rate(&self, from: &str, to: &str) -> Result<Decimal>;
}

/// `GET {base_url}/{from}` returning `{"rates": {"MXN": 17.1, …}}`.
pub struct HttpRateSource {
    http: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct LatestRates {
    rates: HashMap<String, serde_json::Number>,
}

impl HttpRateSource {
    pub fn new(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl RateSource for HttpRateSource {
    async fn rate(&self, from: &str, to: &str) -> Result<Decimal> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), from);
        let resp = self
            .http
            .get(&url)
            .timeout(std::time::Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| CustodyError::ExternalUnavailable(format!("rate lookup: {e}")))?;
        if !resp.status().is_success() {
            return Err(CustodyError::ExternalUnavailable(format!(
                "rate lookup returned {}",
                resp.status()
            )));
        }
        let body: LatestRates = resp.json().await?;
        pick_rate(&body, to)
    }
}

fn pick_rate(body: &LatestRates, to: &str) -> Result<Decimal> {
    let raw = body
        .rates
        .get(to)
        .ok_or_else(|| CustodyError::ExternalUnavailable(format!("no {to} rate published")))?;
    let rate = Decimal::from_str(&raw.to_string())
        .map_err(|e| CustodyError::ExternalUnavailable(format!("unparseable {to} rate {raw}: {e}")))?;
    if rate <= Decimal::ZERO {
        return Err(CustodyError::ExternalUnavailable(format!("non-positive {to} rate {rate}")));
    }
    Ok(rate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn body(json: &str) -> LatestRates {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn picks_requested_currency() {
        let b = body(r#"{"base":"USD","rates":{"MXN":17.25,"EUR":0.92}}"#);
        assert_eq!(pick_rate(&b, "MXN").unwrap(), dec!(17.25));
    }

    #[test]
    fn missing_or_zero_rate_is_unavailable() {
        let b = body(r#"{"rates":{"MXN":0}}"#);
        assert!(matches!(pick_rate(&b, "MXN"), Err(CustodyError::ExternalUnavailable(_))));
        assert!(matches!(pick_rate(&b, "BRL"), Err(CustodyError::ExternalUnavailable(_))));
    }
}
