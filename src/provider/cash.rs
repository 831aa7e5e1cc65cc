//! Cash-inventory API adapter
//!
//! Query-string search authenticated with a static partner key. Amounts
//! arrive as decimal strings and are normalized to integer cents.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::{
    Cabin, FareOption, FarePrice, ProviderAdapter, ProviderError, RetryPolicy, SearchMode,
    SearchParams,
};

pub const PROVIDER_NAME: &str = "cash";

pub struct CashInventoryAdapter {
    client: Client,
    base_url: String,
    partner_key: String,
    retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
struct CashOfferResponse {
    data: Vec<CashOffer>,
}

#[derive(Debug, Deserialize)]
struct CashOffer {
    carrier: String,
    flight_number: String,
    origin: String,
    destination: String,
    departs_at: String,
    arrives_at: String,
    cabin: String,
    total_amount: String,
    total_currency: String,
    seats_remaining: Option<u8>,
}

impl CashInventoryAdapter {
    pub fn new(
        base_url: impl Into<String>,
        partner_key: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: base_url.into(),
            partner_key: partner_key.into(),
            retry,
        }
    }

    async fn search_once(&self, params: &SearchParams) -> Result<Vec<FareOption>, ProviderError> {
        let url = format!("{}/v2/offers", self.base_url);

        let mut query: Vec<(&str, String)> = vec![
            ("origin", params.origin.clone()),
            ("destination", params.destination.clone()),
            ("departure_date", params.departure_date.to_string()),
            ("passengers", params.passengers.to_string()),
        ];
        if let Some(return_date) = params.return_date {
            query.push(("return_date", return_date.to_string()));
        }
        if let Some(cabin) = params.cabin {
            query.push(("cabin", cabin.as_str().to_string()));
        }

        debug!(
            "Searching cash inventory {} -> {} on {}",
            params.origin, params.destination, params.departure_date
        );

        let response = self
            .client
            .get(&url)
            .header("X-Partner-Key", &self.partner_key)
            .query(&query)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api { status, body });
        }

        let parsed: CashOfferResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;

        parsed.data.into_iter().map(normalize).collect()
    }
}

fn normalize(offer: CashOffer) -> Result<FareOption, ProviderError> {
    let cabin = Cabin::from_str(&offer.cabin)
        .map_err(|e| ProviderError::Decode(e.to_string()))?;
    let amount_cents = amount_to_cents(&offer.total_amount)?;

    Ok(FareOption {
        provider: PROVIDER_NAME.to_string(),
        carrier: offer.carrier,
        flight_number: offer.flight_number,
        origin: offer.origin,
        destination: offer.destination,
        departs_at: offer.departs_at,
        arrives_at: offer.arrives_at,
        cabin,
        seats_remaining: offer.seats_remaining,
        price: FarePrice::Cash {
            amount_cents,
            currency: offer.total_currency,
        },
    })
}

/// Parse a decimal amount string ("412.50") into integer cents
fn amount_to_cents(raw: &str) -> Result<u64, ProviderError> {
    let bad = || ProviderError::Decode(format!("bad amount: {}", raw));

    let (whole, frac) = match raw.split_once('.') {
        Some((w, f)) => (w, f),
        None => (raw, ""),
    };

    let whole: u64 = whole.parse().map_err(|_| bad())?;
    let cents = match frac.len() {
        0 => 0,
        1 => frac.parse::<u64>().map_err(|_| bad())? * 10,
        2 => frac.parse::<u64>().map_err(|_| bad())?,
        _ => return Err(bad()),
    };

    Ok(whole * 100 + cents)
}

#[async_trait]
impl ProviderAdapter for CashInventoryAdapter {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn serves(&self, mode: SearchMode) -> bool {
        matches!(mode, SearchMode::Cash | SearchMode::Both)
    }

    async fn search(&self, params: &SearchParams) -> Result<Vec<FareOption>, ProviderError> {
        self.retry.run(|| self.search_once(params)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amounts_parse_to_cents() {
        assert_eq!(amount_to_cents("412.50").unwrap(), 41250);
        assert_eq!(amount_to_cents("412.5").unwrap(), 41250);
        assert_eq!(amount_to_cents("412").unwrap(), 41200);
        assert_eq!(amount_to_cents("0.09").unwrap(), 9);
    }

    #[test]
    fn malformed_amounts_are_rejected() {
        assert!(amount_to_cents("412.505").is_err());
        assert!(amount_to_cents("abc").is_err());
        assert!(amount_to_cents("412.x").is_err());
    }
}
