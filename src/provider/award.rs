//! Award-inventory API adapter
//!
//! Bearer-authenticated search against the award provider. The token is
//! obtained inside the branch so a credential failure is contained here and
//! never touches sibling branches.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    Cabin, FareOption, FarePrice, ProviderAdapter, ProviderError, RetryPolicy, SearchMode,
    SearchParams,
};
use crate::auth::TokenCache;

pub const PROVIDER_NAME: &str = "award";

pub struct AwardInventoryAdapter {
    client: Client,
    base_url: String,
    environment: String,
    tokens: Arc<TokenCache>,
    retry: RetryPolicy,
}

#[derive(Debug, Serialize)]
struct AwardSearchRequest<'a> {
    origin: &'a str,
    destination: &'a str,
    #[serde(rename = "departureDate")]
    departure_date: String,
    #[serde(rename = "returnDate", skip_serializing_if = "Option::is_none")]
    return_date: Option<String>,
    passengers: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    cabin: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
struct AwardSearchResponse {
    offers: Vec<AwardOffer>,
}

#[derive(Debug, Deserialize)]
struct AwardOffer {
    carrier: String,
    #[serde(rename = "flightNumber")]
    flight_number: String,
    origin: String,
    destination: String,
    #[serde(rename = "departsAt")]
    departs_at: String,
    #[serde(rename = "arrivesAt")]
    arrives_at: String,
    cabin: String,
    #[serde(rename = "milesCost")]
    miles_cost: u64,
    #[serde(rename = "taxesCents")]
    taxes_cents: u64,
    currency: String,
    #[serde(rename = "seatsRemaining")]
    seats_remaining: Option<u8>,
}

impl AwardInventoryAdapter {
    pub fn new(
        base_url: impl Into<String>,
        environment: impl Into<String>,
        tokens: Arc<TokenCache>,
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
            environment: environment.into(),
            tokens,
            retry,
        }
    }

    async fn search_once(&self, params: &SearchParams) -> Result<Vec<FareOption>, ProviderError> {
        let token = self.tokens.get_token(&self.environment).await?;

        let url = format!("{}/v1/award-offers/search", self.base_url);
        let body = AwardSearchRequest {
            origin: &params.origin,
            destination: &params.destination,
            departure_date: params.departure_date.to_string(),
            return_date: params.return_date.map(|d| d.to_string()),
            passengers: params.passengers,
            cabin: params.cabin.map(|c| c.as_str()),
        };

        debug!(
            "Searching award inventory {} -> {} on {}",
            params.origin, params.destination, params.departure_date
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", token.authorization_value())
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api { status, body });
        }

        let parsed: AwardSearchResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;

        parsed.offers.into_iter().map(normalize).collect()
    }
}

fn normalize(offer: AwardOffer) -> Result<FareOption, ProviderError> {
    let cabin = Cabin::from_str(&offer.cabin)
        .map_err(|e| ProviderError::Decode(e.to_string()))?;

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
        price: FarePrice::Award {
            miles: offer.miles_cost,
            taxes_cents: offer.taxes_cents,
            currency: offer.currency,
        },
    })
}

#[async_trait]
impl ProviderAdapter for AwardInventoryAdapter {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn serves(&self, mode: SearchMode) -> bool {
        matches!(mode, SearchMode::Award | SearchMode::Both)
    }

    async fn search(&self, params: &SearchParams) -> Result<Vec<FareOption>, ProviderError> {
        self.retry.run(|| self.search_once(params)).await
    }
}
