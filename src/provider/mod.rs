//! Provider adapters for the external flight-inventory APIs

pub mod award;
pub mod cash;

pub use award::AwardInventoryAdapter;
pub use cash::CashInventoryAdapter;

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Search request understood by every adapter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchParams {
    pub origin: String,
    pub destination: String,
    pub departure_date: NaiveDate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_date: Option<NaiveDate>,
    #[serde(default = "default_passengers")]
    pub passengers: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cabin: Option<Cabin>,
    #[serde(default)]
    pub mode: SearchMode,
}

fn default_passengers() -> u8 {
    1
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Cabin {
    Economy,
    PremiumEconomy,
    Business,
    First,
}

impl Cabin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cabin::Economy => "economy",
            Cabin::PremiumEconomy => "premium_economy",
            Cabin::Business => "business",
            Cabin::First => "first",
        }
    }

    pub fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "economy" => Ok(Cabin::Economy),
            "premium_economy" => Ok(Cabin::PremiumEconomy),
            "business" => Ok(Cabin::Business),
            "first" => Ok(Cabin::First),
            _ => anyhow::bail!("Unknown cabin: {}", s),
        }
    }
}

/// Which fare inventories a search fans out to
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Award,
    Cash,
    #[default]
    Both,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Award => "award",
            SearchMode::Cash => "cash",
            SearchMode::Both => "both",
        }
    }

    pub fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "award" => Ok(SearchMode::Award),
            "cash" => Ok(SearchMode::Cash),
            "both" => Ok(SearchMode::Both),
            _ => anyhow::bail!("Unknown search mode: {}", s),
        }
    }
}

/// One normalized fare offer. The orchestrator only ever sees this shape;
/// provider-specific fields stop at the adapter boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FareOption {
    pub provider: String,
    pub carrier: String,
    pub flight_number: String,
    pub origin: String,
    pub destination: String,
    pub departs_at: String,
    pub arrives_at: String,
    pub cabin: Cabin,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seats_remaining: Option<u8>,
    pub price: FarePrice,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FarePrice {
    Award {
        miles: u64,
        taxes_cents: u64,
        currency: String,
    },
    Cash {
        amount_cents: u64,
        currency: String,
    },
}

impl std::fmt::Display for FarePrice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FarePrice::Award {
                miles,
                taxes_cents,
                currency,
            } => write!(
                f,
                "{} miles + {}.{:02} {}",
                miles,
                taxes_cents / 100,
                taxes_cents % 100,
                currency
            ),
            FarePrice::Cash {
                amount_cents,
                currency,
            } => write!(
                f,
                "{}.{:02} {}",
                amount_cents / 100,
                amount_cents % 100,
                currency
            ),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider unreachable: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned {status}: {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error(transparent)]
    Credential(#[from] crate::auth::TokenError),

    #[error("malformed provider response: {0}")]
    Decode(String),
}

impl ProviderError {
    /// Transient failures worth another attempt
    fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Http(e) => e.is_timeout() || e.is_connect(),
            ProviderError::Api { status, .. } => {
                status.is_server_error() || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }
}

/// Bounded retry for transient provider failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Run `op` up to `max_attempts` times, backing off exponentially with
    /// jitter between attempts. Non-retryable errors return immediately.
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T, ProviderError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let backoff = self.base_delay * 2u32.saturating_pow(attempt - 1);
                    let jitter_ceiling = backoff.as_millis() as u64 / 2 + 1;
                    let jitter = rand::thread_rng().gen_range(0..jitter_ceiling);
                    let delay = backoff + Duration::from_millis(jitter);
                    warn!(
                        "Provider attempt {}/{} failed ({}), retrying in {:?}",
                        attempt, self.max_attempts, err, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Adapter over one external inventory API
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable provider name used in results and diagnostics
    fn name(&self) -> &'static str;

    /// Whether this adapter serves the requested fare mode
    fn serves(&self, mode: SearchMode) -> bool;

    /// Run one search and normalize the provider's offers
    async fn search(&self, params: &SearchParams) -> Result<Vec<FareOption>, ProviderError>;
}
