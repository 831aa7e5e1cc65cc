//! OAuth token cache
//!
//! Provides a valid bearer credential for a named environment, refreshing
//! transparently when nothing usable is cached. Concurrent callers may each
//! trigger a refresh; the authorization endpoint is idempotent from our side
//! and the freshest stored token wins on the next lookup.

use std::collections::HashMap;

use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::db::repositories::token::{CachedToken, TokenStore};

/// Tokens expiring within this window are treated as already expired so a
/// credential cannot lapse mid-request.
const EXPIRY_MARGIN_SECS: i64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("unknown credential environment: {0}")]
    UnknownEnvironment(String),

    #[error("credential refresh failed: {0}")]
    RefreshFailed(String),

    #[error("token store unavailable: {0}")]
    Store(#[from] rusqlite::Error),
}

/// Client-credentials grant configuration for one environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
}

/// A usable bearer credential
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub access_token: String,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// Value for the Authorization request header
    pub fn authorization_value(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_token_type")]
    token_type: String,
    expires_in: u64,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

pub struct TokenCache {
    store: TokenStore,
    http: Client,
    environments: HashMap<String, CredentialConfig>,
}

impl TokenCache {
    pub fn new(store: TokenStore, environments: HashMap<String, CredentialConfig>) -> Self {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            store,
            http,
            environments,
        }
    }

    /// Valid bearer credential for `environment`, refreshed if the cache
    /// holds nothing usable. A failed refresh caches nothing.
    pub async fn get_token(&self, environment: &str) -> Result<AccessToken, TokenError> {
        let not_before = Utc::now() + Duration::seconds(EXPIRY_MARGIN_SECS);

        if let Some(cached) = self.store.find_valid(environment, not_before).await? {
            debug!(
                "Using cached token for {} (expires {})",
                environment, cached.expires_at
            );
            return Ok(AccessToken {
                access_token: cached.access_token,
                token_type: cached.token_type,
                expires_at: cached.expires_at,
            });
        }

        self.refresh(environment).await
    }

    async fn refresh(&self, environment: &str) -> Result<AccessToken, TokenError> {
        let creds = self
            .environments
            .get(environment)
            .ok_or_else(|| TokenError::UnknownEnvironment(environment.to_string()))?;

        info!("Refreshing credential for environment {}", environment);

        let basic = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", creds.client_id, creds.client_secret));

        let response = self
            .http
            .post(&creds.token_url)
            .header("Authorization", format!("Basic {}", basic))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| {
                TokenError::RefreshFailed(format!("authorization endpoint unreachable: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!("Credential refresh for {} returned {}", environment, status);
            return Err(TokenError::RefreshFailed(format!("{} - {}", status, body)));
        }

        let grant: TokenResponse = response
            .json()
            .await
            .map_err(|e| TokenError::RefreshFailed(format!("malformed token response: {}", e)))?;

        let now = Utc::now();
        let token = CachedToken {
            environment: environment.to_string(),
            access_token: grant.access_token,
            token_type: grant.token_type,
            expires_at: now + Duration::seconds(grant.expires_in as i64),
            created_at: now,
        };
        self.store.insert(&token).await?;

        info!(
            "Cached new token for {} (valid {}s)",
            environment, grant.expires_in
        );

        Ok(AccessToken {
            access_token: token.access_token,
            token_type: token.token_type,
            expires_at: token.expires_at,
        })
    }

    /// Best-effort housekeeping: drop rows past expiry
    pub async fn cleanup_expired(&self) -> Result<u64, TokenError> {
        let deleted = self.store.delete_expired(Utc::now()).await?;
        if deleted > 0 {
            debug!("Deleted {} expired token(s)", deleted);
        }
        Ok(deleted)
    }
}
