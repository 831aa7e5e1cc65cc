//! Faregate configuration management
//!
//! Loads the YAML config file, falling back to defaults field by field.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::CredentialConfig;
use crate::provider::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database path
    #[serde(default = "default_db_path")]
    pub database_path: String,

    /// Award-inventory provider settings
    #[serde(default)]
    pub award: AwardProviderConfig,

    /// Cash-inventory provider settings
    #[serde(default)]
    pub cash: CashProviderConfig,

    /// OAuth client credentials per environment for the award provider
    #[serde(default)]
    pub credentials: HashMap<String, CredentialConfig>,

    /// Retry policy applied by every provider adapter
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_db_path() -> String {
    "~/.faregate/faregate.db".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_db_path(),
            award: AwardProviderConfig::default(),
            cash: CashProviderConfig::default(),
            credentials: HashMap::new(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwardProviderConfig {
    #[serde(default = "default_award_url")]
    pub base_url: String,

    /// Credential environment the token cache resolves for this provider
    #[serde(default = "default_environment")]
    pub environment: String,
}

fn default_award_url() -> String {
    "https://api.sandbox.award-inventory.example".to_string()
}

fn default_environment() -> String {
    "sandbox".to_string()
}

impl Default for AwardProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_award_url(),
            environment: default_environment(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CashProviderConfig {
    #[serde(default = "default_cash_url")]
    pub base_url: String,

    /// Static partner key sent on every request
    #[serde(default)]
    pub partner_key: String,
}

fn default_cash_url() -> String {
    "https://api.cash-inventory.example".to_string()
}

impl Default for CashProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_cash_url(),
            partner_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    250
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: std::time::Duration::from_millis(self.base_delay_ms),
        }
    }
}

impl Config {
    /// Load from `path`, or the default location, or defaults when no file
    /// exists yet
    pub fn load(path: Option<&str>) -> Result<Self> {
        let path = match path {
            Some(p) => PathBuf::from(p),
            None => Self::default_path(),
        };

        if !path.exists() {
            debug!("No config file at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config at {:?}", path))?;
        let config: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("Failed to parse config at {:?}", path))?;

        debug!("Loaded config from {:?}", path);
        Ok(config)
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".faregate").join("config.yaml"))
            .unwrap_or_else(|| PathBuf::from("./faregate.yaml"))
    }

    /// Database path with a leading `~/` expanded
    pub fn database_path(&self) -> PathBuf {
        if let Some(rest) = self.database_path.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest);
            }
        }
        PathBuf::from(&self.database_path)
    }
}
