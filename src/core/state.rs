//! Application state
//!
//! Owns every store and the orchestrator. Dependencies are wired here and
//! passed down explicitly; nothing is a module-level singleton, so tests can
//! assemble the same pieces around an in-memory database and stub servers.

use std::sync::Arc;

use anyhow::Result;

use crate::auth::TokenCache;
use crate::config::Config;
use crate::db::repositories::call::CallRegistry;
use crate::db::repositories::session_state::SessionStateStore;
use crate::db::repositories::token::TokenStore;
use crate::db::Database;
use crate::orchestrator::Orchestrator;
use crate::provider::{AwardInventoryAdapter, CashInventoryAdapter, ProviderAdapter};

pub struct AppState {
    pub db: Database,
    pub orchestrator: Orchestrator,
    pub token_cache: Arc<TokenCache>,
}

impl AppState {
    pub fn new(config: &Config) -> Result<Self> {
        let db = Database::new(config.database_path())?;

        let token_cache = Arc::new(TokenCache::new(
            TokenStore::new(db.clone()),
            config.credentials.clone(),
        ));

        let retry = config.retry.policy();
        let adapters: Vec<Arc<dyn ProviderAdapter>> = vec![
            Arc::new(AwardInventoryAdapter::new(
                config.award.base_url.clone(),
                config.award.environment.clone(),
                Arc::clone(&token_cache),
                retry,
            )),
            Arc::new(CashInventoryAdapter::new(
                config.cash.base_url.clone(),
                config.cash.partner_key.clone(),
                retry,
            )),
        ];

        let orchestrator = Orchestrator::new(
            CallRegistry::new(db.clone()),
            SessionStateStore::new(db.clone()),
            adapters,
        );

        Ok(Self {
            db,
            orchestrator,
            token_cache,
        })
    }
}
