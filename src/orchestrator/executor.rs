//! Fan-out orchestrator
//!
//! Executes one logical tool-call request against the applicable provider
//! subset, concurrently and with per-branch failure isolation, while driving
//! the call registry and session state store.

use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::db::repositories::call::{
    CallRegistry, CallStatus, CallUpdate, RegistryError, ToolCall,
};
use crate::db::repositories::session_state::{SessionStateStore, StateError};
use crate::provider::{FareOption, ProviderAdapter, SearchParams};

/// A typed tool invocation; one variant per capability the agent can call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "tool", content = "params", rename_all = "snake_case")]
pub enum ToolRequest {
    SearchFlights(SearchParams),
}

impl ToolRequest {
    pub fn tool_name(&self) -> &'static str {
        match self {
            ToolRequest::SearchFlights(_) => "search_flights",
        }
    }

    fn params_value(&self) -> serde_json::Result<Value> {
        match self {
            ToolRequest::SearchFlights(params) => serde_json::to_value(params),
        }
    }
}

/// One provider branch that could not produce results
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BranchFailure {
    pub provider: String,
    pub reason: String,
}

/// Outcome of one logical search across all dispatched branches
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SearchOutcome {
    /// At least one branch delivered; failed branches listed for diagnostics
    Results {
        fares: Vec<FareOption>,
        degraded: Vec<BranchFailure>,
    },
    /// Every dispatched branch failed. Recoverable and user-facing, not a
    /// crash.
    NoResults {
        error: String,
        failures: Vec<BranchFailure>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedResult {
    pub call_id: String,
    /// True when the registry already held a terminal result and no provider
    /// was contacted
    pub reused: bool,
    pub outcome: SearchOutcome,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("request is not serializable: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("stored payload for call {0} is unreadable: {1}")]
    CorruptRecord(String, String),

    #[error("no configured provider serves mode {0}")]
    NoApplicableProvider(&'static str),
}

/// Stored shape of a succeeded call's response column
#[derive(Debug, Serialize, Deserialize)]
struct StoredResponse {
    fares: Vec<FareOption>,
    #[serde(default)]
    failed_providers: Vec<BranchFailure>,
}

pub struct Orchestrator {
    registry: CallRegistry,
    state: SessionStateStore,
    adapters: Vec<Arc<dyn ProviderAdapter>>,
}

impl Orchestrator {
    pub fn new(
        registry: CallRegistry,
        state: SessionStateStore,
        adapters: Vec<Arc<dyn ProviderAdapter>>,
    ) -> Self {
        Self {
            registry,
            state,
            adapters,
        }
    }

    pub fn registry(&self) -> &CallRegistry {
        &self.registry
    }

    pub fn session_state(&self) -> &SessionStateStore {
        &self.state
    }

    /// Execute one logical tool call.
    ///
    /// Semantically identical requests within a conversation share one
    /// registry row: a terminal row replays its stored result with zero
    /// provider traffic, while a row left in `queued`/`running` by an
    /// interrupted attempt is re-executed (duplicate-insert prevention, not
    /// cross-restart single-flight).
    pub async fn execute(
        &self,
        conversation_id: &str,
        request: &ToolRequest,
    ) -> Result<AggregatedResult, ExecuteError> {
        let params_value = request.params_value()?;
        let recorded = self
            .registry
            .record_call(conversation_id, request.tool_name(), &params_value)
            .await?;
        let call = recorded.call;

        if recorded.existed && call.status.is_terminal() {
            debug!("Replaying terminal call {} ({})", call.id, call.status);
            return replay(call);
        }
        if recorded.existed {
            info!("Re-executing call {} left in {}", call.id, call.status);
        }

        if call.status == CallStatus::Queued {
            self.registry
                .update_call(&call.id, CallUpdate::running())
                .await?;
        }

        let ToolRequest::SearchFlights(params) = request;
        let applicable: Vec<Arc<dyn ProviderAdapter>> = self
            .adapters
            .iter()
            .filter(|a| a.serves(params.mode))
            .cloned()
            .collect();

        if applicable.is_empty() {
            self.registry
                .update_call(
                    &call.id,
                    CallUpdate::failed(format!(
                        "no configured provider serves mode {}",
                        params.mode.as_str()
                    )),
                )
                .await?;
            return Err(ExecuteError::NoApplicableProvider(params.mode.as_str()));
        }

        let branch_count = applicable.len();
        let branches = applicable.into_iter().map(|adapter| {
            let params = params.clone();
            async move {
                let name = adapter.name();
                match adapter.search(&params).await {
                    Ok(fares) => {
                        debug!("Branch {} returned {} fare(s)", name, fares.len());
                        Ok(fares)
                    }
                    Err(err) => {
                        warn!("Branch {} failed: {}", name, err);
                        Err(BranchFailure {
                            provider: name.to_string(),
                            reason: err.to_string(),
                        })
                    }
                }
            }
        });

        // Join, not fire-and-forget: every branch outcome is collected before
        // aggregation. Dropping this future drops the in-flight branches too.
        let settled = join_all(branches).await;

        let mut fares: Vec<FareOption> = Vec::new();
        let mut failures: Vec<BranchFailure> = Vec::new();
        for branch in settled {
            match branch {
                Ok(mut branch_fares) => fares.append(&mut branch_fares),
                Err(failure) => failures.push(failure),
            }
        }
        let succeeded_branches = branch_count - failures.len();

        let result = if succeeded_branches == 0 {
            let summary = failures
                .iter()
                .map(|f| format!("{}: {}", f.provider, f.reason))
                .collect::<Vec<_>>()
                .join("; ");
            let error = format!("all providers failed: {}", summary);

            self.registry
                .update_call(&call.id, CallUpdate::failed(error.clone()))
                .await?;

            AggregatedResult {
                call_id: call.id.clone(),
                reused: false,
                outcome: SearchOutcome::NoResults { error, failures },
            }
        } else {
            let stored = StoredResponse {
                fares,
                failed_providers: failures,
            };
            let response = serde_json::to_value(&stored)?;

            self.registry
                .update_call(&call.id, CallUpdate::succeeded(response))
                .await?;

            info!(
                "Call {} aggregated {} fare(s) from {}/{} branch(es)",
                call.id,
                stored.fares.len(),
                succeeded_branches,
                branch_count
            );

            AggregatedResult {
                call_id: call.id.clone(),
                reused: false,
                outcome: SearchOutcome::Results {
                    fares: stored.fares,
                    degraded: stored.failed_providers,
                },
            }
        };

        // The request itself is established context for follow-up turns even
        // when every branch failed.
        self.patch_last_search(conversation_id, &params_value).await?;

        Ok(result)
    }

    async fn patch_last_search(
        &self,
        conversation_id: &str,
        params: &Value,
    ) -> Result<(), ExecuteError> {
        let mut patch = serde_json::Map::new();
        patch.insert("last_search".to_string(), params.clone());
        self.state.merge(conversation_id, patch).await?;
        Ok(())
    }
}

/// Rebuild an aggregated result from a terminal registry row without any
/// provider traffic
fn replay(call: ToolCall) -> Result<AggregatedResult, ExecuteError> {
    let outcome = match call.status {
        CallStatus::Succeeded => {
            let response = call.response.ok_or_else(|| {
                ExecuteError::CorruptRecord(call.id.clone(), "succeeded without response".into())
            })?;
            let stored: StoredResponse = serde_json::from_value(response)
                .map_err(|e| ExecuteError::CorruptRecord(call.id.clone(), e.to_string()))?;
            SearchOutcome::Results {
                fares: stored.fares,
                degraded: stored.failed_providers,
            }
        }
        status => SearchOutcome::NoResults {
            error: call
                .error
                .unwrap_or_else(|| format!("call was {}", status)),
            failures: Vec::new(),
        },
    };

    Ok(AggregatedResult {
        call_id: call.id,
        reused: true,
        outcome,
    })
}
