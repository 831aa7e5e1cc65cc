//! CLI commands

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate};
use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::core::AppState;
use crate::db::repositories::call::CallStatus;
use crate::orchestrator::{SearchOutcome, ToolRequest};
use crate::provider::{Cabin, SearchMode, SearchParams};

#[derive(Parser)]
#[command(name = "faregate")]
#[command(about = "Tool-call orchestration for flight-inventory providers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config path (default: ~/.faregate/config.yaml)
    #[arg(long)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a flight search through the orchestrator
    Search {
        /// Conversation the search belongs to
        #[arg(long)]
        conversation: String,

        /// Origin airport code
        #[arg(long)]
        origin: String,

        /// Destination airport code
        #[arg(long)]
        destination: String,

        /// Departure date (YYYY-MM-DD)
        #[arg(long)]
        date: String,

        /// Return date (YYYY-MM-DD)
        #[arg(long)]
        return_date: Option<String>,

        /// Passenger count
        #[arg(long, default_value = "1")]
        passengers: u8,

        /// Cabin (economy, premium_economy, business, first)
        #[arg(long)]
        cabin: Option<String>,

        /// Fare mode (award, cash, both)
        #[arg(long, default_value = "both")]
        mode: String,
    },

    /// List recorded tool calls
    Calls {
        /// Filter by conversation
        #[arg(long)]
        conversation: Option<String>,

        /// Filter by status
        #[arg(long)]
        status: Option<String>,
    },

    /// Show one recorded call in full
    ShowCall {
        /// Call ID
        call_id: String,
    },

    /// Show a conversation's session state
    State {
        /// Conversation ID
        conversation: String,
    },

    /// Clear a conversation's session state
    ClearState {
        /// Conversation ID
        conversation: String,
    },

    /// Move stale running calls to timeout
    Sweep {
        /// Staleness threshold in minutes
        #[arg(long, default_value = "10")]
        older_than_mins: i64,
    },

    /// Delete expired cached tokens
    CleanupTokens,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;
    let state = AppState::new(&config)?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(async {
        match cli.command {
            Commands::Search {
                conversation,
                origin,
                destination,
                date,
                return_date,
                passengers,
                cabin,
                mode,
            } => {
                let departure_date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
                    .context("Departure date must be YYYY-MM-DD")?;
                let return_date = return_date
                    .map(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d"))
                    .transpose()
                    .context("Return date must be YYYY-MM-DD")?;
                let cabin = cabin.map(|c| Cabin::from_str(&c)).transpose()?;
                let mode = SearchMode::from_str(&mode)?;

                let request = ToolRequest::SearchFlights(SearchParams {
                    origin,
                    destination,
                    departure_date,
                    return_date,
                    passengers,
                    cabin,
                    mode,
                });

                let result = state.orchestrator.execute(&conversation, &request).await?;

                if result.reused {
                    println!("(reusing recorded call {})", result.call_id);
                }
                match result.outcome {
                    SearchOutcome::Results { fares, degraded } => {
                        for fare in &fares {
                            println!(
                                "[{}] {} {} {} -> {} {} ({}) {}",
                                fare.provider,
                                fare.carrier,
                                fare.flight_number,
                                fare.origin,
                                fare.destination,
                                fare.departs_at,
                                fare.cabin.as_str(),
                                fare.price,
                            );
                        }
                        println!("{} fare(s)", fares.len());
                        for failure in degraded {
                            println!("warning: {} failed: {}", failure.provider, failure.reason);
                        }
                    }
                    SearchOutcome::NoResults { error, .. } => {
                        println!("No results: {}", error);
                    }
                }
                Ok(())
            }

            Commands::Calls {
                conversation,
                status,
            } => {
                let status = status.map(|s| CallStatus::from_str(&s)).transpose()?;
                let calls = state
                    .orchestrator
                    .registry()
                    .list_calls(conversation.as_deref(), status)
                    .await?;

                if calls.is_empty() {
                    println!("No calls found");
                } else {
                    for call in calls {
                        println!(
                            "[{}] {} - {} ({}) - {}",
                            call.id.chars().take(8).collect::<String>(),
                            call.conversation_id,
                            call.tool_name,
                            call.status,
                            call.error.as_deref().unwrap_or("-"),
                        );
                    }
                }
                Ok(())
            }

            Commands::ShowCall { call_id } => {
                match state.orchestrator.registry().get_call(&call_id).await? {
                    Some(call) => println!("{}", serde_json::to_string_pretty(&call)?),
                    None => println!("Call not found: {}", call_id),
                }
                Ok(())
            }

            Commands::State { conversation } => {
                let stored = state
                    .orchestrator
                    .session_state()
                    .get(&conversation)
                    .await?;
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::Value::Object(stored))?
                );
                Ok(())
            }

            Commands::ClearState { conversation } => {
                state
                    .orchestrator
                    .session_state()
                    .clear(&conversation)
                    .await?;
                println!("Cleared state for {}", conversation);
                Ok(())
            }

            Commands::Sweep { older_than_mins } => {
                let reclaimed = state
                    .orchestrator
                    .registry()
                    .reclaim_stale_running(Duration::minutes(older_than_mins))
                    .await?;
                println!("Reclaimed {} stale call(s)", reclaimed);
                Ok(())
            }

            Commands::CleanupTokens => {
                let deleted = state.token_cache.cleanup_expired().await?;
                println!("Deleted {} expired token(s)", deleted);
                Ok(())
            }
        }
    })
}
