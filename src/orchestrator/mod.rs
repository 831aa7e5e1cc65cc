//! Orchestration module

pub mod executor;

pub use executor::{
    AggregatedResult, BranchFailure, ExecuteError, Orchestrator, SearchOutcome, ToolRequest,
};
