//! Credential management module

pub mod token_cache;

pub use token_cache::{AccessToken, CredentialConfig, TokenCache, TokenError};
