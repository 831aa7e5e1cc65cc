//! Cached token repository
//!
//! Rows are append-mostly: inserted on refresh, deleted by cleanup, never
//! updated in place, which keeps concurrent refreshes conflict-free.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::db::{format_ts, parse_ts, Database};

#[derive(Debug, Clone)]
pub struct CachedToken {
    pub environment: String,
    pub access_token: String,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

pub struct TokenStore {
    db: Database,
}

impl TokenStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Freshest token for `environment` still valid past `not_before`
    pub async fn find_valid(
        &self,
        environment: &str,
        not_before: DateTime<Utc>,
    ) -> Result<Option<CachedToken>, rusqlite::Error> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT environment, access_token, token_type, expires_at, created_at
             FROM cached_tokens
             WHERE environment = ?1 AND expires_at > ?2
             ORDER BY expires_at DESC
             LIMIT 1",
        )?;

        stmt.query_row(params![environment, format_ts(not_before)], |row| {
            let expires_raw: String = row.get(3)?;
            let created_raw: String = row.get(4)?;
            Ok(CachedToken {
                environment: row.get(0)?,
                access_token: row.get(1)?,
                token_type: row.get(2)?,
                expires_at: parse_ts(&expires_raw).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        3,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?,
                created_at: parse_ts(&created_raw).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        4,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?,
            })
        })
        .optional()
    }

    pub async fn insert(&self, token: &CachedToken) -> Result<(), rusqlite::Error> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO cached_tokens (environment, access_token, token_type, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                token.environment,
                token.access_token,
                token.token_type,
                format_ts(token.expires_at),
                format_ts(token.created_at),
            ],
        )?;
        Ok(())
    }

    /// Delete rows already past expiry as of `now`. Never touches a token
    /// that is still valid.
    pub async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, rusqlite::Error> {
        let conn = self.db.lock().await;
        let deleted = conn.execute(
            "DELETE FROM cached_tokens WHERE expires_at <= ?1",
            params![format_ts(now)],
        )?;
        Ok(deleted as u64)
    }
}
