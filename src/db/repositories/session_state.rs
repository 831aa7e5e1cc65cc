//! Session state store
//!
//! One JSON object per conversation, patched by shallow merge after each
//! tool call so a follow-up turn can refer back to established context.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use tracing::debug;

use crate::db::{format_ts, Database};

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("session state for {0} is not a JSON object")]
    Corrupt(String),

    #[error("state store unavailable: {0}")]
    Unavailable(#[from] rusqlite::Error),
}

pub struct SessionStateStore {
    db: Database,
}

impl SessionStateStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Stored state for a conversation; an empty object if none exists yet
    pub async fn get(&self, conversation_id: &str) -> Result<Map<String, Value>, StateError> {
        let conn = self.db.lock().await;
        Self::read(&conn, conversation_id)
    }

    /// Shallow-merge `patch` over the stored state and return the result.
    ///
    /// Fields present in the patch win; absent fields are untouched; a field
    /// set to JSON null is removed. Runs as one read-modify-write under the
    /// connection lock, so in-process callers are serialized.
    pub async fn merge(
        &self,
        conversation_id: &str,
        patch: Map<String, Value>,
    ) -> Result<Map<String, Value>, StateError> {
        let conn = self.db.lock().await;
        let mut state = Self::read(&conn, conversation_id)?;

        for (field, value) in patch {
            if value.is_null() {
                state.remove(&field);
            } else {
                state.insert(field, value);
            }
        }

        conn.execute(
            "INSERT INTO session_state (conversation_id, state, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(conversation_id) DO UPDATE SET
                 state = excluded.state,
                 updated_at = excluded.updated_at",
            params![
                conversation_id,
                Value::Object(state.clone()).to_string(),
                format_ts(Utc::now()),
            ],
        )?;

        debug!("Patched session state for {}", conversation_id);
        Ok(state)
    }

    /// Delete the stored state entirely
    pub async fn clear(&self, conversation_id: &str) -> Result<(), StateError> {
        let conn = self.db.lock().await;
        conn.execute(
            "DELETE FROM session_state WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        debug!("Cleared session state for {}", conversation_id);
        Ok(())
    }

    fn read(conn: &Connection, conversation_id: &str) -> Result<Map<String, Value>, StateError> {
        let raw: Option<String> = conn
            .query_row(
                "SELECT state FROM session_state WHERE conversation_id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            None => Ok(Map::new()),
            Some(text) => match serde_json::from_str::<Value>(&text) {
                Ok(Value::Object(map)) => Ok(map),
                _ => Err(StateError::Corrupt(conversation_id.to_string())),
            },
        }
    }
}
