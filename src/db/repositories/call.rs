//! Tool call registry
//!
//! Durable, idempotent bookkeeping for tool invocations. Every logical call
//! gets exactly one row, keyed by a content hash of its identity, and moves
//! through a monotonic status machine until it reaches a terminal state.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::{format_ts, parse_ts, Database};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid status transition {from} -> {to} for call {id}")]
    InvalidStateTransition {
        id: String,
        from: CallStatus,
        to: CallStatus,
    },

    #[error("{field} may only be set alongside status {expected}")]
    MismatchedPayload {
        field: &'static str,
        expected: &'static str,
    },

    #[error("call not found: {0}")]
    NotFound(String),

    #[error("unknown call status: {0}")]
    UnknownStatus(String),

    #[error("registry unavailable: {0}")]
    Unavailable(#[from] rusqlite::Error),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Timeout,
    Canceled,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Queued => "queued",
            CallStatus::Running => "running",
            CallStatus::Succeeded => "succeeded",
            CallStatus::Failed => "failed",
            CallStatus::Timeout => "timeout",
            CallStatus::Canceled => "canceled",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, RegistryError> {
        match s {
            "queued" => Ok(CallStatus::Queued),
            "running" => Ok(CallStatus::Running),
            "succeeded" => Ok(CallStatus::Succeeded),
            "failed" => Ok(CallStatus::Failed),
            "timeout" => Ok(CallStatus::Timeout),
            "canceled" => Ok(CallStatus::Canceled),
            _ => Err(RegistryError::UnknownStatus(s.to_string())),
        }
    }

    /// A terminal status permits no further transition
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Succeeded | CallStatus::Failed | CallStatus::Timeout | CallStatus::Canceled
        )
    }

    /// Legal moves: `queued -> running`, and any terminal status from
    /// `queued` or `running`. `queued` is only ever assigned at creation.
    pub fn can_transition_to(&self, next: CallStatus) -> bool {
        match next {
            CallStatus::Queued => false,
            CallStatus::Running => *self == CallStatus::Queued,
            _ => !self.is_terminal(),
        }
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub conversation_id: String,
    pub tool_name: String,
    pub dedupe_key: String,
    pub status: CallStatus,
    pub request: Value,
    pub response: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Result of [`CallRegistry::record_call`]: the row plus whether it already
/// existed.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub call: ToolCall,
    pub existed: bool,
}

/// Partial update applied by [`CallRegistry::update_call`]. Absent fields are
/// left untouched.
#[derive(Debug, Default, Clone)]
pub struct CallUpdate {
    pub status: Option<CallStatus>,
    pub response: Option<Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl CallUpdate {
    pub fn running() -> Self {
        Self {
            status: Some(CallStatus::Running),
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn succeeded(response: Value) -> Self {
        Self {
            status: Some(CallStatus::Succeeded),
            response: Some(response),
            finished_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(CallStatus::Failed),
            error: Some(error.into()),
            finished_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn canceled() -> Self {
        Self {
            status: Some(CallStatus::Canceled),
            finished_at: Some(Utc::now()),
            ..Default::default()
        }
    }
}

/// Render a JSON value with object keys sorted recursively, so
/// structurally-equal payloads serialize to identical bytes.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        other => other.to_string(),
    }
}

/// Deterministic identity hash of one logical call
pub fn dedupe_key(conversation_id: &str, tool_name: &str, request: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(conversation_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(tool_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical_json(request).as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

pub struct CallRegistry {
    db: Database,
}

impl CallRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record one logical call, deduplicated by content hash.
    ///
    /// If a row with the same dedupe key already exists, its row is returned
    /// with `existed = true` and its status untouched. A lost insert race
    /// against a concurrent writer is detected through the unique-constraint
    /// violation and resolved by reading the winner's row, so callers never
    /// observe two ids for the same key.
    pub async fn record_call(
        &self,
        conversation_id: &str,
        tool_name: &str,
        request: &Value,
    ) -> Result<RecordedCall, RegistryError> {
        let key = dedupe_key(conversation_id, tool_name, request);
        let conn = self.db.lock().await;

        if let Some(existing) = Self::find_by_dedupe_key(&conn, &key)? {
            debug!("Reusing call {} for dedupe key {}", existing.id, key);
            return Ok(RecordedCall {
                call: existing,
                existed: true,
            });
        }

        let call = ToolCall {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            tool_name: tool_name.to_string(),
            dedupe_key: key.clone(),
            status: CallStatus::Queued,
            request: request.clone(),
            response: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };

        let inserted = conn.execute(
            "INSERT INTO tool_calls (id, conversation_id, tool_name, dedupe_key, status, request, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                call.id,
                call.conversation_id,
                call.tool_name,
                call.dedupe_key,
                call.status.as_str(),
                call.request.to_string(),
                format_ts(call.created_at),
            ],
        );

        match inserted {
            Ok(_) => {
                debug!(
                    "Recorded call {} ({} / {})",
                    call.id, conversation_id, tool_name
                );
                Ok(RecordedCall {
                    call,
                    existed: false,
                })
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                // Lost the insert race to a concurrent writer; their row wins
                let winner = Self::find_by_dedupe_key(&conn, &key)?
                    .ok_or_else(|| RegistryError::NotFound(key))?;
                debug!("Insert race on call {}, reusing winner", winner.id);
                Ok(RecordedCall {
                    call: winner,
                    existed: true,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Apply a partial update, enforcing the status machine and the
    /// payload pairing rules (`response` only with `succeeded`, `error` only
    /// with `failed`/`timeout`).
    pub async fn update_call(
        &self,
        id: &str,
        update: CallUpdate,
    ) -> Result<ToolCall, RegistryError> {
        if update.response.is_some() && update.status != Some(CallStatus::Succeeded) {
            return Err(RegistryError::MismatchedPayload {
                field: "response",
                expected: "succeeded",
            });
        }
        if update.error.is_some()
            && !matches!(
                update.status,
                Some(CallStatus::Failed) | Some(CallStatus::Timeout)
            )
        {
            return Err(RegistryError::MismatchedPayload {
                field: "error",
                expected: "failed or timeout",
            });
        }

        let conn = self.db.lock().await;
        let current = Self::find_by_id(&conn, id)?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        if let Some(next) = update.status {
            if !current.status.can_transition_to(next) {
                return Err(RegistryError::InvalidStateTransition {
                    id: id.to_string(),
                    from: current.status,
                    to: next,
                });
            }
        }

        conn.execute(
            "UPDATE tool_calls SET
                 status = COALESCE(?1, status),
                 response = COALESCE(?2, response),
                 error = COALESCE(?3, error),
                 started_at = COALESCE(?4, started_at),
                 finished_at = COALESCE(?5, finished_at)
             WHERE id = ?6",
            params![
                update.status.map(|s| s.as_str()),
                update.response.as_ref().map(|v| v.to_string()),
                update.error,
                update.started_at.map(format_ts),
                update.finished_at.map(format_ts),
                id,
            ],
        )?;

        let updated = Self::find_by_id(&conn, id)?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        if let Some(next) = update.status {
            debug!("Call {} moved {} -> {}", id, current.status, next);
        }

        Ok(updated)
    }

    /// Get a call by ID
    pub async fn get_call(&self, id: &str) -> Result<Option<ToolCall>, RegistryError> {
        let conn = self.db.lock().await;
        Self::find_by_id(&conn, id)
    }

    /// List recorded calls, newest first, optionally filtered
    pub async fn list_calls(
        &self,
        conversation_id: Option<&str>,
        status: Option<CallStatus>,
    ) -> Result<Vec<ToolCall>, RegistryError> {
        let conn = self.db.lock().await;

        let mut query = String::from(
            "SELECT id, conversation_id, tool_name, dedupe_key, status, request,
                    response, error, created_at, started_at, finished_at
             FROM tool_calls WHERE 1=1",
        );

        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if conversation_id.is_some() {
            query.push_str(" AND conversation_id = ?1");
        }
        if status.is_some() {
            let param_num = if conversation_id.is_some() { 2 } else { 1 };
            query.push_str(&format!(" AND status = ?{}", param_num));
        }
        query.push_str(" ORDER BY created_at DESC");

        let mut stmt = conn.prepare(&query)?;

        if let Some(cid) = conversation_id {
            params.push(Box::new(cid.to_string()));
        }
        if let Some(st) = status {
            params.push(Box::new(st.as_str().to_string()));
        }

        let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(params_refs.as_slice(), Self::map_row)?;

        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Housekeeping sweep: move `running` rows whose `started_at` is older
    /// than the threshold to `timeout`. Owned by the operator, never called
    /// from the execute path.
    pub async fn reclaim_stale_running(
        &self,
        older_than: Duration,
    ) -> Result<u64, RegistryError> {
        let conn = self.db.lock().await;
        let cutoff = format_ts(Utc::now() - older_than);
        let now = format_ts(Utc::now());

        let moved = conn.execute(
            "UPDATE tool_calls
             SET status = 'timeout',
                 error = 'reclaimed: no progress past staleness threshold',
                 finished_at = ?1
             WHERE status = 'running' AND started_at IS NOT NULL AND started_at < ?2",
            params![now, cutoff],
        )?;

        if moved > 0 {
            warn!("Reclaimed {} stale running call(s)", moved);
        }

        Ok(moved as u64)
    }

    fn find_by_id(conn: &Connection, id: &str) -> Result<Option<ToolCall>, RegistryError> {
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, tool_name, dedupe_key, status, request,
                    response, error, created_at, started_at, finished_at
             FROM tool_calls WHERE id = ?1",
        )?;
        Ok(stmt.query_row(params![id], Self::map_row).optional()?)
    }

    fn find_by_dedupe_key(conn: &Connection, key: &str) -> Result<Option<ToolCall>, RegistryError> {
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, tool_name, dedupe_key, status, request,
                    response, error, created_at, started_at, finished_at
             FROM tool_calls WHERE dedupe_key = ?1",
        )?;
        Ok(stmt.query_row(params![key], Self::map_row).optional()?)
    }

    fn map_row(row: &rusqlite::Row) -> rusqlite::Result<ToolCall> {
        let status_raw: String = row.get(4)?;
        let status = CallStatus::from_str(&status_raw)
            .map_err(|e| conversion_error(4, e))?;

        let request_raw: String = row.get(5)?;
        let request: Value =
            serde_json::from_str(&request_raw).map_err(|e| conversion_error(5, e))?;

        let response = row
            .get::<_, Option<String>>(6)?
            .map(|raw| serde_json::from_str(&raw).map_err(|e| conversion_error(6, e)))
            .transpose()?;

        let created_at_raw: String = row.get(8)?;
        let created_at = parse_ts(&created_at_raw).map_err(|e| conversion_error(8, e))?;

        let started_at = row
            .get::<_, Option<String>>(9)?
            .map(|raw| parse_ts(&raw).map_err(|e| conversion_error(9, e)))
            .transpose()?;

        let finished_at = row
            .get::<_, Option<String>>(10)?
            .map(|raw| parse_ts(&raw).map_err(|e| conversion_error(10, e)))
            .transpose()?;

        Ok(ToolCall {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            tool_name: row.get(2)?,
            dedupe_key: row.get(3)?,
            status,
            request,
            response,
            error: row.get(7)?,
            created_at,
            started_at,
            finished_at,
        })
    }
}

fn conversion_error(
    index: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(err))
}
