//! Database module

pub mod connection;
pub mod repositories;
pub mod schema;

pub use connection::Database;

use chrono::{DateTime, SecondsFormat, Utc};

/// Fixed-width timestamp rendering so stored values compare correctly as text
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
}
