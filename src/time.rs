//! UTC timestamp codec shared by the upstream client and state store.
//!
//! Mirrors the original `time_helper.py`: a trailing `Z` is treated as
//! `+00:00` on parse, and `format` always renders a literal trailing `Z`
//! at second precision rather than `+00:00`.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::TriageError;

pub fn parse(s: &str) -> Result<DateTime<Utc>, TriageError> {
    let normalized = if let Some(stripped) = s.strip_suffix('Z') {
        format!("{stripped}+00:00")
    } else {
        s.to_string()
    };

    DateTime::parse_from_rfc3339(&normalized)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| TriageError::ParseTime(s.to_string()))
}

pub fn format(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// `parse` with a wall-clock fallback, used when ingesting a record whose
/// `requested_datetime` failed to parse (invariant 3, §3).
pub fn parse_or_now(s: &str) -> i64 {
    parse(s).map(|dt| dt.timestamp()).unwrap_or_else(|_| Utc::now().timestamp())
}
