//! Unix-second timestamps as used in backup identifiers.

use crate::utils::errors::{AgentError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};

pub const SECONDS_PER_DAY: u64 = 86_400;

pub fn now_timestamp() -> u64 {
    u64::try_from(Utc::now().timestamp()).unwrap_or(0)
}

/// `days` in seconds, saturating at `u64::MAX`.
pub fn days_to_seconds(days: u64) -> u64 {
    days.saturating_mul(SECONDS_PER_DAY)
}

/// Timestamp `days` before `now`, never earlier than the epoch.
pub fn days_before(now: u64, days: u64) -> u64 {
    now.saturating_sub(days_to_seconds(days))
}

/// Parse a unix timestamp, an RFC 3339 date or a naive `YYYY-MM-DDTHH:MM:SS` (UTC).
pub fn parse_timestamp(value: &str) -> Result<u64> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Ok(seconds);
    }

    let parsed = DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.timestamp())
        .or_else(|_| {
            NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S").map(|dt| dt.and_utc().timestamp())
        })
        .map_err(|e| AgentError::Parse(format!("invalid date {:?}: {}", value, e)))?;

    u64::try_from(parsed).map_err(|_| AgentError::Parse(format!("date {:?} is before 1970", value)))
}
