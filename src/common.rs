//! Common types and utilities shared across handlers and services

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimestampError {
    #[error("unsupported timestamp shape: {0}")]
    UnsupportedShape(String),
    #[error("unparseable timestamp string: {0}")]
    Unparseable(String),
    #[error("timestamp out of range")]
    OutOfRange,
}

/// Timestamp object as written by document-store tooling (`{"seconds": .., "nanoseconds": ..}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeTimestamp {
    #[serde(alias = "_seconds")]
    pub seconds: i64,
    #[serde(default, alias = "_nanoseconds")]
    pub nanoseconds: u32,
}

/// Every shape a validity bound is accepted in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimestampInput {
    Native(NativeTimestamp),
    EpochSeconds(i64),
    Iso(String),
}

impl TimestampInput {
    /// Single conversion point used wherever validity bounds are compared.
    pub fn to_epoch_millis(&self) -> Result<i64, TimestampError> {
        match self {
            TimestampInput::Native(ts) => {
                if ts.nanoseconds >= 1_000_000_000 {
                    return Err(TimestampError::OutOfRange);
                }
                ts.seconds
                    .checked_mul(1000)
                    .and_then(|ms| ms.checked_add(i64::from(ts.nanoseconds / 1_000_000)))
                    .ok_or(TimestampError::OutOfRange)
            }
            TimestampInput::EpochSeconds(secs) => {
                secs.checked_mul(1000).ok_or(TimestampError::OutOfRange)
            }
            TimestampInput::Iso(raw) => parse_iso(raw).map(|dt| dt.timestamp_millis()),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            TimestampInput::Native(ts) => serde_json::json!({
                "seconds": ts.seconds,
                "nanoseconds": ts.nanoseconds,
            }),
            TimestampInput::EpochSeconds(secs) => Value::from(*secs),
            TimestampInput::Iso(raw) => Value::from(raw.clone()),
        }
    }
}

impl From<DateTime<Utc>> for TimestampInput {
    fn from(dt: DateTime<Utc>) -> Self {
        TimestampInput::Native(NativeTimestamp {
            seconds: dt.timestamp(),
            nanoseconds: dt.timestamp_subsec_nanos(),
        })
    }
}

/// Normalizes a stored validity bound to epoch milliseconds. Shapes outside
/// [`TimestampInput`] are errors, never defaults.
pub fn normalize_epoch_millis(value: &Value) -> Result<i64, TimestampError> {
    let input = match value {
        Value::Number(n) => TimestampInput::EpochSeconds(
            n.as_i64()
                .ok_or_else(|| TimestampError::UnsupportedShape(n.to_string()))?,
        ),
        Value::String(s) => TimestampInput::Iso(s.clone()),
        Value::Object(_) => serde_json::from_value::<NativeTimestamp>(value.clone())
            .map(TimestampInput::Native)
            .map_err(|_| TimestampError::UnsupportedShape(value.to_string()))?,
        other => return Err(TimestampError::UnsupportedShape(other.to_string())),
    };
    input.to_epoch_millis()
}

fn parse_iso(raw: &str) -> Result<DateTime<Utc>, TimestampError> {
    let trimmed = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }
    // Offset-less values are read as UTC.
    if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&midnight));
        }
    }
    Err(TimestampError::Unparseable(raw.to_string()))
}
