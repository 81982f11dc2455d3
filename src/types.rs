use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::time_windows::MinuteBucket;

/// Offset-less ISO 8601 form, read as UTC.
const NAIVE_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Log severity as emitted by producers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed log line, as carried on the stream and stored in every derived store.
///
/// `timestamp` keeps the producer's original RFC 3339 string so the indexed
/// document matches what was delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    pub timestamp: String,
    pub service: String,
    pub severity: Severity,
    pub message: String,
}

/// Why a stream payload could not become an [`EventRecord`].
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("undecodable record: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("record id is empty")]
    EmptyId,

    #[error("record id {0:?} is a relative path segment")]
    DotSegmentId(String),

    #[error("invalid timestamp {value:?}: {reason}")]
    InvalidTimestamp { value: String, reason: String },
}

impl EventRecord {
    /// Deserialize and validate a raw stream payload.
    pub fn from_slice(payload: &[u8]) -> Result<Self, RecordError> {
        let record: EventRecord = serde_json::from_slice(payload)?;
        record.validate()?;
        Ok(record)
    }

    pub fn validate(&self) -> Result<(), RecordError> {
        if self.id.trim().is_empty() {
            return Err(RecordError::EmptyId);
        }
        if is_dot_segment(&self.id) {
            return Err(RecordError::DotSegmentId(self.id.clone()));
        }
        self.event_time()?;
        Ok(())
    }

    /// Producer-assigned event time, normalized to UTC.
    /// RFC 3339 first; a timestamp without an offset is taken as UTC.
    pub fn event_time(&self) -> Result<DateTime<Utc>, RecordError> {
        let raw = self.timestamp.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Ok(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, NAIVE_TIMESTAMP_FORMAT)
            .map(|naive| naive.and_utc())
            .map_err(|err| RecordError::InvalidTimestamp {
                value: self.timestamp.clone(),
                reason: err.to_string(),
            })
    }

    pub fn minute_bucket(&self) -> Result<MinuteBucket, RecordError> {
        Ok(MinuteBucket::from_datetime(&self.event_time()?))
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// `.` and `..` collapse when used as a URL path segment, so they cannot name a document.
pub fn is_dot_segment(id: &str) -> bool {
    matches!(id, "." | "..")
}
