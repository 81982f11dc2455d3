use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;

/// Minute-resolution key format, e.g. `2023-08-01T15:04`.
pub const MINUTE_FORMAT: &str = "%Y-%m-%dT%H:%M";

/// Example shown to clients that send a bad or missing minute.
pub const MINUTE_EXAMPLE: &str = "2023-08-01T15:04";

const MINUTE_KEY_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid minute {value:?}: expected YYYY-MM-DDTHH:MM, e.g. {MINUTE_EXAMPLE}")]
pub struct MinuteError {
    pub value: String,
}

/// A UTC minute used to aggregate error counts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MinuteBucket(String);

impl MinuteBucket {
    /// Truncate an instant to its UTC minute.
    pub fn from_datetime(ts: &DateTime<Utc>) -> Self {
        Self(ts.format(MINUTE_FORMAT).to_string())
    }

    /// Parse a client-supplied key. Only the exact zero-padded form is accepted.
    pub fn parse(raw: &str) -> Result<Self, MinuteError> {
        let err = || MinuteError {
            value: raw.to_string(),
        };
        if raw.len() != MINUTE_KEY_LEN {
            return Err(err());
        }
        let parsed = NaiveDateTime::parse_from_str(raw, MINUTE_FORMAT).map_err(|_| err())?;
        let canonical = parsed.format(MINUTE_FORMAT).to_string();
        if canonical != raw {
            return Err(err());
        }
        Ok(Self(canonical))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Store key for this bucket, `<prefix>:<minute>`.
    pub fn key(&self, prefix: &str) -> String {
        format!("{}:{}", prefix, self.0)
    }
}

impl fmt::Display for MinuteBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
