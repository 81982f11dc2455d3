//! Read-side queries over the search index, recency buffer and error counters.
//! Holds no mutable state; safe to share across any number of request handlers.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

use crate::store::{SearchPage, Stores};
use crate::time_windows::{MinuteBucket, MINUTE_EXAMPLE};
use crate::types::EventRecord;

pub const DEFAULT_SEARCH_SIZE: usize = 20;
/// Elasticsearch's default `index.max_result_window`.
pub const MAX_SEARCH_SIZE: usize = 10_000;
pub const LATEST_LIMIT: usize = 50;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    /// Rejected before reaching any store.
    #[error("{0}")]
    InvalidParameter(String),

    /// A store call failed; details are logged, not returned.
    #[error("{0} failed")]
    Unavailable(&'static str),
}

impl QueryError {
    pub fn is_client_error(&self) -> bool {
        matches!(self, QueryError::InvalidParameter(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCount {
    pub minute: String,
    pub count: u64,
}

#[derive(Debug, Clone)]
pub struct QueryLimits {
    pub search_default_size: usize,
    pub search_max_size: usize,
    pub latest_limit: usize,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            search_default_size: DEFAULT_SEARCH_SIZE,
            search_max_size: MAX_SEARCH_SIZE,
            latest_limit: LATEST_LIMIT,
        }
    }
}

#[derive(Clone)]
pub struct QueryService {
    stores: Stores,
    limits: QueryLimits,
}

impl QueryService {
    pub fn new(stores: Stores, limits: QueryLimits) -> Self {
        Self { stores, limits }
    }

    /// Parse a raw `size` parameter; missing means the default, oversized is clamped.
    pub fn search_size(&self, raw: Option<&str>) -> Result<usize, QueryError> {
        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(self.limits.search_default_size);
        };
        let size: usize = raw.parse().map_err(|_| {
            QueryError::InvalidParameter(format!(
                "invalid size {raw:?}: expected a non-negative integer"
            ))
        })?;
        Ok(size.min(self.limits.search_max_size))
    }

    /// Newest-first matches for `query`; a blank query matches everything.
    pub async fn search(&self, query: &str, limit: usize) -> Result<SearchPage, QueryError> {
        let limit = limit.min(self.limits.search_max_size);
        self.stores.index.search(query, limit).await.map_err(|err| {
            error!(query, "search failed: {err:#}");
            QueryError::Unavailable("search")
        })
    }

    /// Most recent events from the recency buffer, newest first.
    pub async fn latest(&self) -> Result<Vec<EventRecord>, QueryError> {
        let raw = self
            .stores
            .recent
            .read_top(self.limits.latest_limit)
            .await
            .map_err(|err| {
                error!("reading recent events failed: {err:#}");
                QueryError::Unavailable("recent events")
            })?;

        let mut records = Vec::with_capacity(raw.len());
        for entry in raw {
            match serde_json::from_str::<EventRecord>(&entry) {
                Ok(record) => records.push(record),
                Err(err) => warn!("skipping unreadable recent entry: {err}"),
            }
        }
        Ok(records)
    }

    /// ERROR count for one minute bucket; 0 when absent or expired.
    pub async fn error_count(&self, minute: Option<&str>) -> Result<ErrorCount, QueryError> {
        let Some(minute) = minute.map(str::trim).filter(|m| !m.is_empty()) else {
            return Err(QueryError::InvalidParameter(format!(
                "provide minute param like {MINUTE_EXAMPLE}"
            )));
        };
        let bucket = MinuteBucket::parse(minute)
            .map_err(|err| QueryError::InvalidParameter(err.to_string()))?;

        let count = self.stores.errors.get(&bucket).await.map_err(|err| {
            error!(minute = %bucket, "reading error count failed: {err:#}");
            QueryError::Unavailable("error count")
        })?;

        Ok(ErrorCount {
            minute: bucket.to_string(),
            count,
        })
    }
}
