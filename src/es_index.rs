//! Elasticsearch-backed search index for event documents.
//! Documents are keyed by event id so redelivered events overwrite in place.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::es_http::{encode_path_segment, EsHttp};
use crate::es_query;
use crate::store::{SearchIndex, SearchPage};
use crate::types::{is_dot_segment, EventRecord};

#[derive(Clone)]
pub struct EsIndex {
    http: EsHttp,
    index: Arc<str>,
}

impl EsIndex {
    pub fn new(
        base_url: impl Into<Arc<str>>,
        user: impl Into<Arc<str>>,
        pass: impl Into<Arc<str>>,
        timeout: Duration,
        index: impl Into<Arc<str>>,
    ) -> Result<Self> {
        Ok(Self {
            http: EsHttp::new(base_url, user, pass, timeout, true)?,
            index: index.into(),
        })
    }

    fn doc_path(&self, id: &str) -> String {
        format!(
            "{}/_doc/{}?refresh=false",
            self.index,
            encode_path_segment(id)
        )
    }
}

#[async_trait]
impl SearchIndex for EsIndex {
    async fn ensure_schema(&self) -> Result<bool> {
        if self
            .http
            .exists(&self.index, "es index exists check")
            .await?
        {
            info!(index = %self.index, "es index exists");
            return Ok(false);
        }

        let body = es_query::index_mapping_body();
        let resp = self
            .http
            .send(
                self.http.request(Method::PUT, &self.index).json(&body),
                "es create index",
                &[StatusCode::BAD_REQUEST],
            )
            .await?;

        if resp.status().is_success() {
            info!(index = %self.index, "created es index");
            return Ok(true);
        }

        // Another consumer may have created it between the check and the create.
        let text = resp.text().await.unwrap_or_default();
        if text.contains("resource_already_exists_exception") {
            info!(index = %self.index, "es index created concurrently");
            return Ok(false);
        }
        anyhow::bail!("es create index {} rejected: {}", self.index, text);
    }

    async fn upsert(&self, record: &EventRecord) -> Result<()> {
        if is_dot_segment(&record.id) {
            anyhow::bail!("document id {:?} cannot be addressed by path", record.id);
        }
        let _: Value = self
            .http
            .call_json(Method::PUT, &self.doc_path(&record.id), record, "es index document")
            .await
            .with_context(|| format!("indexing document {}", record.id))?;
        debug!(id = %record.id, index = %self.index, "indexed document");
        Ok(())
    }

    async fn search(&self, query: &str, limit: usize) -> Result<SearchPage> {
        let body = es_query::search_body(query, limit);
        let resp: Value = self
            .http
            .call_json(
                Method::POST,
                &format!("{}/_search", self.index),
                &body,
                "es search",
            )
            .await?;

        let total = es_query::total_hits(&resp);
        let raw_hits = resp
            .pointer("/hits/hits")
            .and_then(|h| h.as_array())
            .cloned()
            .unwrap_or_default();

        let mut hits = Vec::with_capacity(raw_hits.len());
        for hit in raw_hits {
            let Some(source) = hit.get("_source").cloned() else {
                continue;
            };
            match serde_json::from_value::<EventRecord>(source) {
                Ok(record) => hits.push(record),
                Err(err) => warn!(
                    id = hit.get("_id").and_then(|v| v.as_str()).unwrap_or(""),
                    "skipping unreadable search hit: {err}"
                ),
            }
        }

        Ok(SearchPage { total, hits })
    }
}
