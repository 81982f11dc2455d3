//! Logtrail - Kafka to Elasticsearch/Redis log ingestion with a small query API.

pub mod api;
pub mod config;
pub mod consumer;
pub mod error_counts;
pub mod es_http;
pub mod es_index;
pub mod es_query;
pub mod event_router;
pub mod kafka;
pub mod memory;
pub mod query;
pub mod recent;
pub mod store;
pub mod stream;
pub mod time_windows;
pub mod types;
