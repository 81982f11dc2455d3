//! Tests for the HTTP query API.
//! Drives the router in-process; no listener is bound.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use logtrail::api::{create_router, ErrorBody};
use logtrail::consumer::IngestPipeline;
use logtrail::memory::{MemoryErrorCounters, MemoryRecencyBuffer, MemorySearchIndex};
use logtrail::query::{ErrorCount, QueryLimits, QueryService};
use logtrail::store::{ErrorCounterStore, SearchPage, Stores};
use logtrail::stream::StreamRecord;
use logtrail::time_windows::MinuteBucket;
use logtrail::types::EventRecord;
use serde::de::DeserializeOwned;
use tower::ServiceExt;

fn memory_stores() -> Stores {
    Stores::new(
        Arc::new(MemorySearchIndex::new()),
        Arc::new(MemoryRecencyBuffer::new(100)),
        Arc::new(MemoryErrorCounters::new(Duration::from_secs(48 * 3600))),
    )
}

fn app(stores: Stores) -> Router {
    create_router(Arc::new(QueryService::new(stores, QueryLimits::default())))
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Bytes) {
    let resp = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (status, body)
}

fn json<T: DeserializeOwned>(body: &[u8]) -> T {
    serde_json::from_slice(body).unwrap()
}

async fn ingest(stores: &Stores, id: &str, timestamp: &str, severity: &str) {
    let payload = format!(
        r#"{{"id":"{id}","timestamp":"{timestamp}","service":"orders","severity":"{severity}","message":"payment failed"}}"#
    );
    IngestPipeline::new(stores.clone())
        .handle(&StreamRecord::new(0, 0, payload.into_bytes()))
        .await
        .unwrap();
}

// ============================================================================
// /errors
// ============================================================================

#[tokio::test]
async fn test_errors_missing_minute_is_bad_request() {
    let app = app(memory_stores());
    let (status, body) = get(&app, "/errors").await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: ErrorBody = json(&body);
    assert_eq!(body.error, "provide minute param like 2023-08-01T15:04");
}

#[tokio::test]
async fn test_errors_malformed_minute_is_bad_request() {
    let app = app(memory_stores());
    let (status, _) = get(&app, "/errors?minute=yesterday").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_errors_minute_scenario() {
    let stores = memory_stores();
    let app = app(stores.clone());

    ingest(&stores, "a1", "2023-08-01T15:04:10Z", "ERROR").await;
    let (status, body) = get(&app, "/errors?minute=2023-08-01T15:04").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        json::<ErrorCount>(&body),
        ErrorCount {
            minute: "2023-08-01T15:04".into(),
            count: 1
        }
    );

    ingest(&stores, "a2", "2023-08-01T15:04:45Z", "ERROR").await;
    ingest(&stores, "a3", "2023-08-01T15:05:00Z", "ERROR").await;

    let (_, body) = get(&app, "/errors?minute=2023-08-01T15:04").await;
    assert_eq!(json::<ErrorCount>(&body).count, 2);
    let (_, body) = get(&app, "/errors?minute=2023-08-01T15:05").await;
    assert_eq!(json::<ErrorCount>(&body).count, 1);
}

#[tokio::test]
async fn test_errors_store_failure_is_server_error() {
    struct Down;

    #[async_trait]
    impl ErrorCounterStore for Down {
        async fn increment(&self, _bucket: &MinuteBucket) -> Result<u64> {
            anyhow::bail!("redis down")
        }
        async fn get(&self, _bucket: &MinuteBucket) -> Result<u64> {
            anyhow::bail!("redis down")
        }
    }

    let stores = Stores::new(
        Arc::new(MemorySearchIndex::new()),
        Arc::new(MemoryRecencyBuffer::new(100)),
        Arc::new(Down),
    );
    let (status, body) = get(&app(stores), "/errors?minute=2023-08-01T15:04").await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let body: ErrorBody = json(&body);
    assert!(!body.error.contains("redis down"));
}

// ============================================================================
// /latest
// ============================================================================

#[tokio::test]
async fn test_latest_returns_newest_first() {
    let stores = memory_stores();
    for id in ["A", "B", "C"] {
        ingest(&stores, id, "2023-08-01T15:04:10Z", "INFO").await;
    }

    let (status, body) = get(&app(stores), "/latest").await;
    assert_eq!(status, StatusCode::OK);
    let records: Vec<EventRecord> = json(&body);
    let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["C", "B", "A"]);
}

#[tokio::test]
async fn test_latest_empty_buffer() {
    let (status, body) = get(&app(memory_stores()), "/latest").await;
    assert_eq!(status, StatusCode::OK);
    assert!(json::<Vec<EventRecord>>(&body).is_empty());
}

// ============================================================================
// /search
// ============================================================================

#[tokio::test]
async fn test_search_without_query_lists_everything() {
    let stores = memory_stores();
    ingest(&stores, "a1", "2023-08-01T15:04:10Z", "INFO").await;
    ingest(&stores, "a2", "2023-08-01T15:06:10Z", "WARN").await;

    let (status, body) = get(&app(stores), "/search").await;
    assert_eq!(status, StatusCode::OK);
    let page: SearchPage = json(&body);
    assert_eq!(page.total, 2);
    assert_eq!(page.hits[0].id, "a2");
}

#[tokio::test]
async fn test_search_with_query_and_size() {
    let stores = memory_stores();
    for i in 0..4 {
        ingest(&stores, &format!("e{i}"), "2023-08-01T15:04:10Z", "ERROR").await;
    }

    let (status, body) = get(&app(stores), "/search?q=payment&size=3").await;
    assert_eq!(status, StatusCode::OK);
    let page: SearchPage = json(&body);
    assert_eq!(page.total, 4);
    assert_eq!(page.hits.len(), 3);
}

#[tokio::test]
async fn test_search_bad_size_is_bad_request() {
    let (status, body) = get(&app(memory_stores()), "/search?size=lots").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: ErrorBody = json(&body);
    assert!(body.error.contains("size"));
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let (status, _) = get(&app(memory_stores()), "/metrics").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
