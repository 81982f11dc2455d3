//! HTTP surface for the query service.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::query::{ErrorCount, QueryError, QueryService};
use crate::store::SearchPage;
use crate::types::EventRecord;

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub q: Option<String>,
    /// Kept as text so a bad value gets the same JSON error as other client errors.
    pub size: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ErrorsParams {
    pub minute: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl IntoResponse for QueryError {
    fn into_response(self) -> Response {
        let status = if self.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub fn create_router(service: Arc<QueryService>) -> Router {
    Router::new()
        .route("/search", get(search))
        .route("/latest", get(latest))
        .route("/errors", get(errors))
        .with_state(service)
        .layer(TraceLayer::new_for_http())
}

async fn search(
    State(service): State<Arc<QueryService>>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchPage>, QueryError> {
    let size = service.search_size(params.size.as_deref())?;
    let page = service
        .search(params.q.as_deref().unwrap_or(""), size)
        .await?;
    Ok(Json(page))
}

async fn latest(
    State(service): State<Arc<QueryService>>,
) -> Result<Json<Vec<EventRecord>>, QueryError> {
    Ok(Json(service.latest().await?))
}

async fn errors(
    State(service): State<Arc<QueryService>>,
    Query(params): Query<ErrorsParams>,
) -> Result<Json<ErrorCount>, QueryError> {
    Ok(Json(service.error_count(params.minute.as_deref()).await?))
}

/// Serve the query API until `shutdown` fires.
pub async fn serve(
    addr: SocketAddr,
    service: Arc<QueryService>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding query api to {addr}"))?;
    info!(%addr, "query api listening");
    axum::serve(listener, create_router(service))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("query api server")?;
    info!("query api stopped");
    Ok(())
}
