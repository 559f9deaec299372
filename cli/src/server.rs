//! HTTP read API over the projection.
//!
//! Every route is a read; nothing here writes to the store.

use std::future::Future;
use std::sync::Arc;

use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use chaintrace_core::error::IndexerError;
use chaintrace_core::indexer::{ScanStatus, StatusReport};
use chaintrace_core::query::{AuditTrail, Holding, QueryEngine, SupplyStats, TransactionProof};
use chaintrace_core::store::{ProjectionReader, ProjectionStore};
use chaintrace_core::types::{Participant, TransactionRecord};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub query: QueryEngine<dyn ProjectionStore>,
    pub status: Arc<ScanStatus>,
}

impl AppState {
    pub fn new(store: Arc<dyn ProjectionStore>, status: Arc<ScanStatus>) -> Self {
        Self {
            query: QueryEngine::new(store),
            status,
        }
    }
}

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Storage error: {0}")]
    Storage(#[from] IndexerError),
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Storage(e) => {
                error!(error = %e, "read query failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR")
            }
        };
        let body = ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

// ─── Bodies ───────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthBody {
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate counters. A counter the store failed to produce is `null`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsBody {
    pub total_users: Option<u64>,
    pub total_transactions: Option<u64>,
    pub total_products: Option<u64>,
    pub total_inventory_volume: Option<u64>,
    pub active_users: Option<u64>,
}

impl From<SupplyStats> for StatsBody {
    fn from(s: SupplyStats) -> Self {
        Self {
            total_users: s.total_participants,
            total_transactions: s.total_transactions,
            total_products: s.total_items,
            total_inventory_volume: s.total_inventory_volume,
            active_users: s.active_participants,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct InventoryParams {
    /// Report holdings as of this height instead of the live view.
    pub block: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofParams {
    pub block_number: u64,
    pub tx_hash: String,
}

// ─── Routes ───────────────────────────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/api/stats", get(stats))
        .route("/api/users", get(users))
        .route("/api/users/:address", get(user))
        .route("/api/users/:address/inventory", get(inventory))
        .route("/api/products/:barcode/history", get(history))
        .route("/api/transactions/proof", get(proof))
        .route("/api/audit/product/:barcode", get(audit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "HTTP API listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health() -> Json<HealthBody> {
    Json(HealthBody {
        status: "ok".into(),
        timestamp: Utc::now(),
    })
}

async fn status(State(state): State<AppState>) -> ApiResult<StatusReport> {
    let mut report = state.status.snapshot();
    if report.cursor.is_none() {
        report.cursor = state.query.reader().cursor().await?;
    }
    Ok(Json(report))
}

async fn stats(State(state): State<AppState>) -> Json<StatsBody> {
    Json(state.query.stats().await.into())
}

async fn users(State(state): State<AppState>) -> ApiResult<Vec<Participant>> {
    Ok(Json(state.query.participants().await?))
}

async fn user(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> ApiResult<Participant> {
    state
        .query
        .participant(&address)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("participant {address}")))
}

async fn inventory(
    State(state): State<AppState>,
    Path(address): Path<String>,
    params: Result<Query<InventoryParams>, QueryRejection>,
) -> ApiResult<Vec<Holding>> {
    let Query(params) = params?;
    Ok(Json(state.query.inventory(&address, params.block).await?))
}

async fn history(
    State(state): State<AppState>,
    Path(barcode): Path<String>,
) -> ApiResult<Vec<TransactionRecord>> {
    Ok(Json(state.query.history(&barcode).await?))
}

async fn proof(
    State(state): State<AppState>,
    params: Result<Query<ProofParams>, QueryRejection>,
) -> ApiResult<TransactionProof> {
    let Query(params) = params?;
    state
        .query
        .proof(params.block_number, &params.tx_hash)
        .await?
        .map(Json)
        .ok_or_else(|| {
            ApiError::NotFound(format!(
                "transaction {} in block {}",
                params.tx_hash, params.block_number
            ))
        })
}

async fn audit(
    State(state): State<AppState>,
    Path(barcode): Path<String>,
) -> ApiResult<AuditTrail> {
    state
        .query
        .audit_trail(&barcode)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("product {barcode}")))
}
