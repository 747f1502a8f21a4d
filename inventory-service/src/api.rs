use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use crate::error::StoreError;
use crate::models::{AssignmentView, StateCounts};
use crate::store::{AssignmentLedger, InventoryStore};

pub const DEFAULT_RECENT_LIMIT: i64 = 50;
pub const MAX_RECENT_LIMIT: i64 = 500;

#[derive(Clone)]
pub struct AppState {
    pub inventory: Arc<dyn InventoryStore>,
    pub ledger: Arc<dyn AssignmentLedger>,
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct SummaryResponse {
    pub accounts: StateCounts,
    pub total_accounts: i64,
    pub active_assignments: i64,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/customers/:email/assignments", get(customer_assignments))
        .route("/reports/summary", get(summary))
        .route("/assignments/recent", get(recent_assignments))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn customer_assignments(
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> Result<Json<Vec<AssignmentView>>, ApiError> {
    let email = email.trim();
    if email.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse { error: "customer email is required".to_string() }),
        ));
    }
    let views = state.ledger.active_for_customer(email).await.map_err(internal)?;
    Ok(Json(views))
}

pub async fn summary(State(state): State<AppState>) -> Result<Json<SummaryResponse>, ApiError> {
    let accounts = state.inventory.count_by_state().await.map_err(internal)?;
    let active_assignments = state.ledger.count_active().await.map_err(internal)?;

    Ok(Json(SummaryResponse {
        accounts,
        total_accounts: accounts.total(),
        active_assignments,
    }))
}

pub async fn recent_assignments(
    State(state): State<AppState>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<Vec<AssignmentView>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_RECENT_LIMIT).clamp(1, MAX_RECENT_LIMIT);
    let views = state.ledger.recent(limit).await.map_err(internal)?;
    Ok(Json(views))
}

pub async fn health_check() -> &'static str {
    "OK"
}

fn internal(e: StoreError) -> ApiError {
    tracing::error!("Query failed: {}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: format!("Failed to read inventory: {}", e),
        }),
    )
}
