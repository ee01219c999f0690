//! Metrics snapshot handler

use axum::{extract::State, Json};

use crate::AppState;
use lexforge_common::QueryMetrics;

/// Aggregated query metrics since startup
pub async fn snapshot(State(state): State<AppState>) -> Json<QueryMetrics> {
    Json(state.orchestrator.metrics())
}
