//! Health check handlers

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub status: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub index: CheckResult,
    pub providers: Vec<ProviderCheck>,
}

#[derive(Serialize)]
pub struct CheckResult {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize)]
pub struct ProviderCheck {
    pub name: String,
    pub circuit: String,
}

/// Liveness probe - always returns healthy if server is running
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: lexforge_common::VERSION,
    })
}

/// Readiness probe - the document index must answer.
///
/// An unavailable index is reported but does not stop answers, which fall
/// back to ungrounded generation, so this stays 200 with `degraded`.
pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let start = std::time::Instant::now();

    let index = match state.orchestrator.ping().await {
        Ok(_) => CheckResult {
            status: "up".to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
            error: None,
        },
        Err(e) => CheckResult {
            status: "down".to_string(),
            latency_ms: None,
            error: Some(e.to_string()),
        },
    };

    let providers: Vec<ProviderCheck> = state
        .orchestrator
        .circuit_states()
        .into_iter()
        .map(|(name, circuit)| ProviderCheck {
            name,
            circuit: circuit.as_str().to_string(),
        })
        .collect();

    let any_provider = providers.iter().any(|p| p.circuit != "open");
    let (status, code) = match (index.status == "up", any_provider) {
        (_, false) => ("not_ready", StatusCode::SERVICE_UNAVAILABLE),
        (true, true) => ("ready", StatusCode::OK),
        (false, true) => ("degraded", StatusCode::OK),
    };

    (
        code,
        Json(ReadyResponse {
            status: status.to_string(),
            checks: HealthChecks { index, providers },
        }),
    )
}
