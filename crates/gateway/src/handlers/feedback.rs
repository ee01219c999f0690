//! Feedback handlers

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::AppState;
use lexforge_common::errors::{AppError, Result};

/// Feedback request
#[derive(Debug, Deserialize, Validate)]
pub struct FeedbackRequest {
    #[validate(length(min = 1, max = 4000))]
    pub query: String,

    #[validate(length(min = 1, max = 20000))]
    pub answer: String,

    /// 1 to 5; out-of-range values are rejected with `INVALID_RATING`
    pub rating: u8,

    #[validate(length(min = 1, max = 128))]
    pub session_id: String,

    #[validate(length(max = 2000))]
    pub text: Option<String>,
}

#[derive(Serialize)]
pub struct FeedbackResponse {
    pub id: Uuid,
    pub rating: u8,
    pub average_rating: f64,
}

/// Rate an answer
pub async fn submit_feedback(
    State(state): State<AppState>,
    Json(request): Json<FeedbackRequest>,
) -> Result<(StatusCode, Json<FeedbackResponse>)> {
    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: None,
    })?;

    let record = state
        .orchestrator
        .submit_feedback(
            &request.query,
            &request.answer,
            request.rating,
            &request.session_id,
            request.text,
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(FeedbackResponse {
            id: record.id,
            rating: record.rating,
            average_rating: state.orchestrator.metrics().average_rating,
        }),
    ))
}
