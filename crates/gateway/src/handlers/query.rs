//! Query handlers

use axum::{
    extract::State,
    http::{HeaderMap, HeaderValue},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use uuid::Uuid;
use validator::Validate;

use crate::AppState;
use lexforge_common::errors::{AppError, Result};
use lexforge_context::{Query, QueryOptions, QueryResponse};

/// Header carrying the session a query was answered in
pub const SESSION_HEADER: &str = "x-session-id";

/// Query request
#[derive(Debug, Deserialize, Validate)]
pub struct QueryRequest {
    #[validate(length(max = 4000))]
    pub query: String,

    /// Conversation to continue; a new one is started when absent
    #[validate(length(min = 1, max = 128))]
    pub session_id: Option<String>,

    #[serde(default)]
    pub options: QueryOptions,
}

impl QueryRequest {
    fn into_query(self) -> Result<Query> {
        self.validate().map_err(|e| AppError::Validation {
            message: e.to_string(),
            field: None,
        })?;

        let session_id = self
            .session_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Ok(Query::new(self.query, session_id).with_options(self.options))
    }
}

/// Query response
#[derive(Serialize)]
pub struct QueryEnvelope {
    pub session_id: String,
    #[serde(flatten)]
    pub response: QueryResponse,
}

/// Answer a question; `options.stream` switches to server-sent events
pub async fn query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Response> {
    let query = request.into_query()?;
    if query.options.stream {
        return stream_response(&state, query).await;
    }
    let session_id = query.session_id.clone();

    let response = state.orchestrator.query(query).await?;

    tracing::info!(
        session_id = %session_id,
        cache_status = response.cache_status.as_str(),
        documents = response.documents.len(),
        degraded = response.degraded,
        latency_ms = response.latency_ms,
        "Query answered"
    );

    Ok(Json(QueryEnvelope {
        session_id,
        response,
    })
    .into_response())
}

/// Answer a question as server-sent events.
///
/// Events are named after their `type`; a `reset` event voids the text
/// streamed so far.
pub async fn query_stream(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Response> {
    let query = request.into_query()?;
    stream_response(&state, query).await
}

async fn stream_response(state: &AppState, query: Query) -> Result<Response> {
    let session_id = query.session_id.clone();

    let events = state.orchestrator.query_stream(query).await?.map(|event| {
        let sse = match Event::default().event(event.name()).json_data(&event) {
            Ok(sse) => sse,
            Err(e) => Event::default().event("failed").data(e.to_string()),
        };
        Ok::<_, Infallible>(sse)
    });

    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&session_id) {
        headers.insert(SESSION_HEADER, value);
    }

    Ok((headers, Sse::new(events).keep_alive(KeepAlive::default())).into_response())
}
