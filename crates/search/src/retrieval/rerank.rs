//! Cross-encoder reranking client
//!
//! The reranker is an external HTTP service: `POST {query, texts}` returns
//! `[{index, score}]`. Callers treat any failure as "keep fusion order".

use async_trait::async_trait;
use lexforge_common::config::RerankConfig;
use lexforge_common::errors::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Score for the candidate at `index` of the submitted texts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RerankScore {
    pub index: usize,
    pub score: f32,
}

/// Reorders candidate passages for a query
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, texts: &[String]) -> Result<Vec<RerankScore>>;
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    texts: &'a [String],
}

/// Reranker backed by an HTTP cross-encoder service
pub struct HttpReranker {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpReranker {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn from_config(config: &RerankConfig) -> Result<Self> {
        let endpoint = config.endpoint.clone().ok_or_else(|| AppError::Configuration {
            message: "retrieval.rerank.endpoint is required when rerank is enabled".to_string(),
        })?;
        Self::new(endpoint, Duration::from_millis(config.timeout_ms))
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn rerank(&self, query: &str, texts: &[String]) -> Result<Vec<RerankScore>> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&RerankRequest { query, texts })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Rerank {
                message: format!("Reranker returned {}: {}", status, body),
            });
        }

        let scores: Vec<RerankScore> = response.json().await.map_err(|e| AppError::Rerank {
            message: format!("Failed to parse rerank response: {}", e),
        })?;

        if let Some(bad) = scores.iter().find(|s| s.index >= texts.len()) {
            return Err(AppError::Rerank {
                message: format!("Rerank index {} out of range for {} texts", bad.index, texts.len()),
            });
        }

        Ok(scores)
    }
}
