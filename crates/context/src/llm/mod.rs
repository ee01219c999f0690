//! Generation providers
//!
//! Provides:
//! - The [`GenerationProvider`] trait (complete + streaming complete)
//! - OpenAI-compatible chat and Ollama chat clients
//! - Per-provider circuit breaking
//! - An ordered fallback [`ProviderChain`]

mod chain;
mod circuit;
mod ollama;
mod openai;

pub use chain::{Completion, ProviderChain};
pub use circuit::{CircuitBreaker, CircuitState};
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;

use async_trait::async_trait;
use lexforge_common::config::{ProviderConfig, ProviderKind};
use lexforge_common::errors::{AppError, Result};
use reqwest::StatusCode;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One generation call
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: usize,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            temperature: 0.2,
            max_tokens: 1024,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// An external generative model service
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Name used in logs and metrics
    fn name(&self) -> &str;

    /// Generate a complete answer
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;

    /// Generate, sending chunks to `tx` as they arrive; returns the full text.
    ///
    /// The default sends the whole completion as one chunk.
    async fn complete_stream(
        &self,
        request: &CompletionRequest,
        tx: mpsc::Sender<String>,
    ) -> Result<String> {
        let text = self.complete(request).await?;
        // A closed receiver only means nobody is listening
        let _ = tx.send(text.clone()).await;
        Ok(text)
    }
}

/// Build a provider client from configuration
pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn GenerationProvider>> {
    match config.kind {
        ProviderKind::Openai => Ok(Arc::new(OpenAiProvider::new(config)?)),
        ProviderKind::Ollama => Ok(Arc::new(OllamaProvider::new(config)?)),
    }
}

/// Map a non-success HTTP status to a provider error
pub(crate) fn status_error(provider: &str, status: StatusCode, body: String) -> AppError {
    AppError::Generation {
        provider: provider.to_string(),
        message: format!("API error {}: {}", status, body),
        retryable: status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error(),
    }
}

/// Splits a byte stream into complete lines across chunk boundaries
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Feed bytes; returns every line completed by them, without terminators
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    /// Whatever is left once the stream ends
    pub(crate) fn finish(&mut self) -> Option<String> {
        let rest = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        (!rest.is_empty()).then_some(rest)
    }
}
