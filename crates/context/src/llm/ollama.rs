//! Ollama chat client (NDJSON streaming)

use super::{status_error, CompletionRequest, GenerationProvider, LineBuffer};
use async_trait::async_trait;
use futures::StreamExt;
use lexforge_common::config::ProviderConfig;
use lexforge_common::errors::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Serialize)]
struct OllamaMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: i32,
}

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage<'a>>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Deserialize)]
struct OllamaChunk {
    #[serde(default)]
    message: Option<OllamaChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct OllamaChunkMessage {
    #[serde(default)]
    content: String,
}

/// Client for Ollama's `/api/chat`
pub struct OllamaProvider {
    name: String,
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl OllamaProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            name: config.name.clone(),
            client,
            endpoint: format!("{}/api/chat", config.endpoint.trim_end_matches('/')),
            model: config.model.clone(),
        })
    }

    async fn send(&self, request: &CompletionRequest, stream: bool) -> Result<reqwest::Response> {
        let mut messages = Vec::with_capacity(2);
        if let Some(ref system) = request.system {
            messages.push(OllamaMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(OllamaMessage {
            role: "user",
            content: &request.prompt,
        });

        let body = OllamaChatRequest {
            model: &self.model,
            messages,
            stream,
            options: OllamaOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens as i32,
            },
        };

        let response = self.client.post(&self.endpoint).json(&body).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(&self.name, status, body));
        }
        Ok(response)
    }

    fn chunk_error(&self, message: String) -> AppError {
        AppError::Generation {
            provider: self.name.clone(),
            message,
            retryable: true,
        }
    }

    /// Parse one NDJSON line into (content, done)
    fn parse_line(&self, line: &str) -> Result<Option<(String, bool)>> {
        let chunk: OllamaChunk = match serde_json::from_str(line) {
            Ok(chunk) => chunk,
            Err(_) => return Ok(None),
        };
        if let Some(error) = chunk.error {
            return Err(self.chunk_error(error));
        }
        let content = chunk.message.map(|m| m.content).unwrap_or_default();
        Ok(Some((content, chunk.done)))
    }
}

#[async_trait]
impl GenerationProvider for OllamaProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let response = self.send(request, false).await?;
        let text = response.text().await?;
        match self.parse_line(text.trim())? {
            Some((content, _)) if !content.trim().is_empty() => Ok(content),
            _ => Err(self.chunk_error("Empty response from model".to_string())),
        }
    }

    async fn complete_stream(
        &self,
        request: &CompletionRequest,
        tx: mpsc::Sender<String>,
    ) -> Result<String> {
        let response = self.send(request, true).await?;
        let mut stream = response.bytes_stream();
        let mut lines = LineBuffer::default();
        let mut full = String::new();
        let mut listening = true;

        'read: while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for line in lines.push(&chunk) {
                let Some((token, done)) = self.parse_line(&line)? else {
                    continue;
                };
                if !token.is_empty() {
                    full.push_str(&token);
                    if listening && tx.send(token).await.is_err() {
                        listening = false;
                    }
                }
                if done {
                    break 'read;
                }
            }
        }

        if let Some(rest) = lines.finish() {
            if let Some((token, _)) = self.parse_line(&rest)? {
                full.push_str(&token);
                if listening && !token.is_empty() {
                    let _ = tx.send(token).await;
                }
            }
        }

        if full.trim().is_empty() {
            return Err(self.chunk_error("Empty response from model".to_string()));
        }
        Ok(full)
    }
}
