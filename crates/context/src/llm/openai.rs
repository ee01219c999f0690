//! OpenAI-compatible chat completions client

use super::{status_error, CompletionRequest, GenerationProvider, LineBuffer};
use async_trait::async_trait;
use futures::StreamExt;
use lexforge_common::config::ProviderConfig;
use lexforge_common::errors::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: usize,
    temperature: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatStreamChunk {
    choices: Vec<ChatStreamChoice>,
}

#[derive(Deserialize)]
struct ChatStreamChoice {
    #[serde(default)]
    delta: ChatDelta,
}

#[derive(Deserialize, Default)]
struct ChatDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Client for `/chat/completions` endpoints
pub struct OpenAiProvider {
    name: String,
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            name: config.name.clone(),
            client,
            endpoint: format!("{}/chat/completions", config.endpoint.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }

    fn messages<'a>(request: &'a CompletionRequest) -> Vec<ChatMessage<'a>> {
        let mut messages = Vec::with_capacity(2);
        if let Some(ref system) = request.system {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
        });
        messages
    }

    async fn send(&self, request: &CompletionRequest, stream: bool) -> Result<reqwest::Response> {
        let body = ChatRequest {
            model: &self.model,
            messages: Self::messages(request),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream,
        };

        let mut builder = self.client.post(&self.endpoint).json(&body);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(&self.name, status, body));
        }
        Ok(response)
    }

    fn empty_response(&self) -> AppError {
        AppError::Generation {
            provider: self.name.clone(),
            message: "Empty response from model".to_string(),
            retryable: true,
        }
    }
}

/// Content delta carried by one SSE line, if any
fn parse_sse_line(line: &str) -> Option<SseLine> {
    let data = line.strip_prefix("data:")?.trim();
    if data == "[DONE]" {
        return Some(SseLine::Done);
    }
    let chunk: ChatStreamChunk = serde_json::from_str(data).ok()?;
    let content = chunk
        .choices
        .into_iter()
        .filter_map(|c| c.delta.content)
        .collect::<String>();
    Some(SseLine::Delta(content))
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Delta(String),
    Done,
}

#[async_trait]
impl GenerationProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let response = self.send(request, false).await?;
        let chat: ChatResponse = response.json().await.map_err(|e| AppError::Generation {
            provider: self.name.clone(),
            message: format!("Failed to parse response: {}", e),
            retryable: false,
        })?;

        chat.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| self.empty_response())
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
                match parse_sse_line(&line) {
                    Some(SseLine::Done) => break 'read,
                    Some(SseLine::Delta(delta)) if !delta.is_empty() => {
                        full.push_str(&delta);
                        if listening && tx.send(delta).await.is_err() {
                            listening = false;
                        }
                    }
                    _ => {}
                }
            }
        }

        if let Some(SseLine::Delta(delta)) = lines.finish().as_deref().and_then(parse_sse_line) {
            full.push_str(&delta);
            if listening {
                let _ = tx.send(delta).await;
            }
        }

        debug!(provider = %self.name, chars = full.len(), "Stream finished");
        if full.trim().is_empty() {
            return Err(self.empty_response());
        }
        Ok(full)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lexforge_common::config::ProviderKind;

    #[test]
    fn test_parse_sse_lines() {
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Section"}}]}"#),
            Some(SseLine::Delta("Section".into()))
        );
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#),
            Some(SseLine::Delta(String::new()))
        );
        assert_eq!(parse_sse_line("data: [DONE]"), Some(SseLine::Done));
        assert_eq!(parse_sse_line(": keep-alive"), None);
    }

    #[test]
    fn test_endpoint_and_messages() {
        let provider = OpenAiProvider::new(&ProviderConfig {
            name: "primary".into(),
            kind: ProviderKind::Openai,
            endpoint: "https://api.example.com/v1/".into(),
            api_key: Some("sk-test".into()),
            model: "gpt-4o-mini".into(),
            priority: 0,
            timeout_secs: 5,
            max_retries: 0,
        })
        .unwrap();
        assert_eq!(provider.endpoint, "https://api.example.com/v1/chat/completions");

        let request = CompletionRequest::new("What is bail?").with_system("You are a legal assistant.");
        let messages = OpenAiProvider::messages(&request);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].content, "What is bail?");
    }
}
