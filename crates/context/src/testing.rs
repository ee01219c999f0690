//! Scripted generation providers for tests

use crate::llm::{CompletionRequest, GenerationProvider};
use async_trait::async_trait;
use lexforge_common::errors::{AppError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

type Responder = Box<dyn Fn(&CompletionRequest) -> String + Send + Sync>;

enum Script {
    Respond(Responder),
    /// Transient failure before any output
    Fail,
    /// Streams the text, then fails transiently
    FailMidStream(String),
    /// Non-retryable failure
    Reject,
}

pub(crate) struct ScriptedProvider {
    name: String,
    script: Script,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    fn scripted(name: &str, script: Script) -> Self {
        Self {
            name: name.to_string(),
            script,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn answering(name: &str, text: &str) -> Self {
        let text = text.to_string();
        Self::responding(name, move |_| text.clone())
    }

    pub(crate) fn responding(
        name: &str,
        respond: impl Fn(&CompletionRequest) -> String + Send + Sync + 'static,
    ) -> Self {
        Self::scripted(name, Script::Respond(Box::new(respond)))
    }

    pub(crate) fn failing(name: &str) -> Self {
        Self::scripted(name, Script::Fail)
    }

    pub(crate) fn failing_mid_stream(name: &str, partial: &str) -> Self {
        Self::scripted(name, Script::FailMidStream(partial.to_string()))
    }

    pub(crate) fn rejecting(name: &str) -> Self {
        Self::scripted(name, Script::Reject)
    }

    /// Sleep before answering
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn error(&self, retryable: bool) -> AppError {
        AppError::Generation {
            provider: self.name.clone(),
            message: "scripted failure".to_string(),
            retryable,
        }
    }

    /// Send text word by word
    async fn stream_words(text: &str, tx: &mpsc::Sender<String>) {
        for (i, word) in text.split(' ').enumerate() {
            let chunk = if i == 0 { word.to_string() } else { format!(" {}", word) };
            let _ = tx.send(chunk).await;
        }
    }
}

#[async_trait]
impl GenerationProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let (tx, _rx) = mpsc::channel(256);
        self.complete_stream(request, tx).await
    }

    async fn complete_stream(
        &self,
        request: &CompletionRequest,
        tx: mpsc::Sender<String>,
    ) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match &self.script {
            Script::Respond(respond) => {
                let text = respond(request);
                Self::stream_words(&text, &tx).await;
                Ok(text)
            }
            Script::Fail => Err(self.error(true)),
            Script::FailMidStream(partial) => {
                Self::stream_words(partial, &tx).await;
                Err(self.error(true))
            }
            Script::Reject => Err(self.error(false)),
        }
    }
}
