//! Ordered provider fallback
//!
//! Providers are tried in priority order. Transient failures are retried
//! with exponential backoff inside one provider; anything else moves on to
//! the next. A provider whose circuit is open is skipped. When output was
//! already streamed for a failed attempt, the progress sink is restarted so
//! observers discard it.

use super::{create_provider, CircuitBreaker, CircuitState, CompletionRequest, GenerationProvider};
use backoff::ExponentialBackoff;
use lexforge_common::cache::ProgressSink;
use lexforge_common::config::LlmConfig;
use lexforge_common::errors::{AppError, Result};
use lexforge_common::metrics;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Generated text and the provider that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub provider: String,
}

struct ChainEntry {
    provider: Arc<dyn GenerationProvider>,
    circuit: Mutex<CircuitBreaker>,
    timeout: Duration,
    max_retries: u32,
}

/// Generation providers behind one call
pub struct ProviderChain {
    entries: Vec<ChainEntry>,
    retry_initial: Duration,
}

impl ProviderChain {
    /// Build the chain from configuration, ordered by ascending priority
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let mut providers = config.providers.clone();
        providers.sort_by_key(|p| p.priority);

        let mut chain = Self::new();
        for provider in &providers {
            chain.push(
                create_provider(provider)?,
                CircuitBreaker::new(
                    config.circuit.failure_threshold,
                    Duration::from_secs(config.circuit.open_secs),
                ),
                Duration::from_secs(provider.timeout_secs),
                provider.max_retries,
            );
            info!(provider = %provider.name, model = %provider.model, "Generation provider registered");
        }

        if chain.is_empty() {
            return Err(AppError::Configuration {
                message: "at least one generation provider is required".to_string(),
            });
        }
        Ok(chain)
    }

    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            retry_initial: Duration::from_millis(200),
        }
    }

    /// Append a provider after the existing ones
    pub fn push(
        &mut self,
        provider: Arc<dyn GenerationProvider>,
        circuit: CircuitBreaker,
        timeout: Duration,
        max_retries: u32,
    ) {
        self.entries.push(ChainEntry {
            provider,
            circuit: Mutex::new(circuit),
            timeout,
            max_retries,
        });
    }

    /// Initial delay between retries of one provider
    pub fn with_retry_delay(mut self, initial: Duration) -> Self {
        self.retry_initial = initial;
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Circuit state per provider, in chain order
    pub fn circuit_states(&self) -> Vec<(String, CircuitState)> {
        self.entries
            .iter()
            .map(|e| (e.provider.name().to_string(), e.circuit.lock().state()))
            .collect()
    }

    /// Generate without observing partial output
    pub async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        self.generate(request, &ProgressSink::detached()).await
    }

    /// One streamed attempt against one provider
    async fn attempt(
        &self,
        entry: &ChainEntry,
        request: &CompletionRequest,
        sink: &ProgressSink,
        emitted: &AtomicBool,
    ) -> Result<String> {
        let (tx, mut rx) = mpsc::channel::<String>(64);
        let call = entry.provider.complete_stream(request, tx);
        let forward = async {
            while let Some(chunk) = rx.recv().await {
                emitted.store(true, Ordering::Relaxed);
                sink.push(&chunk);
            }
        };

        let bounded = async {
            let (result, _) = tokio::join!(call, forward);
            result
        };

        match tokio::time::timeout(entry.timeout, bounded).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Generation {
                provider: entry.provider.name().to_string(),
                message: format!("timed out after {}ms", entry.timeout.as_millis()),
                retryable: true,
            }),
        }
    }

    /// Retry one provider on transient errors
    async fn run_provider(
        &self,
        entry: &ChainEntry,
        request: &CompletionRequest,
        sink: &ProgressSink,
    ) -> Result<String> {
        let policy = ExponentialBackoff {
            initial_interval: self.retry_initial,
            max_interval: Duration::from_secs(5),
            max_elapsed_time: Some(entry.timeout),
            ..ExponentialBackoff::default()
        };
        let attempts = AtomicU32::new(0);
        let emitted = AtomicBool::new(false);

        backoff::future::retry(policy, || async {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed);
            if emitted.swap(false, Ordering::Relaxed) {
                sink.restart();
            }

            match self.attempt(entry, request, sink, &emitted).await {
                Ok(text) => Ok(text),
                Err(e) if e.is_transient() && attempt < entry.max_retries => {
                    warn!(
                        provider = entry.provider.name(),
                        attempt = attempt + 1,
                        max_retries = entry.max_retries,
                        error = %e,
                        "Generation failed, retrying"
                    );
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await
        .inspect_err(|_| {
            if emitted.load(Ordering::Relaxed) {
                sink.restart();
            }
        })
    }

    /// Generate with fallback, publishing partial output to `sink`
    pub async fn generate(&self, request: &CompletionRequest, sink: &ProgressSink) -> Result<Completion> {
        let mut attempted = 0usize;
        let mut last_error: Option<AppError> = None;

        for entry in &self.entries {
            let name = entry.provider.name();

            if entry.circuit.lock().is_open() {
                debug!(provider = name, "Circuit open, skipping provider");
                last_error = Some(AppError::CircuitBreakerOpen {
                    service: name.to_string(),
                });
                continue;
            }

            attempted += 1;
            let started = Instant::now();
            match self.run_provider(entry, request, sink).await {
                Ok(text) => {
                    entry.circuit.lock().record_success();
                    metrics::record_generation(started.elapsed().as_secs_f64(), name, true);
                    return Ok(Completion {
                        text,
                        provider: name.to_string(),
                    });
                }
                Err(e) => {
                    let state = {
                        let mut circuit = entry.circuit.lock();
                        circuit.record_failure();
                        circuit.state()
                    };
                    metrics::record_generation(started.elapsed().as_secs_f64(), name, false);
                    warn!(provider = name, circuit = state.as_str(), error = %e, "Provider failed, falling back");
                    last_error = Some(e);
                }
            }
        }

        Err(AppError::GenerationExhausted {
            attempts: attempted,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no providers configured".to_string()),
        })
    }
}

impl Default for ProviderChain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedProvider;

    fn chain(providers: Vec<Arc<ScriptedProvider>>, threshold: u32) -> ProviderChain {
        let mut chain = ProviderChain::new().with_retry_delay(Duration::from_millis(1));
        for provider in providers {
            chain.push(
                provider,
                CircuitBreaker::new(threshold, Duration::from_secs(60)),
                Duration::from_secs(2),
                1,
            );
        }
        chain
    }

    #[tokio::test]
    async fn test_first_healthy_provider_answers() {
        let primary = Arc::new(ScriptedProvider::answering("primary", "Section 302 prescribes death or life imprisonment."));
        let backup = Arc::new(ScriptedProvider::answering("backup", "unused"));
        let chain = chain(vec![primary.clone(), backup.clone()], 3);

        let completion = chain.complete(&CompletionRequest::new("q")).await.unwrap();
        assert_eq!(completion.provider, "primary");
        assert_eq!(primary.calls(), 1);
        assert_eq!(backup.calls(), 0);
    }

    #[tokio::test]
    async fn test_falls_back_and_resets_streamed_output() {
        let primary = Arc::new(ScriptedProvider::failing_mid_stream("primary", "Partial wrong"));
        let backup = Arc::new(ScriptedProvider::answering("backup", "Correct answer"));
        let chain = chain(vec![primary.clone(), backup.clone()], 3);

        let sink = ProgressSink::detached();
        let progress = sink.subscribe();
        let completion = chain.generate(&CompletionRequest::new("q"), &sink).await.unwrap();

        assert_eq!(completion.provider, "backup");
        assert_eq!(completion.text, "Correct answer");
        // Retried once within primary, then fell back
        assert_eq!(primary.calls(), 2);
        let seen = progress.borrow().clone();
        assert_eq!(seen.text, "Correct answer");
        assert!(seen.attempt >= 1);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let a = Arc::new(ScriptedProvider::failing("a"));
        let b = Arc::new(ScriptedProvider::failing("b"));
        let chain = chain(vec![a, b], 3);

        match chain.complete(&CompletionRequest::new("q")).await {
            Err(AppError::GenerationExhausted { attempts, last_error }) => {
                assert_eq!(attempts, 2);
                assert!(last_error.contains("'b'"));
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_open_circuit_skips_provider() {
        let flaky = Arc::new(ScriptedProvider::failing("flaky"));
        let backup = Arc::new(ScriptedProvider::answering("backup", "ok"));
        let chain = chain(vec![flaky.clone(), backup], 1);

        chain.complete(&CompletionRequest::new("q")).await.unwrap();
        let calls_after_first = flaky.calls();
        assert_eq!(chain.circuit_states()[0].1, CircuitState::Open);

        chain.complete(&CompletionRequest::new("q")).await.unwrap();
        assert_eq!(flaky.calls(), calls_after_first);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let rejected = Arc::new(ScriptedProvider::rejecting("rejected"));
        let backup = Arc::new(ScriptedProvider::answering("backup", "ok"));
        let chain = chain(vec![rejected.clone(), backup], 3);

        chain.complete(&CompletionRequest::new("q")).await.unwrap();
        assert_eq!(rejected.calls(), 1);
    }

    #[test]
    fn test_from_config_requires_providers() {
        assert!(matches!(
            ProviderChain::from_config(&LlmConfig::default()),
            Err(AppError::Configuration { .. })
        ));
    }
}
