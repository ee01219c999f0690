//! Query Orchestrator - Coordinates routing, caching, retrieval and generation
//!
//! A query moves through `Routing -> CacheCheck`, then either resolves from
//! the cache or runs `Retrieving -> Generating -> CacheWrite` as one shared
//! computation. Every caller then gets its own `Respond` step: enrichment,
//! a memory append and one metrics record.

use crate::enrichment::{Enricher, Supplement};
use crate::llm::{CircuitState, ProviderChain};
use crate::memory::MemoryAgent;
use crate::prompt::{self, PromptSettings};
use crate::router::{Complexity, QueryType, Router, RoutingDecision};
use futures::future::{BoxFuture, FutureExt};
use lexforge_common::cache::{keys, CacheStatus, Cacheable, Pending, Progress, ProgressSink};
use lexforge_common::config::{AppConfig, CacheScope};
use lexforge_common::errors::{AppError, ErrorCode, Result};
use lexforge_common::metrics::{self, QueryObservation};
use lexforge_common::{FeedbackRecord, FeedbackStore, MetricsAggregator, QueryMetrics, SingleFlightCache};
use lexforge_search::{HybridRetriever, RetrievalRequest, RetrievalStatus, RetrievedDocument, SearchFilters};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, instrument, warn, Instrument};

const PARTIAL_NOTE: &str =
    "Some legal sources could not be searched; the answer may be incomplete.";
const UNAVAILABLE_NOTE: &str =
    "Legal sources are temporarily unavailable; this answer is not grounded in retrieved documents.";

/// Per-query options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Documents to retrieve; defaults by complexity
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub stream: bool,
    /// Compute a fresh answer without reading or writing the cache
    #[serde(default)]
    pub skip_cache: bool,
    /// Restrict retrieval to one legal domain
    #[serde(default)]
    pub domain: Option<String>,
}

/// A question asked within a session
#[derive(Debug, Clone)]
pub struct Query {
    pub text: String,
    pub session_id: String,
    pub options: QueryOptions,
}

impl Query {
    pub fn new(text: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            session_id: session_id.into(),
            options: QueryOptions::default(),
        }
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.text.trim().is_empty() {
            return Err(AppError::EmptyQuery);
        }
        if self.session_id.trim().is_empty() {
            return Err(AppError::Validation {
                message: "session_id must not be empty".to_string(),
                field: Some("session_id".to_string()),
            });
        }
        Ok(())
    }
}

/// How a caller's answer was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnswerSource {
    /// Finalized cache entry
    Hit,
    /// Joined another caller's computation
    Coalesced,
    /// This caller ran the computation
    Miss,
    /// Cache not consulted (direct answers, `skip_cache`)
    Bypass,
}

impl AnswerSource {
    pub fn from_cache(&self) -> bool {
        matches!(self, AnswerSource::Hit | AnswerSource::Coalesced)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AnswerSource::Hit => "hit",
            AnswerSource::Coalesced => "coalesced",
            AnswerSource::Miss => "miss",
            AnswerSource::Bypass => "bypass",
        }
    }
}

impl From<CacheStatus> for AnswerSource {
    fn from(status: CacheStatus) -> Self {
        match status {
            CacheStatus::Hit => AnswerSource::Hit,
            CacheStatus::Coalesced => AnswerSource::Coalesced,
            CacheStatus::Miss => AnswerSource::Miss,
        }
    }
}

/// Final structured result of a query
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub answer: String,
    pub documents: Vec<RetrievedDocument>,
    pub from_cache: bool,
    pub cache_status: AnswerSource,
    pub latency_ms: u64,
    pub complexity: Complexity,
    pub query_type: QueryType,
    pub confidence: f32,
    /// Retrieval was partial or unavailable
    pub degraded: bool,
    pub notes: Vec<String>,
    pub supplements: Vec<Supplement>,
    /// Generation provider that produced the answer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

/// Events emitted by [`QueryOrchestrator::query_stream`]
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Started { routing: RoutingDecision },
    Chunk { text: String },
    /// Output so far is void; a new attempt starts
    Reset { attempt: u32 },
    Completed { response: Box<QueryResponse> },
    Failed { code: ErrorCode, message: String },
}

impl StreamEvent {
    /// Event name for server-sent events
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Started { .. } => "started",
            StreamEvent::Chunk { .. } => "chunk",
            StreamEvent::Reset { .. } => "reset",
            StreamEvent::Completed { .. } => "completed",
            StreamEvent::Failed { .. } => "failed",
        }
    }
}

/// Shared result of one answer computation
#[derive(Debug, Clone)]
struct CachedAnswer {
    answer: String,
    documents: Vec<RetrievedDocument>,
    degraded: bool,
    notes: Vec<String>,
    provider: Option<String>,
}

impl CachedAnswer {
    fn direct(answer: &str) -> Self {
        Self {
            answer: answer.to_string(),
            documents: Vec::new(),
            degraded: false,
            notes: Vec::new(),
            provider: None,
        }
    }
}

impl Cacheable for CachedAnswer {
    fn is_cacheable(&self) -> bool {
        !self.degraded
    }
}

/// Inputs of one answer computation
struct AnswerPlan {
    question: String,
    history: String,
    retrieval: Option<RetrievalRequest>,
}

/// Retrieval plus generation, run once per computation
struct AnswerPipeline {
    retriever: Arc<HybridRetriever>,
    chain: Arc<ProviderChain>,
    settings: PromptSettings,
}

impl AnswerPipeline {
    async fn run(&self, plan: AnswerPlan, sink: ProgressSink) -> Result<CachedAnswer> {
        let mut notes = Vec::new();
        let (documents, degraded) = match plan.retrieval {
            Some(ref request) => {
                let outcome = self.retriever.retrieve(request).await;
                match outcome.status {
                    RetrievalStatus::Complete => {}
                    RetrievalStatus::Partial => notes.push(PARTIAL_NOTE.to_string()),
                    RetrievalStatus::Unavailable => notes.push(UNAVAILABLE_NOTE.to_string()),
                }
                if let Some(e) = outcome.error() {
                    warn!(error = %e, "Answering without retrieved sources");
                }
                (outcome.documents, outcome.status.is_degraded())
            }
            None => (Vec::new(), false),
        };

        let request = prompt::answer_request(&plan.question, &plan.history, &documents, self.settings);
        let completion = self.chain.generate(&request, &sink).await?;

        Ok(CachedAnswer {
            answer: completion.text,
            documents,
            degraded,
            notes,
            provider: Some(completion.provider),
        })
    }
}

/// Where a caller's answer will come from
enum Flight {
    Ready(CachedAnswer),
    Cached(Pending<CachedAnswer>),
    Uncached {
        outcome: BoxFuture<'static, Result<CachedAnswer>>,
        progress: watch::Receiver<Progress>,
    },
}

impl Flight {
    fn source(&self) -> AnswerSource {
        match self {
            Flight::Cached(pending) => pending.status().into(),
            Flight::Ready(_) | Flight::Uncached { .. } => AnswerSource::Bypass,
        }
    }

    fn progress(&self) -> Option<watch::Receiver<Progress>> {
        match self {
            Flight::Ready(_) => None,
            Flight::Cached(pending) => pending.progress(),
            Flight::Uncached { progress, .. } => Some(progress.clone()),
        }
    }

    async fn wait(self) -> Result<CachedAnswer> {
        match self {
            Flight::Ready(answer) => Ok(answer),
            Flight::Cached(pending) => Ok(pending.wait().await?.entry.value.clone()),
            Flight::Uncached { outcome, .. } => outcome.await,
        }
    }
}

/// Components the orchestrator coordinates
pub struct OrchestratorParts {
    pub router: Router,
    pub retriever: Arc<HybridRetriever>,
    pub chain: Arc<ProviderChain>,
    pub memory: Arc<MemoryAgent>,
    pub metrics: Arc<MetricsAggregator>,
    pub feedback: Arc<FeedbackStore>,
    pub enrichers: Vec<Arc<dyn Enricher>>,
}

struct Inner {
    router: Router,
    pipeline: Arc<AnswerPipeline>,
    cache: SingleFlightCache<CachedAnswer>,
    memory: Arc<MemoryAgent>,
    metrics: Arc<MetricsAggregator>,
    feedback: Arc<FeedbackStore>,
    enrichers: Vec<Arc<dyn Enricher>>,
    cache_scope: CacheScope,
    max_top_k: usize,
}

/// Entry point for answering questions
#[derive(Clone)]
pub struct QueryOrchestrator {
    inner: Arc<Inner>,
}

impl QueryOrchestrator {
    pub fn new(parts: OrchestratorParts, config: &AppConfig) -> Self {
        let pipeline = AnswerPipeline {
            retriever: parts.retriever,
            chain: parts.chain,
            settings: PromptSettings {
                temperature: config.llm.temperature,
                max_tokens: config.llm.max_tokens,
            },
        };

        Self {
            inner: Arc::new(Inner {
                router: parts.router,
                pipeline: Arc::new(pipeline),
                cache: SingleFlightCache::new(config.cache.max_entries, config.cache.ttl()),
                memory: parts.memory,
                metrics: parts.metrics,
                feedback: parts.feedback,
                enrichers: parts.enrichers,
                cache_scope: config.cache.scope,
                max_top_k: config.retrieval.final_top_k.max(1),
            }),
        }
    }

    /// Answer a question
    #[instrument(skip(self, query), fields(session_id = %query.session_id))]
    pub async fn query(&self, query: Query) -> Result<QueryResponse> {
        query.validate()?;
        let started = Instant::now();

        let decision = self.inner.router.route(&query.text).await;
        let flight = self.begin(&query, &decision).await;
        let source = flight.source();

        match flight.wait().await {
            Ok(answer) => Ok(self.respond(&query, &decision, answer, source, started).await),
            Err(e) => {
                self.inner.metrics.record_failure();
                warn!(error = %e, "Query failed");
                Err(e)
            }
        }
    }

    /// Answer a question, streaming partial output.
    ///
    /// Dropping the stream stops delivery to this caller only; a shared
    /// computation still finishes and is cached for others.
    #[instrument(skip(self, query), fields(session_id = %query.session_id))]
    pub async fn query_stream(&self, query: Query) -> Result<ReceiverStream<StreamEvent>> {
        query.validate()?;

        let (tx, rx) = mpsc::channel(64);
        let this = self.clone();
        tokio::spawn(async move { this.drive_stream(query, tx).await }.in_current_span());
        Ok(ReceiverStream::new(rx))
    }

    async fn drive_stream(&self, query: Query, tx: mpsc::Sender<StreamEvent>) {
        let started = Instant::now();
        let decision = self.inner.router.route(&query.text).await;
        if tx
            .send(StreamEvent::Started { routing: decision.clone() })
            .await
            .is_err()
        {
            return;
        }

        let flight = self.begin(&query, &decision).await;
        let source = flight.source();
        let mut progress = flight.progress();
        let mut emitted = Progress::default();

        let wait = flight.wait();
        tokio::pin!(wait);

        let outcome = loop {
            tokio::select! {
                outcome = &mut wait => break outcome,
                update = next_progress(&mut progress) => match update {
                    Some(now) => {
                        if !forward(&tx, &mut emitted, now).await {
                            debug!("Stream consumer went away");
                            return;
                        }
                    }
                    None => progress = None,
                },
            }
        };

        match outcome {
            Ok(answer) => {
                let tail = Progress {
                    attempt: emitted.attempt,
                    text: answer.answer.clone(),
                };
                if !forward(&tx, &mut emitted, tail).await {
                    return;
                }
                let response = self.respond(&query, &decision, answer, source, started).await;
                let _ = tx
                    .send(StreamEvent::Completed {
                        response: Box::new(response),
                    })
                    .await;
            }
            Err(e) => {
                self.inner.metrics.record_failure();
                warn!(error = %e, "Streaming query failed");
                let _ = tx
                    .send(StreamEvent::Failed {
                        code: e.code(),
                        message: e.to_string(),
                    })
                    .await;
            }
        }
    }

    /// Record user feedback on an answer
    pub async fn submit_feedback(
        &self,
        query: &str,
        answer: &str,
        rating: u8,
        session_id: &str,
        text: Option<String>,
    ) -> Result<FeedbackRecord> {
        let record = FeedbackRecord::new(query, answer, rating, session_id, text)?;
        self.inner.metrics.record_feedback(rating)?;
        self.inner.feedback.append(record.clone()).await;
        info!(rating, session_id = %session_id, "Feedback recorded");
        Ok(record)
    }

    /// Point-in-time metrics snapshot
    pub fn metrics(&self) -> QueryMetrics {
        self.inner.metrics.snapshot()
    }

    pub fn memory(&self) -> &MemoryAgent {
        &self.inner.memory
    }

    /// Finalized answers currently cached
    pub fn cached_answers(&self) -> u64 {
        self.inner.cache.len()
    }

    /// Readiness of the document index
    pub async fn ping(&self) -> Result<()> {
        self.inner.pipeline.retriever.ping().await
    }

    /// Circuit state of each generation provider, in priority order
    pub fn circuit_states(&self) -> Vec<(String, CircuitState)> {
        self.inner.pipeline.chain.circuit_states()
    }

    /// Drop every cached answer
    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }

    async fn begin(&self, query: &Query, decision: &RoutingDecision) -> Flight {
        if !decision.needs_retrieval {
            if let Some(ref answer) = decision.direct_answer {
                return Flight::Ready(CachedAnswer::direct(answer));
            }
        }

        let retrieval = decision
            .needs_retrieval
            .then(|| self.retrieval_request(query, decision));
        // Only follow-ups see the conversation; their key is tied to it
        let history = self.inner.memory.get_context(&query.session_id).await;
        let follows_up = !history.trim().is_empty()
            && (decision.query_type == QueryType::Clarification
                || self.inner.router.refers_back(&query.text));
        let history = if follows_up { history } else { String::new() };

        let key = self.cache_key(
            query,
            decision,
            retrieval.as_ref(),
            follows_up.then_some(history.as_str()),
        );
        let plan = AnswerPlan {
            question: query.text.trim().to_string(),
            history,
            retrieval,
        };
        let pipeline = self.inner.pipeline.clone();

        if query.options.skip_cache {
            let sink = ProgressSink::detached();
            let progress = sink.subscribe();
            return Flight::Uncached {
                outcome: async move { pipeline.run(plan, sink).await }.boxed(),
                progress,
            };
        }

        Flight::Cached(
            self.inner
                .cache
                .begin(&key, move |sink| async move { pipeline.run(plan, sink).await }),
        )
    }

    fn retrieval_request(&self, query: &Query, decision: &RoutingDecision) -> RetrievalRequest {
        let params = decision.retrieval_params.clone();
        let complexity = decision.complexity();
        let k = query
            .options
            .top_k
            .unwrap_or_else(|| complexity.default_k())
            .clamp(1, self.inner.max_top_k);

        let (domain, sections, keywords) = match params {
            Some(p) => (p.domain, p.sections, p.keywords),
            None => (None, Vec::new(), Vec::new()),
        };

        RetrievalRequest {
            text: query.text.trim().to_string(),
            keywords,
            filters: SearchFilters {
                domain: query.options.domain.clone().or(domain),
                sections,
            },
            k,
        }
    }

    /// Normalized question plus routing parameters.
    ///
    /// Answers built on conversation history are always session-scoped and
    /// carry a fingerprint of that history.
    fn cache_key(
        &self,
        query: &Query,
        decision: &RoutingDecision,
        retrieval: Option<&RetrievalRequest>,
        history: Option<&str>,
    ) -> String {
        let mut routing = match retrieval {
            Some(request) => format!(
                "retrieval;k={};domain={};sections={};complexity={}",
                request.k,
                request.filters.domain.as_deref().unwrap_or(""),
                request.filters.sections.join(","),
                decision.complexity().as_str(),
            ),
            None => format!("direct;type={}", decision.query_type.as_str()),
        };
        let scope = match (history, self.inner.cache_scope) {
            (Some(history), _) => {
                routing.push_str(";history=");
                routing.push_str(&keys::fingerprint(&[history]));
                Some(query.session_id.as_str())
            }
            (None, CacheScope::Global) => None,
            (None, CacheScope::Session) => Some(query.session_id.as_str()),
        };
        keys::answer(&keys::normalize_query(&query.text), &routing, scope)
    }

    async fn respond(
        &self,
        query: &Query,
        decision: &RoutingDecision,
        answer: CachedAnswer,
        source: AnswerSource,
        started: Instant,
    ) -> QueryResponse {
        let supplements = self.enrich(query, &answer).await;
        self.inner
            .memory
            .append_turn(&query.session_id, &query.text, &answer.answer)
            .await;

        let latency = started.elapsed();
        let complexity = decision.complexity();
        self.inner.metrics.observe(QueryObservation {
            latency,
            from_cache: source.from_cache(),
            coalesced: source == AnswerSource::Coalesced,
            degraded: answer.degraded,
            complexity: complexity.as_str(),
        });
        if source != AnswerSource::Bypass {
            metrics::record_cache(source.from_cache(), "answers");
        }

        info!(
            cache = source.as_str(),
            query_type = decision.query_type.as_str(),
            complexity = complexity.as_str(),
            documents = answer.documents.len(),
            degraded = answer.degraded,
            latency_ms = latency.as_millis() as u64,
            "Query answered"
        );

        QueryResponse {
            answer: answer.answer,
            documents: answer.documents,
            from_cache: source.from_cache(),
            cache_status: source,
            latency_ms: latency.as_millis() as u64,
            complexity,
            query_type: decision.query_type,
            confidence: decision.confidence,
            degraded: answer.degraded,
            notes: answer.notes,
            supplements,
            provider: answer.provider,
        }
    }

    async fn enrich(&self, query: &Query, answer: &CachedAnswer) -> Vec<Supplement> {
        let mut supplements = Vec::new();
        for enricher in &self.inner.enrichers {
            match enricher
                .enrich(&query.text, &answer.answer, &answer.documents)
                .await
            {
                Ok(found) => supplements.extend(found),
                Err(e) => warn!(enricher = enricher.name(), error = %e, "Enrichment failed"),
            }
        }
        supplements
    }
}

/// Next progress update, or `None` once the computation dropped its sender
async fn next_progress(rx: &mut Option<watch::Receiver<Progress>>) -> Option<Progress> {
    let Some(rx) = rx.as_mut() else {
        return std::future::pending().await;
    };
    match rx.changed().await {
        Ok(()) => Some(rx.borrow_and_update().clone()),
        Err(_) => None,
    }
}

/// Send the difference between what was emitted and `now`. False once the receiver is gone.
async fn forward(tx: &mpsc::Sender<StreamEvent>, emitted: &mut Progress, now: Progress) -> bool {
    let mut events = Vec::with_capacity(2);
    if now.attempt != emitted.attempt || !now.text.starts_with(&emitted.text) {
        events.push(StreamEvent::Reset { attempt: now.attempt });
        emitted.text.clear();
    }
    if now.text.len() > emitted.text.len() {
        events.push(StreamEvent::Chunk {
            text: now.text[emitted.text.len()..].to_string(),
        });
    }
    *emitted = now;

    for event in events {
        if tx.send(event).await.is_err() {
            return false;
        }
    }
    true
}
