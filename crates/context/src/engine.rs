//! Engine context: explicit construction and teardown of every component

use crate::enrichment::{CitationExtractor, Enricher};
use crate::llm::ProviderChain;
use crate::memory::MemoryAgent;
use crate::orchestrator::{OrchestratorParts, QueryOrchestrator};
use crate::router::Router;
use lexforge_common::config::AppConfig;
use lexforge_common::db::DbPool;
use lexforge_common::embeddings::create_embedder;
use lexforge_common::errors::Result;
use lexforge_common::{FeedbackStore, MetricsAggregator};
use lexforge_search::{DocumentIndex, HybridRetriever, InMemoryIndex, PgDocumentIndex};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Owns the running engine
pub struct EngineContext {
    config: AppConfig,
    orchestrator: QueryOrchestrator,
    db: Option<Arc<DbPool>>,
    shutdown_tx: watch::Sender<bool>,
    sweeper: JoinHandle<()>,
}

impl EngineContext {
    /// Build every component from configuration and start background tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn initialize(config: AppConfig) -> Result<Self> {
        config.validate()?;

        let embedder = create_embedder(&config.embedding)?;
        info!(model = embedder.model_name(), dimension = embedder.dimension(), "Embedder ready");

        let (index, db): (Arc<dyn DocumentIndex>, Option<Arc<DbPool>>) = match config.database {
            Some(ref database) => {
                let pool = Arc::new(DbPool::new(database).await?);
                if database.migrate {
                    pool.ensure_documents_table(config.embedding.dimension).await?;
                }
                (Arc::new(PgDocumentIndex::new(pool.clone())), Some(pool))
            }
            None => {
                let index = match config.retrieval.seed_path {
                    Some(ref path) => InMemoryIndex::from_seed_file(path, embedder.clone()).await?,
                    None => {
                        warn!("No database or seed file configured, starting with an empty index");
                        InMemoryIndex::new(embedder.clone())
                    }
                };
                (Arc::new(index), None)
            }
        };
        info!(backend = index.name(), "Document index ready");

        let retriever = Arc::new(HybridRetriever::new(index, embedder, config.retrieval.clone())?);
        let chain = Arc::new(ProviderChain::from_config(&config.llm)?);
        let router = Router::new(config.router.clone(), Some(chain.clone()))?;
        let memory = Arc::new(MemoryAgent::new(&config.memory));

        let feedback = match config.redis {
            Some(ref redis) => match FeedbackStore::connect(redis).await {
                Ok(store) => store,
                Err(e) => {
                    warn!(error = %e, "Redis unavailable, feedback kept in process only");
                    FeedbackStore::in_memory()
                }
            },
            None => FeedbackStore::in_memory(),
        };

        let enrichers: Vec<Arc<dyn Enricher>> = vec![Arc::new(CitationExtractor::new()?)];

        let orchestrator = QueryOrchestrator::new(
            OrchestratorParts {
                router,
                retriever,
                chain,
                memory: memory.clone(),
                metrics: Arc::new(MetricsAggregator::new()),
                feedback: Arc::new(feedback),
                enrichers,
            },
            &config,
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper = tokio::spawn(sweep_idle_sessions(
            memory,
            Duration::from_secs(config.memory.idle_ttl_secs),
            Duration::from_secs(config.memory.sweep_interval_secs.max(1)),
            shutdown_rx,
        ));

        info!(
            providers = config.llm.providers.len(),
            cache_scope = ?config.cache.scope,
            "Engine initialized"
        );

        Ok(Self {
            config,
            orchestrator,
            db,
            shutdown_tx,
            sweeper,
        })
    }

    pub fn orchestrator(&self) -> &QueryOrchestrator {
        &self.orchestrator
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Whether the engine can serve retrieval-backed answers
    pub async fn ready(&self) -> Result<()> {
        self.orchestrator.ping().await
    }

    /// Stop background tasks and release connections
    pub async fn shutdown(self) {
        info!("Engine shutting down");
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.sweeper.await {
            warn!(error = %e, "Session sweeper ended abnormally");
        }

        // The index holds the other pool handle
        drop(self.orchestrator);
        if let Some(db) = self.db {
            match Arc::try_unwrap(db) {
                Ok(pool) => {
                    if let Err(e) = pool.close().await {
                        warn!(error = %e, "Failed to close database pool");
                    }
                }
                Err(_) => warn!("Database pool still shared at shutdown"),
            }
        }
        info!("Engine stopped");
    }
}

async fn sweep_idle_sessions(
    memory: Arc<MemoryAgent>,
    max_idle: Duration,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                memory.evict_idle(max_idle);
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
