//! Hybrid retrieval combining dense and keyword search
//!
//! Both legs run concurrently, each under its own timeout. A failed leg
//! degrades the outcome instead of failing the call.

use super::{
    dedup::suppress_near_duplicates,
    fusion::{keyword_set, FusedDocument, RRFusion, WeightedFusion},
    rerank::{HttpReranker, Reranker},
    RetrievalOutcome, RetrievalRequest, RetrievalStatus, RetrievedDocument,
};
use crate::index::DocumentIndex;
use lexforge_common::config::{FusionStrategy, RetrievalConfig};
use lexforge_common::embeddings::Embedder;
use lexforge_common::errors::{AppError, Result};
use lexforge_common::metrics;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

enum Fusion {
    Weighted(WeightedFusion),
    Rrf(RRFusion),
}

impl Fusion {
    fn fuse(
        &self,
        dense: Vec<RetrievedDocument>,
        keyword: Vec<RetrievedDocument>,
        keywords: &HashSet<String>,
    ) -> Vec<FusedDocument> {
        match self {
            Fusion::Weighted(fusion) => fusion.fuse(dense, keyword, keywords),
            Fusion::Rrf(fusion) => fusion.fuse(dense, keyword, keywords),
        }
    }
}

/// Hybrid retriever over a [`DocumentIndex`]
pub struct HybridRetriever {
    index: Arc<dyn DocumentIndex>,
    embedder: Arc<dyn Embedder>,
    reranker: Option<Arc<dyn Reranker>>,
    fusion: Fusion,
    config: RetrievalConfig,
}

async fn timed<T, F>(operation: &str, timeout: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(AppError::timeout(operation, timeout)),
    }
}

impl HybridRetriever {
    /// Create a retriever; a reranker is attached when enabled in `config`
    pub fn new(
        index: Arc<dyn DocumentIndex>,
        embedder: Arc<dyn Embedder>,
        config: RetrievalConfig,
    ) -> Result<Self> {
        let reranker: Option<Arc<dyn Reranker>> = if config.rerank.enabled {
            Some(Arc::new(HttpReranker::from_config(&config.rerank)?))
        } else {
            None
        };

        let fusion = match config.fusion {
            FusionStrategy::Weighted => {
                Fusion::Weighted(WeightedFusion::new(config.vector_weight, config.keyword_weight))
            }
            FusionStrategy::Rrf => Fusion::Rrf(RRFusion::with_weights(
                config.rrf_k,
                config.vector_weight,
                config.keyword_weight,
            )),
        };

        Ok(Self {
            index,
            embedder,
            reranker,
            fusion,
            config,
        })
    }

    /// Replace the reranker
    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    /// Check the index is reachable
    pub async fn ping(&self) -> Result<()> {
        timed("index ping", self.config.index_timeout(), self.index.ping()).await
    }

    async fn dense_leg(&self, request: &RetrievalRequest, limit: usize) -> Result<Vec<RetrievedDocument>> {
        let timeout = self.config.index_timeout();
        let embedding = timed("embedding", timeout, self.embedder.embed(&request.text)).await?;
        timed(
            "dense search",
            timeout,
            self.index.search(&embedding, &request.filters, limit),
        )
        .await
    }

    async fn keyword_leg(&self, request: &RetrievalRequest, limit: usize) -> Result<Vec<RetrievedDocument>> {
        let text = if request.keywords.is_empty() {
            request.text.clone()
        } else {
            request.keywords.join(" ")
        };
        timed(
            "keyword search",
            self.config.index_timeout(),
            self.index.keyword_search(&text, &request.filters, limit),
        )
        .await
    }

    /// Reorder the head of `documents` by cross-encoder score.
    ///
    /// The head's fusion scores are handed back out in the new order, so
    /// scores stay descending and on the fusion scale the threshold uses.
    /// Returns false (and leaves the order alone) on any failure.
    async fn rerank(&self, query: &str, documents: &mut Vec<RetrievedDocument>) -> bool {
        let Some(reranker) = self.reranker.as_ref() else {
            return false;
        };

        let head_len = self.config.rerank.top_n.min(documents.len());
        if head_len < 2 {
            return false;
        }

        let texts: Vec<String> = documents[..head_len].iter().map(|d| d.text.clone()).collect();
        let timeout = Duration::from_millis(self.config.rerank.timeout_ms);

        let mut scores = match timed("rerank", timeout, reranker.rerank(query, &texts)).await {
            Ok(scores) => scores,
            Err(e) => {
                warn!(error = %e, "Rerank failed, keeping fusion order");
                return false;
            }
        };

        scores.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.index.cmp(&b.index))
        });

        let mut slots: Vec<f32> = documents[..head_len].iter().map(|d| d.score).collect();
        slots.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

        let mut head: Vec<Option<RetrievedDocument>> = documents.drain(..head_len).map(Some).collect();
        let mut reordered = Vec::with_capacity(head.len() + documents.len());
        for score in &scores {
            if let Some(document) = head.get_mut(score.index).and_then(Option::take) {
                reordered.push(document);
            }
        }
        // Candidates the reranker skipped keep their fusion order
        reordered.extend(head.into_iter().flatten());
        for (document, slot) in reordered.iter_mut().zip(slots) {
            document.score = slot;
        }
        reordered.append(documents);
        reordered.sort_by(RetrievedDocument::ranking_order);
        *documents = reordered;
        true
    }

    /// Retrieve up to `request.k` documents in descending score order
    #[instrument(skip(self, request), fields(k = request.k))]
    pub async fn retrieve(&self, request: &RetrievalRequest) -> RetrievalOutcome {
        let started = Instant::now();
        let k = request.k.max(1);
        let dense_limit = self.config.dense_top_k.max(k);
        let keyword_limit = self.config.keyword_top_k.max(k);

        // Execute both legs in parallel
        let (dense, keyword) = tokio::join!(
            self.dense_leg(request, dense_limit),
            self.keyword_leg(request, keyword_limit)
        );

        let mut failures = Vec::new();
        let dense = dense.unwrap_or_else(|e| {
            warn!(index = self.index.name(), error = %e, "Dense leg failed");
            failures.push(format!("dense: {}", e));
            Vec::new()
        });
        let keyword = keyword.unwrap_or_else(|e| {
            warn!(index = self.index.name(), error = %e, "Keyword leg failed");
            failures.push(format!("keyword: {}", e));
            Vec::new()
        });

        let status = match failures.len() {
            0 => RetrievalStatus::Complete,
            1 => RetrievalStatus::Partial,
            _ => RetrievalStatus::Unavailable,
        };

        if status == RetrievalStatus::Unavailable {
            let elapsed = started.elapsed();
            metrics::record_retrieval(elapsed.as_secs_f64(), status.as_str(), 0);
            return RetrievalOutcome::unavailable(failures, elapsed.as_millis() as u64);
        }

        let keywords = keyword_set(&request.keywords, &request.text);
        let fused: Vec<RetrievedDocument> = self
            .fusion
            .fuse(dense, keyword, &keywords)
            .into_iter()
            .map(|f| f.document)
            .collect();
        let candidates = fused.len();

        let (mut documents, duplicates_dropped) =
            suppress_near_duplicates(fused, self.config.dedup_threshold);

        documents.retain(|d| d.score >= self.config.min_score);
        let reranked = self.rerank(&request.text, &mut documents).await;
        documents.truncate(k);

        let elapsed = started.elapsed();
        metrics::record_retrieval(elapsed.as_secs_f64(), status.as_str(), documents.len());
        debug!(
            candidates,
            duplicates_dropped,
            reranked,
            returned = documents.len(),
            status = status.as_str(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Hybrid retrieval completed"
        );

        RetrievalOutcome {
            documents,
            status,
            failures,
            duplicates_dropped,
            reranked,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{InMemoryIndex, SeedDocument};
    use crate::retrieval::{DocumentMetadata, RerankScore, SearchFilters};
    use async_trait::async_trait;
    use lexforge_common::embeddings::HashingEmbedder;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Index wrapper whose legs can be switched off
    struct FlakyIndex {
        inner: InMemoryIndex,
        dense_down: AtomicBool,
        keyword_down: AtomicBool,
        stall: AtomicBool,
    }

    #[async_trait]
    impl DocumentIndex for FlakyIndex {
        async fn search(
            &self,
            embedding: &[f32],
            filters: &SearchFilters,
            k: usize,
        ) -> Result<Vec<RetrievedDocument>> {
            if self.stall.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            if self.dense_down.load(Ordering::SeqCst) {
                return Err(AppError::ServiceUnavailable { message: "vector store down".into() });
            }
            self.inner.search(embedding, filters, k).await
        }

        async fn keyword_search(
            &self,
            text: &str,
            filters: &SearchFilters,
            k: usize,
        ) -> Result<Vec<RetrievedDocument>> {
            if self.keyword_down.load(Ordering::SeqCst) {
                return Err(AppError::ServiceUnavailable { message: "text index down".into() });
            }
            self.inner.keyword_search(text, filters, k).await
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    struct ReversingReranker;

    #[async_trait]
    impl Reranker for ReversingReranker {
        async fn rerank(&self, _query: &str, texts: &[String]) -> Result<Vec<RerankScore>> {
            Ok((0..texts.len())
                .map(|index| RerankScore { index, score: index as f32 })
                .collect())
        }
    }

    struct BrokenReranker;

    #[async_trait]
    impl Reranker for BrokenReranker {
        async fn rerank(&self, _query: &str, _texts: &[String]) -> Result<Vec<RerankScore>> {
            Err(AppError::Rerank { message: "cross-encoder offline".into() })
        }
    }

    fn seed(id: &str, text: &str, section: &str) -> SeedDocument {
        SeedDocument {
            id: id.to_string(),
            text: text.to_string(),
            source: "ipc".to_string(),
            metadata: DocumentMetadata {
                act: Some("IPC".into()),
                section: Some(section.into()),
                ..Default::default()
            },
        }
    }

    async fn fixture() -> (Arc<FlakyIndex>, Arc<dyn Embedder>) {
        let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(256));
        let inner = InMemoryIndex::new(embedder.clone());
        inner
            .insert_all(vec![
                seed("ipc-302", "Section 302 IPC: whoever commits murder shall be punished with death or imprisonment for life", "302"),
                seed("ipc-302-dup", "Section 302 IPC: whoever commits murder shall be punished with death or imprisonment for life.", "302"),
                seed("ipc-300", "Section 300 IPC defines murder as culpable homicide with intention of causing death", "300"),
                seed("ipc-379", "Section 379 IPC punishment for theft imprisonment up to three years", "379"),
            ])
            .await
            .unwrap();

        let index = Arc::new(FlakyIndex {
            inner,
            dense_down: AtomicBool::new(false),
            keyword_down: AtomicBool::new(false),
            stall: AtomicBool::new(false),
        });
        (index, embedder)
    }

    fn request(k: usize) -> RetrievalRequest {
        RetrievalRequest {
            text: "What is IPC Section 302 punishment for murder?".into(),
            keywords: vec![],
            filters: SearchFilters::default(),
            k,
        }
    }

    fn config() -> RetrievalConfig {
        RetrievalConfig {
            index_timeout_ms: 200,
            ..RetrievalConfig::default()
        }
    }

    #[tokio::test]
    async fn test_complete_retrieval_is_ranked_and_deduplicated() {
        let (index, embedder) = fixture().await;
        let retriever = HybridRetriever::new(index, embedder, config()).unwrap();

        let outcome = retriever.retrieve(&request(3)).await;
        assert_eq!(outcome.status, RetrievalStatus::Complete);
        assert!(outcome.failures.is_empty());
        assert_eq!(outcome.documents[0].id, "ipc-302");
        assert!(outcome.documents.iter().all(|d| d.id != "ipc-302-dup"));
        assert_eq!(outcome.duplicates_dropped, 1);
        assert!(outcome.documents.len() <= 3);
        assert!(outcome
            .documents
            .windows(2)
            .all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn test_one_failed_leg_is_partial() {
        let (index, embedder) = fixture().await;
        index.dense_down.store(true, Ordering::SeqCst);
        let retriever = HybridRetriever::new(index, embedder, config()).unwrap();

        let outcome = retriever.retrieve(&request(3)).await;
        assert_eq!(outcome.status, RetrievalStatus::Partial);
        assert_eq!(outcome.failures.len(), 1);
        assert!(!outcome.documents.is_empty());
    }

    #[tokio::test]
    async fn test_both_legs_failed_is_unavailable() {
        let (index, embedder) = fixture().await;
        index.dense_down.store(true, Ordering::SeqCst);
        index.keyword_down.store(true, Ordering::SeqCst);
        let retriever = HybridRetriever::new(index, embedder, config()).unwrap();

        let outcome = retriever.retrieve(&request(3)).await;
        assert_eq!(outcome.status, RetrievalStatus::Unavailable);
        assert!(outcome.status.is_degraded());
        assert!(outcome.documents.is_empty());
        assert_eq!(outcome.failures.len(), 2);
    }

    #[tokio::test]
    async fn test_slow_leg_times_out() {
        let (index, embedder) = fixture().await;
        index.stall.store(true, Ordering::SeqCst);
        let retriever = HybridRetriever::new(index, embedder, config()).unwrap();

        let started = Instant::now();
        let outcome = retriever.retrieve(&request(3)).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(outcome.status, RetrievalStatus::Partial);
        assert!(outcome.failures[0].contains("dense search"));
    }

    #[tokio::test]
    async fn test_rerank_reorders_head() {
        let (index, embedder) = fixture().await;
        let retriever = HybridRetriever::new(index.clone(), embedder.clone(), config())
            .unwrap()
            .with_reranker(Arc::new(ReversingReranker));
        let baseline = HybridRetriever::new(index, embedder, config()).unwrap();

        let plain = baseline.retrieve(&request(3)).await;
        let reranked = retriever.retrieve(&request(3)).await;
        assert!(reranked.reranked);

        let plain_ids: Vec<_> = plain.documents.iter().map(|d| d.id.clone()).collect();
        let reranked_ids: Vec<_> = reranked.documents.iter().map(|d| d.id.clone()).collect();
        assert_ne!(plain_ids, reranked_ids);
        assert!(reranked
            .documents
            .windows(2)
            .all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn test_rerank_keeps_scores_above_threshold() {
        let (index, embedder) = fixture().await;
        let config = RetrievalConfig {
            min_score: 0.4,
            ..config()
        };
        let retriever = HybridRetriever::new(index, embedder, config)
            .unwrap()
            .with_reranker(Arc::new(ReversingReranker));

        let outcome = retriever.retrieve(&request(5)).await;
        assert!(outcome.documents.iter().all(|d| d.score >= 0.4));
        assert!(outcome
            .documents
            .windows(2)
            .all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn test_rerank_failure_keeps_fusion_order() {
        let (index, embedder) = fixture().await;
        let retriever = HybridRetriever::new(index.clone(), embedder.clone(), config())
            .unwrap()
            .with_reranker(Arc::new(BrokenReranker));
        let baseline = HybridRetriever::new(index, embedder, config()).unwrap();

        let plain = baseline.retrieve(&request(3)).await;
        let outcome = retriever.retrieve(&request(3)).await;
        assert!(!outcome.reranked);
        assert_eq!(outcome.status, RetrievalStatus::Complete);
        assert_eq!(outcome.documents, plain.documents);
    }

    #[tokio::test]
    async fn test_rrf_strategy() {
        let (index, embedder) = fixture().await;
        let config = RetrievalConfig {
            fusion: FusionStrategy::Rrf,
            ..config()
        };
        let retriever = HybridRetriever::new(index, embedder, config).unwrap();
        let outcome = retriever.retrieve(&request(2)).await;
        assert_eq!(outcome.documents.len(), 2);
        assert_eq!(outcome.documents[0].score, 1.0);
    }
}
