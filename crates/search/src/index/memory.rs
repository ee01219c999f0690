//! In-process document index
//!
//! Used in development (no database configured) and in tests. Documents
//! can be loaded from a JSON seed file holding an array of
//! [`SeedDocument`]s; embeddings are computed on insert.

use super::DocumentIndex;
use crate::retrieval::{DocumentMetadata, RetrievalMode, RetrievedDocument, SearchFilters};
use async_trait::async_trait;
use lexforge_common::embeddings::{cosine_similarity, Embedder};
use lexforge_common::errors::{AppError, Result};
use lexforge_common::text;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Document as stored in a seed file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedDocument {
    pub id: String,
    pub text: String,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default)]
    pub metadata: DocumentMetadata,
}

fn default_source() -> String {
    "seed".to_string()
}

struct StoredDocument {
    seed: SeedDocument,
    embedding: Vec<f32>,
    tokens: HashSet<String>,
}

impl StoredDocument {
    fn to_result(&self, score: f32, mode: RetrievalMode) -> RetrievedDocument {
        RetrievedDocument {
            id: self.seed.id.clone(),
            text: self.seed.text.clone(),
            score,
            source: self.seed.source.clone(),
            metadata: self.seed.metadata.clone(),
            retrieval_mode: mode,
        }
    }
}

/// Cosine + term-matching index held in memory
pub struct InMemoryIndex {
    embedder: Arc<dyn Embedder>,
    documents: RwLock<Vec<StoredDocument>>,
}

impl InMemoryIndex {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            documents: RwLock::new(Vec::new()),
        }
    }

    /// Build an index from a JSON seed file
    pub async fn from_seed_file(path: impl AsRef<Path>, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await?;
        let seeds: Vec<SeedDocument> = serde_json::from_str(&raw)?;

        let index = Self::new(embedder);
        index.insert_all(seeds).await?;
        info!(path = %path.display(), documents = index.len(), "Seeded in-memory index");
        Ok(index)
    }

    /// Embed and add documents; a document with an existing id replaces it
    pub async fn insert_all(&self, seeds: Vec<SeedDocument>) -> Result<()> {
        let texts: Vec<String> = seeds.iter().map(|s| s.text.clone()).collect();
        let embeddings = self.embedder.embed_batch(&texts).await?;
        if embeddings.len() != seeds.len() {
            return Err(AppError::EmbeddingError {
                message: format!("expected {} embeddings, got {}", seeds.len(), embeddings.len()),
            });
        }

        let mut documents = self.documents.write();
        for (seed, embedding) in seeds.into_iter().zip(embeddings) {
            let stored = StoredDocument {
                tokens: text::token_set(&seed.text),
                seed,
                embedding,
            };
            match documents.iter_mut().find(|d| d.seed.id == stored.seed.id) {
                Some(existing) => *existing = stored,
                None => documents.push(stored),
            }
        }
        Ok(())
    }

    pub async fn insert(&self, seed: SeedDocument) -> Result<()> {
        self.insert_all(vec![seed]).await
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }
}

fn top_k(mut results: Vec<RetrievedDocument>, k: usize) -> Vec<RetrievedDocument> {
    results.sort_by(RetrievedDocument::ranking_order);
    results.truncate(k);
    results
}

#[async_trait]
impl DocumentIndex for InMemoryIndex {
    async fn search(
        &self,
        embedding: &[f32],
        filters: &SearchFilters,
        k: usize,
    ) -> Result<Vec<RetrievedDocument>> {
        let documents = self.documents.read();
        let results = documents
            .iter()
            .filter(|d| filters.admits(&d.seed.metadata))
            .map(|d| d.to_result(cosine_similarity(embedding, &d.embedding), RetrievalMode::Dense))
            .collect();
        Ok(top_k(results, k))
    }

    async fn keyword_search(
        &self,
        query: &str,
        filters: &SearchFilters,
        k: usize,
    ) -> Result<Vec<RetrievedDocument>> {
        let terms = text::token_set(query);
        if terms.is_empty() && filters.sections.is_empty() {
            return Ok(vec![]);
        }

        let documents = self.documents.read();
        let results = documents
            .iter()
            .filter(|d| filters.admits(&d.seed.metadata))
            .filter_map(|d| {
                let mut matched = terms.iter().filter(|t| d.tokens.contains(*t)).count();
                let mut possible = terms.len();
                if !filters.sections.is_empty() {
                    possible += 1;
                    if filters.section_matches(&d.seed.metadata) {
                        matched += 1;
                    }
                }
                (matched > 0).then(|| {
                    d.to_result(matched as f32 / possible as f32, RetrievalMode::Keyword)
                })
            })
            .collect();
        Ok(top_k(results, k))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lexforge_common::embeddings::HashingEmbedder;

    fn seed(id: &str, text: &str, section: Option<&str>) -> SeedDocument {
        SeedDocument {
            id: id.to_string(),
            text: text.to_string(),
            source: "ipc".to_string(),
            metadata: DocumentMetadata {
                act: Some("IPC".into()),
                section: section.map(str::to_string),
                domain: Some("criminal".into()),
                ..Default::default()
            },
        }
    }

    async fn index() -> InMemoryIndex {
        let index = InMemoryIndex::new(Arc::new(HashingEmbedder::new(256)));
        index
            .insert_all(vec![
                seed("ipc-302", "Section 302 punishment for murder: death or imprisonment for life", Some("302")),
                seed("ipc-304", "Section 304 punishment for culpable homicide not amounting to murder", Some("304")),
                seed("crpc-437", "Bail in non-bailable offences may be granted by the court", None),
            ])
            .await
            .unwrap();
        index
    }

    #[tokio::test]
    async fn test_dense_search_ranks_by_similarity() {
        let index = index().await;
        let embedder = HashingEmbedder::new(256);
        let query = embedder.embed("punishment for murder section 302").await.unwrap();

        let results = index.search(&query, &SearchFilters::default(), 2).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "ipc-302");
        assert_eq!(results[0].retrieval_mode, RetrievalMode::Dense);
    }

    #[tokio::test]
    async fn test_keyword_search_scores_term_overlap() {
        let index = index().await;
        let results = index
            .keyword_search("bail court", &SearchFilters::default(), 5)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "crpc-437");
        assert_eq!(results[0].score, 1.0);
    }

    #[tokio::test]
    async fn test_section_filter_counts_as_match() {
        let index = index().await;
        let filters = SearchFilters {
            domain: None,
            sections: vec!["304".into()],
        };
        let results = index.keyword_search("homicide", &filters, 5).await.unwrap();
        assert_eq!(results[0].id, "ipc-304");
        assert_eq!(results[0].score, 1.0);
    }

    #[tokio::test]
    async fn test_domain_filter_excludes_other_domains() {
        let index = index().await;
        let filters = SearchFilters {
            domain: Some("corporate".into()),
            sections: vec![],
        };
        let results = index.keyword_search("murder", &filters, 5).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_insert_replaces_same_id() {
        let index = index().await;
        index
            .insert(seed("ipc-302", "Section 302 amended text", Some("302")))
            .await
            .unwrap();
        assert_eq!(index.len(), 3);
    }

    #[tokio::test]
    async fn test_seed_file() {
        let path = std::env::temp_dir().join(format!("lexforge-seed-{}.json", std::process::id()));
        tokio::fs::write(
            &path,
            r#"[{"id":"a","text":"Article 21 protection of life and personal liberty","metadata":{"act":"Constitution","section":"21"}}]"#,
        )
        .await
        .unwrap();

        let index = InMemoryIndex::from_seed_file(&path, Arc::new(HashingEmbedder::new(64)))
            .await
            .unwrap();
        assert_eq!(index.len(), 1);

        tokio_test::assert_ok!(tokio::fs::remove_file(&path).await);
    }
}
