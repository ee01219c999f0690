//! Document index backends
//!
//! Both legs of hybrid retrieval go through [`DocumentIndex`]:
//! - [`PgDocumentIndex`]: PostgreSQL with pgvector and full-text ranking
//! - [`InMemoryIndex`]: cosine + term matching over an in-process corpus

mod memory;
mod pg;

pub use memory::{InMemoryIndex, SeedDocument};
pub use pg::PgDocumentIndex;

use crate::retrieval::{RetrievedDocument, SearchFilters};
use async_trait::async_trait;
use lexforge_common::errors::Result;

/// Vector + keyword index consumed by the retriever
#[async_trait]
pub trait DocumentIndex: Send + Sync {
    /// Nearest neighbours of `embedding`; `score` is cosine similarity
    async fn search(
        &self,
        embedding: &[f32],
        filters: &SearchFilters,
        k: usize,
    ) -> Result<Vec<RetrievedDocument>>;

    /// Keyword/metadata matches; `score` is in [0, 1]
    async fn keyword_search(
        &self,
        text: &str,
        filters: &SearchFilters,
        k: usize,
    ) -> Result<Vec<RetrievedDocument>>;

    /// Connectivity check for readiness probes
    async fn ping(&self) -> Result<()>;

    /// Backend name for logs
    fn name(&self) -> &'static str;
}
