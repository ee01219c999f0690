//! LexForge Search Library
//!
//! Hybrid retrieval over legal passages:
//! - Document index backends (Postgres/pgvector, in-memory)
//! - Weighted and reciprocal-rank fusion
//! - Near-duplicate suppression
//! - Optional cross-encoder rerank

pub mod index;
pub mod retrieval;

pub use index::{DocumentIndex, InMemoryIndex, PgDocumentIndex, SeedDocument};
pub use retrieval::{
    DocumentMetadata, HybridRetriever, RetrievalOutcome, RetrievalRequest, RetrievalStatus,
    RetrievedDocument, SearchFilters,
};
