//! LexForge Context Library
//!
//! Everything between a question and its answer:
//! - Generation providers behind an ordered fallback chain
//! - Query routing and complexity estimation
//! - Per-session conversational memory
//! - Prompt assembly and post-answer enrichment
//! - The query orchestrator and the engine that owns it

pub mod engine;
pub mod enrichment;
pub mod llm;
pub mod memory;
pub mod orchestrator;
pub mod prompt;
pub mod router;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::EngineContext;
pub use enrichment::{CitationExtractor, Enricher, Supplement, SupplementKind};
pub use llm::{CompletionRequest, GenerationProvider, ProviderChain};
pub use memory::{MemoryAgent, Turn};
pub use orchestrator::{
    AnswerSource, Query, QueryOptions, QueryOrchestrator, QueryResponse, StreamEvent,
};
pub use router::{Complexity, QueryType, Router, RoutingDecision};
