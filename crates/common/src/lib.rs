//! LexForge Common Library
//!
//! Shared code for the LexForge engine crates including:
//! - Error types and handling
//! - Configuration management
//! - Metrics and observability
//! - Single-flight answer cache
//! - Embedding client abstraction
//! - Database connection management
//! - Feedback storage

pub mod cache;
pub mod config;
pub mod db;
pub mod embeddings;
pub mod errors;
pub mod feedback;
pub mod metrics;
pub mod text;

// Re-export commonly used types
pub use cache::{CacheStatus, Cacheable, SingleFlightCache};
pub use config::AppConfig;
pub use embeddings::Embedder;
pub use errors::{AppError, Result};
pub use feedback::{FeedbackRecord, FeedbackStore};
pub use metrics::{MetricsAggregator, QueryMetrics};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
