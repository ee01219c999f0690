//! Hybrid retrieval
//!
//! Combines two legs against a [`DocumentIndex`](crate::index::DocumentIndex):
//! - Dense search (semantic similarity via embeddings)
//! - Keyword/metadata search (lexical matching)
//!
//! and post-processes the union with fusion, near-duplicate suppression
//! and an optional cross-encoder rerank.

mod dedup;
mod fusion;
mod hybrid;
mod rerank;

pub use dedup::suppress_near_duplicates;
pub use fusion::{keyword_overlap, FusedDocument, RRFusion, WeightedFusion};
pub use hybrid::HybridRetriever;
pub use rerank::{HttpReranker, RerankScore, Reranker};

use chrono::{DateTime, Utc};
use lexforge_common::errors::AppError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Which leg produced a document
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    /// Dense vector similarity
    Dense,
    /// Keyword/metadata match
    Keyword,
    /// Present in both legs, or fused
    #[default]
    Hybrid,
}

/// Document metadata used for filtering and tie-breaking
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Statute or code, e.g. "IPC"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub act: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,

    /// Legal domain, e.g. "criminal"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    /// Higher wins ties
    #[serde(default)]
    pub priority: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,

    /// Anything else carried by the index
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A passage returned by retrieval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub id: String,
    pub text: String,
    /// Relevance score, higher is better
    pub score: f32,
    /// Corpus the passage came from
    pub source: String,
    #[serde(default)]
    pub metadata: DocumentMetadata,
    #[serde(default)]
    pub retrieval_mode: RetrievalMode,
}

impl RetrievedDocument {
    /// Order by score descending, then priority, recency and id
    pub fn ranking_order(a: &Self, b: &Self) -> Ordering {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| tie_break(a, b))
    }
}

/// Priority desc, then `published_at` desc (undated last), then id asc
pub(crate) fn tie_break(a: &RetrievedDocument, b: &RetrievedDocument) -> Ordering {
    b.metadata
        .priority
        .cmp(&a.metadata.priority)
        .then_with(|| match (a.metadata.published_at, b.metadata.published_at) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.id.cmp(&b.id))
}

/// Filters pushed down to the index
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Hard filter: documents tagged with another domain are excluded
    pub domain: Option<String>,
    /// Soft filter: matching sections count as keyword hits
    pub sections: Vec<String>,
}

impl SearchFilters {
    /// Whether a document passes the hard filters
    pub fn admits(&self, metadata: &DocumentMetadata) -> bool {
        match (&self.domain, &metadata.domain) {
            (Some(wanted), Some(actual)) => wanted.eq_ignore_ascii_case(actual),
            _ => true,
        }
    }

    /// Whether the document's section was asked for
    pub fn section_matches(&self, metadata: &DocumentMetadata) -> bool {
        metadata.section.as_ref().is_some_and(|section| {
            self.sections
                .iter()
                .any(|wanted| wanted.eq_ignore_ascii_case(section))
        })
    }
}

/// One retrieval call
#[derive(Debug, Clone, Default)]
pub struct RetrievalRequest {
    /// Query text as asked
    pub text: String,
    /// Keywords used for overlap scoring; query tokens when empty
    pub keywords: Vec<String>,
    pub filters: SearchFilters,
    /// Maximum documents to return
    pub k: usize,
}

/// How much of the index answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStatus {
    /// Both legs answered
    Complete,
    /// Exactly one leg failed
    Partial,
    /// Both legs failed; no documents
    Unavailable,
}

impl RetrievalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalStatus::Complete => "complete",
            RetrievalStatus::Partial => "partial",
            RetrievalStatus::Unavailable => "unavailable",
        }
    }

    pub fn is_degraded(&self) -> bool {
        !matches!(self, RetrievalStatus::Complete)
    }
}

/// Result of a retrieval call. Failures are reported here, not as errors.
#[derive(Debug, Clone)]
pub struct RetrievalOutcome {
    /// Descending score, at most `k`
    pub documents: Vec<RetrievedDocument>,
    pub status: RetrievalStatus,
    /// Why each failed leg failed
    pub failures: Vec<String>,
    pub duplicates_dropped: usize,
    pub reranked: bool,
    pub elapsed_ms: u64,
}

impl RetrievalOutcome {
    pub fn unavailable(failures: Vec<String>, elapsed_ms: u64) -> Self {
        Self {
            documents: Vec::new(),
            status: RetrievalStatus::Unavailable,
            failures,
            duplicates_dropped: 0,
            reranked: false,
            elapsed_ms,
        }
    }

    /// The failure behind an unavailable outcome
    pub fn error(&self) -> Option<AppError> {
        (self.status == RetrievalStatus::Unavailable).then(|| AppError::RetrievalUnavailable {
            message: self.failures.join("; "),
        })
    }
}

#[cfg(test)]
pub(crate) fn doc(id: &str, text: &str, score: f32) -> RetrievedDocument {
    RetrievedDocument {
        id: id.to_string(),
        text: text.to_string(),
        score,
        source: "test".to_string(),
        metadata: DocumentMetadata::default(),
        retrieval_mode: RetrievalMode::Hybrid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_ranking_order_tie_breaks() {
        let mut low_priority = doc("a", "x", 0.5);
        let mut high_priority = doc("b", "x", 0.5);
        high_priority.metadata.priority = 2;
        low_priority.metadata.priority = 1;

        let mut docs = vec![low_priority.clone(), high_priority.clone()];
        docs.sort_by(RetrievedDocument::ranking_order);
        assert_eq!(docs[0].id, "b");

        let mut old = doc("c", "x", 0.5);
        old.metadata.published_at = Some(Utc.with_ymd_and_hms(1999, 1, 1, 0, 0, 0).unwrap());
        let mut new = doc("d", "x", 0.5);
        new.metadata.published_at = Some(Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap());
        let undated = doc("a0", "x", 0.5);

        let mut docs = vec![undated, old, new];
        docs.sort_by(RetrievedDocument::ranking_order);
        let ids: Vec<_> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["d", "c", "a0"]);
    }

    #[test]
    fn test_filters() {
        let filters = SearchFilters {
            domain: Some("criminal".into()),
            sections: vec!["302".into()],
        };
        let mut metadata = DocumentMetadata {
            domain: Some("Criminal".into()),
            section: Some("302".into()),
            ..Default::default()
        };
        assert!(filters.admits(&metadata));
        assert!(filters.section_matches(&metadata));

        metadata.domain = Some("corporate".into());
        assert!(!filters.admits(&metadata));

        // Untagged documents pass
        assert!(filters.admits(&DocumentMetadata::default()));
    }

    #[test]
    fn test_unavailable_outcome_reports_error() {
        let outcome = RetrievalOutcome::unavailable(
            vec!["dense: store down".into(), "keyword: index down".into()],
            12,
        );
        let err = outcome.error().unwrap();
        assert!(matches!(err, AppError::RetrievalUnavailable { .. }));
        assert_eq!(err.code(), lexforge_common::errors::ErrorCode::RetrievalUnavailable);
        assert!(err.to_string().contains("dense: store down; keyword: index down"));

        let complete = RetrievalOutcome {
            status: RetrievalStatus::Complete,
            ..outcome
        };
        assert!(complete.error().is_none());
    }

    #[test]
    fn test_metadata_roundtrips_extra_fields() {
        let json = r#"{"act":"IPC","section":"302","court":"SC"}"#;
        let metadata: DocumentMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(metadata.act.as_deref(), Some("IPC"));
        assert_eq!(metadata.extra["court"], "SC");
    }
}
