//! Score fusion for combining dense and keyword results
//!
//! Two strategies:
//! - Weighted: linear blend of clamped cosine similarity and keyword overlap
//! - Reciprocal Rank Fusion (RRF): rank-based, needs no score normalization

use super::{RetrievalMode, RetrievedDocument};
use lexforge_common::text;
use std::collections::{HashMap, HashSet};

/// A candidate after fusion, with the signals that produced its score
#[derive(Debug, Clone)]
pub struct FusedDocument {
    pub document: RetrievedDocument,
    /// Clamped cosine similarity, 0 when the dense leg did not return it
    pub vector_similarity: f32,
    /// Fraction of query keywords present in the text
    pub keyword_overlap: f32,
    pub dense_rank: Option<usize>,
    pub keyword_rank: Option<usize>,
}

/// Fraction of `keywords` that occur in `document_text`
pub fn keyword_overlap(keywords: &HashSet<String>, document_text: &str) -> f32 {
    if keywords.is_empty() {
        return 0.0;
    }
    let tokens = text::token_set(document_text);
    let present = keywords.iter().filter(|k| tokens.contains(*k)).count();
    present as f32 / keywords.len() as f32
}

/// Normalize caller keywords into a token set
pub(crate) fn keyword_set(keywords: &[String], fallback_text: &str) -> HashSet<String> {
    let joined = if keywords.is_empty() {
        fallback_text.to_string()
    } else {
        keywords.join(" ")
    };
    text::token_set(&joined)
}

struct Candidate {
    document: RetrievedDocument,
    dense_score: Option<f32>,
    dense_rank: Option<usize>,
    keyword_rank: Option<usize>,
}

/// Union both legs by document id, keeping first-seen content
fn merge(dense: Vec<RetrievedDocument>, keyword: Vec<RetrievedDocument>) -> Vec<Candidate> {
    let mut order: Vec<String> = Vec::with_capacity(dense.len() + keyword.len());
    let mut by_id: HashMap<String, Candidate> = HashMap::new();

    for (rank, document) in dense.into_iter().enumerate() {
        if by_id.contains_key(&document.id) {
            continue;
        }
        order.push(document.id.clone());
        by_id.insert(
            document.id.clone(),
            Candidate {
                dense_score: Some(document.score),
                dense_rank: Some(rank + 1),
                keyword_rank: None,
                document,
            },
        );
    }

    for (rank, document) in keyword.into_iter().enumerate() {
        match by_id.get_mut(&document.id) {
            Some(candidate) => {
                if candidate.keyword_rank.is_none() {
                    candidate.keyword_rank = Some(rank + 1);
                    candidate.document.retrieval_mode = RetrievalMode::Hybrid;
                }
            }
            None => {
                order.push(document.id.clone());
                by_id.insert(
                    document.id.clone(),
                    Candidate {
                        dense_score: None,
                        dense_rank: None,
                        keyword_rank: Some(rank + 1),
                        document,
                    },
                );
            }
        }
    }

    order
        .into_iter()
        .filter_map(|id| by_id.remove(&id))
        .collect()
}

fn sort_fused(results: &mut [FusedDocument]) {
    results.sort_by(|a, b| RetrievedDocument::ranking_order(&a.document, &b.document));
}

/// Linear blend of vector similarity and keyword overlap
#[derive(Debug, Clone)]
pub struct WeightedFusion {
    pub vector_weight: f32,
    pub keyword_weight: f32,
}

impl Default for WeightedFusion {
    fn default() -> Self {
        Self {
            vector_weight: 0.6,
            keyword_weight: 0.4,
        }
    }
}

impl WeightedFusion {
    pub fn new(vector_weight: f32, keyword_weight: f32) -> Self {
        Self {
            vector_weight,
            keyword_weight,
        }
    }

    /// Fuse both legs. Every candidate's overlap is computed from its own text.
    pub fn fuse(
        &self,
        dense: Vec<RetrievedDocument>,
        keyword: Vec<RetrievedDocument>,
        keywords: &HashSet<String>,
    ) -> Vec<FusedDocument> {
        let mut results: Vec<FusedDocument> = merge(dense, keyword)
            .into_iter()
            .map(|candidate| {
                let vector_similarity = candidate.dense_score.unwrap_or(0.0).clamp(0.0, 1.0);
                let overlap = keyword_overlap(keywords, &candidate.document.text);

                let mut document = candidate.document;
                document.score =
                    self.vector_weight * vector_similarity + self.keyword_weight * overlap;

                FusedDocument {
                    document,
                    vector_similarity,
                    keyword_overlap: overlap,
                    dense_rank: candidate.dense_rank,
                    keyword_rank: candidate.keyword_rank,
                }
            })
            .collect();

        sort_fused(&mut results);
        results
    }
}

/// RRF fusion parameters
#[derive(Debug, Clone)]
pub struct RRFusion {
    /// Constant k (typically 60)
    pub k: f32,

    /// Weight for dense results
    pub vector_weight: f32,

    /// Weight for keyword results
    pub keyword_weight: f32,
}

impl Default for RRFusion {
    fn default() -> Self {
        Self {
            k: 60.0,
            vector_weight: 0.6,
            keyword_weight: 0.4,
        }
    }
}

impl RRFusion {
    /// Create with custom weights
    pub fn with_weights(k: f32, vector_weight: f32, keyword_weight: f32) -> Self {
        Self {
            k,
            vector_weight,
            keyword_weight,
        }
    }

    /// Fuse dense and keyword results using RRF; scores are normalized to the best
    pub fn fuse(
        &self,
        dense: Vec<RetrievedDocument>,
        keyword: Vec<RetrievedDocument>,
        keywords: &HashSet<String>,
    ) -> Vec<FusedDocument> {
        let mut results: Vec<FusedDocument> = merge(dense, keyword)
            .into_iter()
            .map(|candidate| {
                let dense_rrf = candidate
                    .dense_rank
                    .map(|r| self.vector_weight / (self.k + r as f32))
                    .unwrap_or(0.0);
                let keyword_rrf = candidate
                    .keyword_rank
                    .map(|r| self.keyword_weight / (self.k + r as f32))
                    .unwrap_or(0.0);

                let overlap = keyword_overlap(keywords, &candidate.document.text);
                let mut document = candidate.document;
                document.score = dense_rrf + keyword_rrf;

                FusedDocument {
                    document,
                    vector_similarity: candidate.dense_score.unwrap_or(0.0).clamp(0.0, 1.0),
                    keyword_overlap: overlap,
                    dense_rank: candidate.dense_rank,
                    keyword_rank: candidate.keyword_rank,
                }
            })
            .collect();

        sort_fused(&mut results);

        // Normalize scores to 0-1 range
        if let Some(max_score) = results.first().map(|r| r.document.score) {
            if max_score > 0.0 {
                for result in &mut results {
                    result.document.score /= max_score;
                }
            }
        }

        results
    }
}
