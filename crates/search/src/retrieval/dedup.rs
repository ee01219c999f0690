//! Near-duplicate suppression
//!
//! Legal corpora repeat the same provision across Q&A pairs, commentaries
//! and bare acts. A document is dropped when its 3-token shingles overlap
//! an already-kept, higher-ranked document by more than the threshold.

use super::RetrievedDocument;
use lexforge_common::text;
use std::collections::HashSet;

const SHINGLE_SIZE: usize = 3;

/// Keep documents in order, dropping near-duplicates of earlier ones.
/// Returns the survivors and the number dropped.
pub fn suppress_near_duplicates(
    documents: Vec<RetrievedDocument>,
    threshold: f32,
) -> (Vec<RetrievedDocument>, usize) {
    let mut kept: Vec<RetrievedDocument> = Vec::with_capacity(documents.len());
    let mut kept_shingles: Vec<HashSet<String>> = Vec::with_capacity(documents.len());
    let mut dropped = 0;

    for document in documents {
        let shingles = text::shingles(&document.text, SHINGLE_SIZE);
        let duplicate = kept_shingles
            .iter()
            .any(|existing| text::jaccard(existing, &shingles) > threshold);

        if duplicate {
            tracing::trace!(id = %document.id, "Dropping near-duplicate");
            dropped += 1;
            continue;
        }

        kept_shingles.push(shingles);
        kept.push(document);
    }

    (kept, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::doc;

    #[test]
    fn test_drops_lower_ranked_duplicate() {
        let documents = vec![
            doc("a", "Whoever commits murder shall be punished with death or imprisonment for life", 0.9),
            doc("b", "Whoever commits murder shall be punished with death or imprisonment for life.", 0.8),
            doc("c", "Bail may be granted in bailable offences as a matter of right", 0.7),
        ];

        let (kept, dropped) = suppress_near_duplicates(documents, 0.85);
        let ids: Vec<_> = kept.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(dropped, 1);
    }

    #[test]
    fn test_keeps_partially_overlapping_documents() {
        let documents = vec![
            doc("a", "Section 302 punishment for murder death or imprisonment for life and fine", 0.9),
            doc("b", "Section 304 punishment for culpable homicide not amounting to murder", 0.8),
        ];

        let (kept, dropped) = suppress_near_duplicates(documents, 0.85);
        assert_eq!(kept.len(), 2);
        assert_eq!(dropped, 0);
    }
}
