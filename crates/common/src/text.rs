//! Text helpers shared by keyword search, de-duplication and embeddings

use std::collections::HashSet;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "is", "it", "of",
    "on", "or", "that", "the", "this", "to", "was", "what", "which", "with",
];

/// Lowercased alphanumeric tokens, stopwords removed
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Distinct tokens
pub fn token_set(text: &str) -> HashSet<String> {
    tokenize(text).into_iter().collect()
}

/// Overlapping token windows of `size`; short texts yield one shingle
pub fn shingles(text: &str, size: usize) -> HashSet<String> {
    let tokens = tokenize(text);
    let size = size.max(1);
    if tokens.len() <= size {
        return std::iter::once(tokens.join(" ")).filter(|s| !s.is_empty()).collect();
    }
    tokens.windows(size).map(|w| w.join(" ")).collect()
}

/// Jaccard similarity of two sets; two empty sets are identical
pub fn jaccard<T: Eq + std::hash::Hash>(a: &HashSet<T>, b: &HashSet<T>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f32 / union as f32
}

/// Cut `text` to at most `max_chars` characters on a char boundary
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("What is IPC Section 302?"),
            vec!["ipc", "section", "302"]
        );
    }

    #[test]
    fn test_jaccard_of_shingles() {
        let a = shingles("punishment for murder under section 302", 3);
        let b = shingles("punishment for murder under section 302", 3);
        let c = shingles("bail provisions for bailable offences", 3);
        assert_eq!(jaccard(&a, &b), 1.0);
        assert!(jaccard(&a, &c) < 0.1);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("धारा 302", 4), "धारा");
        assert_eq!(truncate_chars("short", 10), "short");
    }
}
