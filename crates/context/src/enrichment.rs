//! Post-answer enrichment collaborators
//!
//! Enrichers inspect a finished answer and attach supplements. They run
//! after the answer has resolved and their failures never reach the caller.

use async_trait::async_trait;
use lexforge_common::errors::{AppError, Result};
use lexforge_search::RetrievedDocument;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};

/// Kind of supplement attached to an answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupplementKind {
    /// Statute section, e.g. "Section 302 IPC"
    Statute,
    /// Constitutional article
    Article,
    /// Reported judgment, e.g. "(1983) 3 SCC 470"
    CaseLaw,
}

/// Extra information derived from an answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Supplement {
    pub kind: SupplementKind,
    pub value: String,
}

/// Post-processing step over a resolved answer
#[async_trait]
pub trait Enricher: Send + Sync {
    fn name(&self) -> &str;

    async fn enrich(
        &self,
        question: &str,
        answer: &str,
        documents: &[RetrievedDocument],
    ) -> Result<Vec<Supplement>>;
}

/// Extracts statute, article and law-report citations
pub struct CitationExtractor {
    section: Regex,
    article: Regex,
    scc: Regex,
    air: Regex,
}

impl CitationExtractor {
    pub fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| AppError::Configuration {
                message: format!("invalid citation pattern: {}", e),
            })
        };

        Ok(Self {
            section: compile(
                r"(?i)\b(?:section|sec\.)\s*(\d+[a-z]?)(?:\s+(?:of\s+(?:the\s+)?)?(ipc|crpc|cpc|bns|bnss|bsa|indian\s+penal\s+code))?",
            )?,
            article: compile(r"(?i)\barticle\s+(\d+[a-z]?)")?,
            scc: compile(r"\(\d{4}\)\s*\d+\s+SCC\s+\d+")?,
            air: compile(r"\bAIR\s+\d{4}\s+[A-Z][A-Za-z]*\s+\d+")?,
        })
    }

    /// Citations in `text`, in order of appearance, without duplicates
    pub fn extract(&self, text: &str) -> Vec<Supplement> {
        let mut found: Vec<(usize, Supplement)> = Vec::new();

        for caps in self.section.captures_iter(text) {
            let (Some(whole), Some(number)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let mut value = format!("Section {}", number.as_str().to_uppercase());
            if let Some(code) = caps.get(2) {
                value.push(' ');
                value.push_str(&statute_abbreviation(code.as_str()));
            }
            found.push((whole.start(), Supplement { kind: SupplementKind::Statute, value }));
        }

        for caps in self.article.captures_iter(text) {
            let (Some(whole), Some(number)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            found.push((
                whole.start(),
                Supplement {
                    kind: SupplementKind::Article,
                    value: format!("Article {}", number.as_str().to_uppercase()),
                },
            ));
        }

        for m in self.scc.find_iter(text).chain(self.air.find_iter(text)) {
            found.push((
                m.start(),
                Supplement {
                    kind: SupplementKind::CaseLaw,
                    value: m.as_str().split_whitespace().collect::<Vec<_>>().join(" "),
                },
            ));
        }

        found.sort_by_key(|(pos, _)| *pos);
        let mut supplements: Vec<Supplement> = Vec::with_capacity(found.len());
        for (_, supplement) in found {
            if !supplements.contains(&supplement) {
                supplements.push(supplement);
            }
        }
        supplements
    }
}

fn statute_abbreviation(code: &str) -> String {
    let normalized = code.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    match normalized.as_str() {
        "indian penal code" => "IPC".to_string(),
        "crpc" => "CrPC".to_string(),
        other => other.to_uppercase(),
    }
}

#[async_trait]
impl Enricher for CitationExtractor {
    fn name(&self) -> &str {
        "citations"
    }

    async fn enrich(
        &self,
        _question: &str,
        answer: &str,
        _documents: &[RetrievedDocument],
    ) -> Result<Vec<Supplement>> {
        Ok(self.extract(answer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(supplements: &[Supplement]) -> Vec<&str> {
        supplements.iter().map(|s| s.value.as_str()).collect()
    }

    #[test]
    fn test_extracts_statutes_in_order() {
        let extractor = CitationExtractor::new().unwrap();
        let found = extractor.extract(
            "Section 302 of the IPC punishes murder; see also section 304 IPC and Section 302 IPC.",
        );
        assert_eq!(values(&found), vec!["Section 302 IPC", "Section 304 IPC"]);
        assert!(found.iter().all(|s| s.kind == SupplementKind::Statute));
    }

    #[test]
    fn test_extracts_articles_and_case_law() {
        let extractor = CitationExtractor::new().unwrap();
        let found = extractor.extract(
            "Article 21 protects life (Maneka Gandhi v. Union of India, (1978) 1 SCC 248; AIR 1978 SC 597).",
        );
        assert_eq!(
            values(&found),
            vec!["Article 21", "(1978) 1 SCC 248", "AIR 1978 SC 597"]
        );
        assert_eq!(found[1].kind, SupplementKind::CaseLaw);
    }

    #[test]
    fn test_bare_section_and_long_code_name() {
        let extractor = CitationExtractor::new().unwrap();
        let found = extractor.extract("Under section 438 bail is anticipatory. Section 420 of Indian Penal Code.");
        assert_eq!(values(&found), vec!["Section 438", "Section 420 IPC"]);
    }

    #[tokio::test]
    async fn test_enricher_reads_answer_only() {
        let extractor = CitationExtractor::new().unwrap();
        let supplements = extractor
            .enrich("Section 1?", "No citations here.", &[])
            .await
            .unwrap();
        assert!(supplements.is_empty());
        assert_eq!(extractor.name(), "citations");
    }
}
