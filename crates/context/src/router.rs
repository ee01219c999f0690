//! Query Router - Decides whether a question needs retrieval
//!
//! Provides:
//! - Rule-based pre-classification (greetings, legal markers, domain)
//! - Generator classification with a bounded budget
//! - Complexity estimation driving the retrieval depth
//!
//! Routing never fails: any classification problem falls back to
//! retrieval.

use crate::llm::{CompletionRequest, ProviderChain};
use lexforge_common::config::RouterConfig;
use lexforge_common::errors::{AppError, Result};
use lexforge_common::metrics;
use lexforge_common::text;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Query type classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    /// Legal question
    Legal,
    /// Greeting or pleasantry
    Greeting,
    /// Non-legal question
    General,
    /// Ambiguous; the user should be asked to clarify
    Clarification,
}

impl QueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::Legal => "legal",
            QueryType::Greeting => "greeting",
            QueryType::General => "general",
            QueryType::Clarification => "clarification",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "legal" => Some(QueryType::Legal),
            "greeting" => Some(QueryType::Greeting),
            "general" => Some(QueryType::General),
            "clarification" => Some(QueryType::Clarification),
            _ => None,
        }
    }
}

/// Estimated question complexity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

impl Complexity {
    /// Documents to retrieve when the caller does not ask for a number
    pub fn default_k(&self) -> usize {
        match self {
            Complexity::Simple => 3,
            Complexity::Moderate => 5,
            Complexity::Complex => 8,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Simple => "simple",
            Complexity::Moderate => "moderate",
            Complexity::Complex => "complex",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "simple" => Some(Complexity::Simple),
            "moderate" => Some(Complexity::Moderate),
            "complex" => Some(Complexity::Complex),
            _ => None,
        }
    }
}

/// Retrieval parameters derived from the question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalParams {
    pub domain: Option<String>,
    /// Cited provisions, e.g. "302" or "article 21"
    pub sections: Vec<String>,
    pub keywords: Vec<String>,
    pub complexity: Complexity,
}

/// Which stage produced the decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingSource {
    Rules,
    Classifier,
    FailOpen,
}

/// Routing decision for one query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub needs_retrieval: bool,
    pub query_type: QueryType,
    /// Confidence in [0, 1]
    pub confidence: f32,
    pub direct_answer: Option<String>,
    pub retrieval_params: Option<RetrievalParams>,
    pub source: RoutingSource,
}

impl RoutingDecision {
    /// Complexity of the question, `simple` when no parameters were derived
    pub fn complexity(&self) -> Complexity {
        self.retrieval_params
            .as_ref()
            .map(|p| p.complexity)
            .unwrap_or(Complexity::Simple)
    }
}

/// Stage-one findings
#[derive(Debug, Clone, Default)]
struct Signals {
    greeting: bool,
    sections: Vec<String>,
    statutes: usize,
    legal_terms: usize,
    comparison: bool,
}

impl Signals {
    fn strong_legal(&self) -> bool {
        !self.sections.is_empty() || self.statutes > 0 || self.legal_terms > 0
    }
}

/// Compiled stage-one patterns
struct Patterns {
    greeting: Regex,
    section: Regex,
    article: Regex,
    statute: Regex,
    legal_term: Regex,
    comparison: Regex,
    follow_up: Regex,
}

impl Patterns {
    fn compile() -> Result<Self> {
        Ok(Self {
            greeting: compile(
                r"(?i)^(?:hi|hello|hey|hiya|greetings|namaste|good\s+(?:morning|afternoon|evening)|thanks|thank\s+you|thx|bye|goodbye)(?:\s+(?:there|all|everyone|so\s+much|a\s+lot))?[\s!.,?]*$",
            )?,
            section: compile(r"(?i)\b(?:section|sec\.?|s\.)\s*(\d+[a-z]?)")?,
            article: compile(r"(?i)\b(?:article|art\.)\s*(\d+[a-z]?)")?,
            statute: compile(r"(?i)\b(?:ipc|crpc|cr\.p\.c|cpc|bns|bnss|bsa|ndps|pocso|constitution)\b")?,
            legal_term: compile(
                r"(?i)\b(?:act|court|bail|fir|petition|appeal|judgm?ent|statute|law|legal|offen[cs]e|punishment|penalty|accused|contract|divorce|custody|tenant|landlord|writ|plaintiff|defendant|advocate|lawyer|rights?)\b",
            )?,
            comparison: compile(r"(?i)\b(?:compare|comparison|difference|differences|versus|vs\.?|distinguish|contrast)\b")?,
            follow_up: compile(
                r"(?i)\b(?:it|its|this|that|these|those|he|she|they|him|her|them|his|their|same|above|previous|earlier|aforesaid|mentioned)\b",
            )?,
        })
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| AppError::Configuration {
        message: format!("invalid routing pattern: {}", e),
    })
}

/// Domain keyword table, first match order breaks ties
const DOMAINS: &[(&str, &[&str])] = &[
    (
        "criminal",
        &[
            "ipc", "crpc", "bns", "bnss", "bail", "fir", "murder", "theft", "robbery", "accused",
            "offence", "offense", "punishment", "arrest", "cheating", "culpable", "homicide",
        ],
    ),
    (
        "constitutional",
        &["constitution", "article", "fundamental", "writ", "parliament", "amendment"],
    ),
    (
        "family",
        &["divorce", "custody", "maintenance", "marriage", "adoption", "alimony", "guardianship"],
    ),
    (
        "civil",
        &["cpc", "contract", "property", "tenant", "landlord", "suit", "decree", "injunction", "lease"],
    ),
];

/// Classifier reply
#[derive(Debug, Default, Deserialize)]
struct Classification {
    needs_retrieval: Option<bool>,
    query_type: Option<String>,
    confidence: Option<f32>,
    direct_answer: Option<String>,
    domain: Option<String>,
    complexity: Option<String>,
}

const CLASSIFIER_PROMPT: &str = "You route questions for an Indian legal assistant. \
Reply with one JSON object and nothing else: \
{\"needs_retrieval\": bool, \"query_type\": \"legal\"|\"greeting\"|\"general\"|\"clarification\", \
\"confidence\": number between 0 and 1, \"direct_answer\": string or null, \
\"domain\": string or null, \"complexity\": \"simple\"|\"moderate\"|\"complex\"}. \
Set needs_retrieval to true whenever the answer depends on statutes, case law or procedure.";

const GREETING_REPLY: &str =
    "Hello! I can help with questions about Indian law, statutes and legal procedure. What would you like to know?";

/// Query router
pub struct Router {
    chain: Option<Arc<ProviderChain>>,
    config: RouterConfig,
    patterns: Patterns,
}

impl Router {
    /// Create a router; without a chain only rule-based routing runs
    pub fn new(config: RouterConfig, chain: Option<Arc<ProviderChain>>) -> Result<Self> {
        Ok(Self {
            chain,
            config,
            patterns: Patterns::compile()?,
        })
    }

    /// Route a query. Never fails.
    pub async fn route(&self, query: &str) -> RoutingDecision {
        let query = query.trim();
        let signals = self.pre_classify(query);

        if signals.greeting {
            metrics::record_routing(QueryType::Greeting.as_str(), false);
            return RoutingDecision {
                needs_retrieval: false,
                query_type: QueryType::Greeting,
                confidence: 0.95,
                direct_answer: Some(GREETING_REPLY.to_string()),
                retrieval_params: None,
                source: RoutingSource::Rules,
            };
        }

        let params = self.base_params(query, &signals);

        let chain = match self.chain {
            Some(ref chain) if self.config.classifier_enabled => chain,
            _ => {
                let decision = Self::fail_open(params, RoutingSource::Rules);
                metrics::record_routing(decision.query_type.as_str(), false);
                return decision;
            }
        };

        let decision = match self.classify(chain, query).await {
            Ok(classification) => self.merge(classification, params, &signals),
            Err(e) => {
                warn!(error = %e, "Query classification failed, routing to retrieval");
                Self::fail_open(params, RoutingSource::FailOpen)
            }
        };

        metrics::record_routing(
            decision.query_type.as_str(),
            decision.source == RoutingSource::Classifier,
        );
        debug!(
            query_type = decision.query_type.as_str(),
            needs_retrieval = decision.needs_retrieval,
            confidence = decision.confidence,
            complexity = decision.complexity().as_str(),
            "Query routed"
        );
        decision
    }

    /// Whether the question leans on earlier turns ("what is the punishment for it?")
    pub fn refers_back(&self, query: &str) -> bool {
        self.patterns.follow_up.is_match(query)
    }

    fn pre_classify(&self, query: &str) -> Signals {
        let p = &self.patterns;
        let mut sections: Vec<String> = Vec::new();

        for caps in p.section.captures_iter(query) {
            if let Some(m) = caps.get(1) {
                sections.push(m.as_str().to_lowercase());
            }
        }
        for caps in p.article.captures_iter(query) {
            if let Some(m) = caps.get(1) {
                sections.push(format!("article {}", m.as_str().to_lowercase()));
            }
        }
        sections.dedup();

        Signals {
            greeting: p.greeting.is_match(query),
            sections,
            statutes: p.statute.find_iter(query).count(),
            legal_terms: p.legal_term.find_iter(query).count(),
            comparison: p.comparison.is_match(query),
        }
    }

    fn base_params(&self, query: &str, signals: &Signals) -> RetrievalParams {
        let keywords = text::tokenize(query);
        RetrievalParams {
            domain: infer_domain(&keywords),
            sections: signals.sections.clone(),
            complexity: estimate_complexity(query, signals),
            keywords,
        }
    }

    async fn classify(&self, chain: &ProviderChain, query: &str) -> Result<Classification> {
        let request = CompletionRequest::new(format!("Question: {}", query))
            .with_system(CLASSIFIER_PROMPT)
            .with_temperature(0.0)
            .with_max_tokens(self.config.max_tokens);

        let timeout = Duration::from_millis(self.config.timeout_ms);
        let completion = tokio::time::timeout(timeout, chain.complete(&request))
            .await
            .map_err(|_| AppError::timeout("query classification", timeout))??;

        let json = extract_json_object(&completion.text).ok_or_else(|| AppError::Routing {
            message: "classifier reply contains no JSON object".to_string(),
        })?;

        serde_json::from_str(json).map_err(|e| AppError::Routing {
            message: format!("malformed classifier reply: {}", e),
        })
    }

    fn merge(&self, c: Classification, mut params: RetrievalParams, signals: &Signals) -> RoutingDecision {
        let mut query_type = c
            .query_type
            .as_deref()
            .and_then(QueryType::parse)
            .unwrap_or(QueryType::Legal);
        let mut needs_retrieval = c.needs_retrieval.unwrap_or(true);
        let mut confidence = c.confidence.unwrap_or(0.7).clamp(0.0, 1.0);

        // Statute or section references always go to the index
        if !needs_retrieval && signals.strong_legal() {
            debug!("Classifier skipped retrieval for a legal question, overriding");
            needs_retrieval = true;
            if matches!(query_type, QueryType::Greeting | QueryType::General) {
                query_type = QueryType::Legal;
            }
            confidence = confidence.min(0.6);
        }

        if let Some(domain) = c.domain.filter(|d| !d.trim().is_empty()) {
            params.domain = Some(domain.trim().to_lowercase());
        }
        if let Some(complexity) = c.complexity.as_deref().and_then(Complexity::parse) {
            params.complexity = complexity;
        }

        let direct_answer = if needs_retrieval {
            None
        } else {
            c.direct_answer.filter(|a| !a.trim().is_empty())
        };

        RoutingDecision {
            needs_retrieval,
            query_type,
            confidence,
            direct_answer,
            retrieval_params: Some(params),
            source: RoutingSource::Classifier,
        }
    }

    fn fail_open(params: RetrievalParams, source: RoutingSource) -> RoutingDecision {
        RoutingDecision {
            needs_retrieval: true,
            query_type: QueryType::Legal,
            confidence: 0.5,
            direct_answer: None,
            retrieval_params: Some(params),
            source,
        }
    }
}

fn infer_domain(tokens: &[String]) -> Option<String> {
    let mut best: Option<(&str, usize)> = None;
    for (domain, words) in DOMAINS {
        let hits = tokens.iter().filter(|t| words.contains(&t.as_str())).count();
        if hits > 0 && best.map_or(true, |(_, n)| hits > n) {
            best = Some((*domain, hits));
        }
    }
    best.map(|(domain, _)| domain.to_string())
}

fn estimate_complexity(query: &str, signals: &Signals) -> Complexity {
    let words = query.split_whitespace().count();
    let provisions = signals.sections.len();
    let questions = query.matches('?').count();
    let multi_part = signals.comparison || questions > 1;

    if provisions >= 3 || words > 40 || (multi_part && (provisions >= 2 || words > 25)) {
        Complexity::Complex
    } else if multi_part || provisions == 2 || words > 15 {
        Complexity::Moderate
    } else {
        Complexity::Simple
    }
}

/// First balanced `{...}` block in `text`, ignoring braces inside strings
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}
