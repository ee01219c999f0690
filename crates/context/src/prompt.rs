//! Prompt assembly for answer generation

use crate::llm::CompletionRequest;
use lexforge_common::text::truncate_chars;
use lexforge_search::RetrievedDocument;
use std::fmt::Write;

const SYSTEM_PROMPT: &str = "You are LexForge, an assistant for questions about Indian law. \
Answer from the numbered sources when they are provided and cite them as [n]. \
If the sources do not cover the question, say so and answer only with well-established law. \
Be precise about section numbers and statutes. This is general information, not legal advice.";

/// Per-document character budget inside the prompt
const MAX_SOURCE_CHARS: usize = 1_500;

/// Generation settings applied to every answer
#[derive(Debug, Clone, Copy)]
pub struct PromptSettings {
    pub temperature: f32,
    pub max_tokens: usize,
}

/// Build the answer request from the question, history and sources
pub fn answer_request(
    question: &str,
    history: &str,
    documents: &[RetrievedDocument],
    settings: PromptSettings,
) -> CompletionRequest {
    let mut prompt = String::new();

    if !history.trim().is_empty() {
        let _ = write!(prompt, "Conversation so far:\n{}\n\n", history.trim());
    }

    if !documents.is_empty() {
        prompt.push_str("Sources:\n");
        for (i, doc) in documents.iter().enumerate() {
            let _ = writeln!(
                prompt,
                "[{}] {}\n{}\n",
                i + 1,
                source_label(doc),
                truncate_chars(doc.text.trim(), MAX_SOURCE_CHARS)
            );
        }
    }

    let _ = write!(prompt, "Question: {}", question.trim());

    CompletionRequest::new(prompt)
        .with_system(SYSTEM_PROMPT)
        .with_temperature(settings.temperature)
        .with_max_tokens(settings.max_tokens)
}

fn source_label(doc: &RetrievedDocument) -> String {
    let meta = &doc.metadata;
    let mut label = meta.title.clone().unwrap_or_else(|| doc.source.clone());
    match (&meta.act, &meta.section) {
        (Some(act), Some(section)) => {
            let _ = write!(label, " ({}, s. {})", act, section);
        }
        (Some(act), None) => {
            let _ = write!(label, " ({})", act);
        }
        (None, Some(section)) => {
            let _ = write!(label, " (s. {})", section);
        }
        (None, None) => {}
    }
    label
}

#[cfg(test)]
mod tests {
    use super::*;
    use lexforge_search::DocumentMetadata;

    fn settings() -> PromptSettings {
        PromptSettings {
            temperature: 0.2,
            max_tokens: 512,
        }
    }

    #[test]
    fn test_prompt_numbers_sources() {
        let doc = RetrievedDocument {
            id: "ipc-302".into(),
            text: "Whoever commits murder shall be punished with death or imprisonment for life.".into(),
            score: 0.9,
            source: "seed".into(),
            metadata: DocumentMetadata {
                title: Some("Punishment for murder".into()),
                act: Some("IPC".into()),
                section: Some("302".into()),
                ..DocumentMetadata::default()
            },
            retrieval_mode: Default::default(),
        };

        let request = answer_request("What is IPC Section 302?", "", &[doc], settings());
        assert!(request.prompt.contains("[1] Punishment for murder (IPC, s. 302)"));
        assert!(request.prompt.ends_with("Question: What is IPC Section 302?"));
        assert!(!request.prompt.contains("Conversation so far"));
        assert_eq!(request.max_tokens, 512);
        assert!(request.system.is_some());
    }

    #[test]
    fn test_prompt_includes_history() {
        let request = answer_request("And for theft?", "Q: murder?\nA: s. 302", &[], settings());
        assert!(request.prompt.starts_with("Conversation so far:\nQ: murder?"));
        assert!(!request.prompt.contains("Sources:"));
    }
}
