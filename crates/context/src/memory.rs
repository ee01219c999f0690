//! Memory Agent - Short-term conversational memory per session
//!
//! Sessions live in a sharded map; each session sits behind its own async
//! mutex so distinct sessions never contend and turns of one session are
//! applied in arrival order.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lexforge_common::config::MemoryConfig;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// One question/answer exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub question: String,
    pub answer: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    fn render(&self) -> String {
        format!("Q: {}\nA: {}", self.question, self.answer)
    }
}

#[derive(Debug)]
struct Session {
    turns: VecDeque<Turn>,
    last_active: Instant,
}

impl Session {
    fn new() -> Self {
        Self {
            turns: VecDeque::new(),
            last_active: Instant::now(),
        }
    }
}

/// Per-session rolling window of turns
pub struct MemoryAgent {
    sessions: DashMap<String, Arc<Mutex<Session>>>,
    max_turns: usize,
    max_context_chars: usize,
}

impl MemoryAgent {
    pub fn new(config: &MemoryConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            max_turns: config.max_turns.max(1),
            max_context_chars: config.max_context_chars,
        }
    }

    fn session(&self, session_id: &str) -> Arc<Mutex<Session>> {
        if let Some(session) = self.sessions.get(session_id) {
            return session.clone();
        }
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Session::new())))
            .clone()
    }

    /// Prior turns as prompt context, most recent last.
    ///
    /// When the window exceeds the character budget the oldest material is
    /// dropped first. Unknown sessions yield an empty string.
    pub async fn get_context(&self, session_id: &str) -> String {
        let Some(session) = self.sessions.get(session_id).map(|s| s.clone()) else {
            return String::new();
        };
        let session = session.lock().await;

        let mut kept: Vec<String> = Vec::new();
        let mut used = 0usize;
        for turn in session.turns.iter().rev() {
            let rendered = turn.render();
            let cost = rendered.chars().count() + if kept.is_empty() { 0 } else { 2 };
            if used + cost <= self.max_context_chars {
                used += cost;
                kept.push(rendered);
                continue;
            }
            if kept.is_empty() {
                // Keep the tail of an oversized latest turn
                kept.push(tail_chars(&rendered, self.max_context_chars).to_string());
            }
            break;
        }

        kept.reverse();
        kept.join("\n\n")
    }

    /// Record a completed turn, trimming the window to `max_turns`
    pub async fn append_turn(&self, session_id: &str, question: &str, answer: &str) {
        let session = self.session(session_id);
        let mut session = session.lock().await;

        session.turns.push_back(Turn {
            question: question.to_string(),
            answer: answer.to_string(),
            timestamp: Utc::now(),
        });
        while session.turns.len() > self.max_turns {
            session.turns.pop_front();
        }
        session.last_active = Instant::now();
    }

    /// Turns currently held for a session, oldest first
    pub async fn turns(&self, session_id: &str) -> Vec<Turn> {
        match self.sessions.get(session_id).map(|s| s.clone()) {
            Some(session) => session.lock().await.turns.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Drop sessions idle for longer than `max_idle`. Returns how many were removed.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| {
            // In use elsewhere: keep
            if Arc::strong_count(session) > 1 {
                return true;
            }
            match session.try_lock() {
                Ok(guard) => guard.last_active.elapsed() < max_idle,
                Err(_) => true,
            }
        });
        let evicted = before.saturating_sub(self.sessions.len());
        if evicted > 0 {
            debug!(evicted, remaining = self.sessions.len(), "Evicted idle sessions");
        }
        evicted
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

fn tail_chars(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    match text.char_indices().nth(count - max_chars) {
        Some((idx, _)) => &text[idx..],
        None => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(max_turns: usize, max_context_chars: usize) -> MemoryAgent {
        MemoryAgent::new(&MemoryConfig {
            max_turns,
            max_context_chars,
            ..MemoryConfig::default()
        })
    }

    #[tokio::test]
    async fn test_context_lists_turns_oldest_first() {
        let memory = agent(5, 10_000);
        memory.append_turn("s1", "What is bail?", "Release pending trial.").await;
        memory.append_turn("s1", "Is it a right?", "For bailable offences.").await;

        let context = memory.get_context("s1").await;
        assert_eq!(
            context,
            "Q: What is bail?\nA: Release pending trial.\n\nQ: Is it a right?\nA: For bailable offences."
        );
    }

    #[tokio::test]
    async fn test_window_is_bounded() {
        let memory = agent(3, 10_000);
        for i in 0..10 {
            memory.append_turn("s1", &format!("q{}", i), &format!("a{}", i)).await;
        }

        let turns = memory.turns("s1").await;
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].question, "q7");
        assert_eq!(turns[2].question, "q9");
    }

    #[tokio::test]
    async fn test_context_truncation_drops_oldest() {
        let memory = agent(10, 30);
        memory.append_turn("s1", "first question", "first answer").await;
        memory.append_turn("s1", "second", "answer").await;

        let context = memory.get_context("s1").await;
        assert!(context.chars().count() <= 30);
        assert!(context.contains("second"));
        assert!(!context.contains("first"));
    }

    #[tokio::test]
    async fn test_oversized_turn_keeps_its_tail() {
        let memory = agent(10, 12);
        memory.append_turn("s1", "question", "a long final answer").await;

        let context = memory.get_context("s1").await;
        assert_eq!(context.chars().count(), 12);
        assert!(context.ends_with("final answer"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sessions_are_isolated() {
        let memory = Arc::new(agent(50, 100_000));

        let mut handles = Vec::new();
        for s in 0..8 {
            let memory = memory.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..20 {
                    memory
                        .append_turn(&format!("s{}", s), &format!("q{}-{}", s, i), "a")
                        .await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(memory.session_count(), 8);
        for s in 0..8 {
            let turns = memory.turns(&format!("s{}", s)).await;
            assert_eq!(turns.len(), 20);
            assert!(turns.iter().all(|t| t.question.starts_with(&format!("q{}-", s))));
            // FIFO within a session
            assert_eq!(turns[19].question, format!("q{}-19", s));
        }
    }

    #[tokio::test]
    async fn test_unknown_session_has_empty_context() {
        let memory = agent(5, 1000);
        assert_eq!(memory.get_context("nobody").await, "");
        assert_eq!(memory.session_count(), 0);
    }

    #[tokio::test]
    async fn test_evict_idle() {
        let memory = agent(5, 1000);
        memory.append_turn("old", "q", "a").await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        memory.append_turn("fresh", "q", "a").await;

        assert_eq!(memory.evict_idle(Duration::from_millis(20)), 1);
        assert_eq!(memory.session_count(), 1);
        assert!(memory.turns("old").await.is_empty());
        assert_eq!(memory.turns("fresh").await.len(), 1);
    }
}
