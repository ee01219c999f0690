//! Append-only feedback log
//!
//! Records are kept in process and, when Redis is configured, also pushed
//! as JSON onto a list so they survive restarts. Redis failures never fail
//! the submission.

use crate::config::RedisConfig;
use crate::errors::{AppError, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use redis::{aio::MultiplexedConnection, AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A user rating of one answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub id: Uuid,
    pub query: String,
    pub answer: String,
    pub rating: u8,
    pub session_id: String,
    pub text: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl FeedbackRecord {
    /// Validate and timestamp a new record
    pub fn new(
        query: impl Into<String>,
        answer: impl Into<String>,
        rating: u8,
        session_id: impl Into<String>,
        text: Option<String>,
    ) -> Result<Self> {
        if !(1..=5).contains(&rating) {
            return Err(AppError::InvalidRating { rating });
        }

        Ok(Self {
            id: Uuid::new_v4(),
            query: query.into(),
            answer: answer.into(),
            rating,
            session_id: session_id.into(),
            text: text.filter(|t| !t.trim().is_empty()),
            created_at: Utc::now(),
        })
    }
}

struct RedisSink {
    connection: MultiplexedConnection,
    key: String,
}

/// Feedback storage
pub struct FeedbackStore {
    log: RwLock<Vec<FeedbackRecord>>,
    redis: Option<RedisSink>,
}

impl FeedbackStore {
    /// Process-local store
    pub fn in_memory() -> Self {
        Self {
            log: RwLock::new(Vec::new()),
            redis: None,
        }
    }

    /// Store that also mirrors records to Redis
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str()).map_err(|e| AppError::CacheError {
            message: format!("Failed to create Redis client: {}", e),
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| AppError::CacheError {
                message: format!("Failed to connect to Redis: {}", e),
            })?;

        info!(key = %config.feedback_key, "Feedback mirrored to Redis");

        Ok(Self {
            log: RwLock::new(Vec::new()),
            redis: Some(RedisSink {
                connection,
                key: config.feedback_key.clone(),
            }),
        })
    }

    /// Append a record
    pub async fn append(&self, record: FeedbackRecord) {
        if let Some(ref sink) = self.redis {
            match serde_json::to_string(&record) {
                Ok(payload) => {
                    let mut conn = sink.connection.clone();
                    let pushed: redis::RedisResult<i64> = conn.rpush(&sink.key, payload).await;
                    match pushed {
                        Ok(len) => debug!(key = %sink.key, len, "Feedback pushed"),
                        Err(e) => warn!(error = %e, "Failed to push feedback to Redis"),
                    }
                }
                Err(e) => warn!(error = %e, "Failed to serialize feedback"),
            }
        }

        self.log.write().push(record);
    }

    /// Copy of all records in submission order
    pub fn records(&self) -> Vec<FeedbackRecord> {
        self.log.read().clone()
    }

    pub fn len(&self) -> usize {
        self.log.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rating_bounds() {
        assert!(matches!(
            FeedbackRecord::new("q", "a", 0, "s", None),
            Err(AppError::InvalidRating { rating: 0 })
        ));
        assert!(FeedbackRecord::new("q", "a", 6, "s", None).is_err());
        assert!(FeedbackRecord::new("q", "a", 5, "s", None).is_ok());
    }

    #[test]
    fn test_blank_comment_is_dropped() {
        let record = FeedbackRecord::new("q", "a", 4, "s", Some("   ".into())).unwrap();
        assert_eq!(record.text, None);
    }

    #[test]
    fn test_in_memory_log_is_append_only() {
        let store = FeedbackStore::in_memory();
        assert!(store.is_empty());

        let first = FeedbackRecord::new("What is IPC Section 302?", "Murder", 5, "s1", None).unwrap();
        let second = FeedbackRecord::new("Bail?", "Depends", 3, "s2", Some("vague".into())).unwrap();
        tokio_test::block_on(async {
            store.append(first.clone()).await;
            store.append(second.clone()).await;
        });

        assert_eq!(store.records(), vec![first, second]);
    }
}
