//! PostgreSQL document index
//!
//! Expects a `documents` table:
//!
//! ```sql
//! CREATE TABLE documents (
//!     id        TEXT PRIMARY KEY,
//!     content   TEXT NOT NULL,
//!     source    TEXT NOT NULL,
//!     metadata  JSONB NOT NULL DEFAULT '{}',
//!     embedding vector(384)
//! );
//! ```

use super::DocumentIndex;
use crate::retrieval::{DocumentMetadata, RetrievalMode, RetrievedDocument, SearchFilters};
use async_trait::async_trait;
use lexforge_common::db::DbPool;
use lexforge_common::errors::Result;
use sea_orm::{ConnectionTrait, DbBackend, QueryResult, Statement};
use std::sync::Arc;
use tracing::debug;

/// Dense and full-text search over Postgres
pub struct PgDocumentIndex {
    db: Arc<DbPool>,
}

impl PgDocumentIndex {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }
}

/// pgvector literal, e.g. `[0.1,0.2,0.3]`
fn vector_literal(embedding: &[f32]) -> String {
    format!(
        "[{}]",
        embedding
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join(",")
    )
}

/// Query text for `plainto_tsquery`; requested sections are folded in as terms
fn keyword_query(text: &str, filters: &SearchFilters) -> String {
    let mut query = text.trim().to_string();
    for section in &filters.sections {
        query.push(' ');
        query.push_str(section);
    }
    query
}

/// Nearest neighbours by cosine distance, the embedding bound as `$1::vector`
fn dense_statement(embedding: &[f32], filters: &SearchFilters, k: usize) -> Statement {
    let sql = r#"
        SELECT
            d.id,
            d.content,
            d.source,
            d.metadata,
            1 - (d.embedding <=> $1::vector) AS score
        FROM documents d
        WHERE d.embedding IS NOT NULL
          AND ($2::text IS NULL OR d.metadata->>'domain' IS NULL OR lower(d.metadata->>'domain') = lower($2))
        ORDER BY d.embedding <=> $1::vector
        LIMIT $3
    "#;

    Statement::from_sql_and_values(
        DbBackend::Postgres,
        sql,
        vec![
            vector_literal(embedding).into(),
            filters.domain.clone().into(),
            (k as i64).into(),
        ],
    )
}

fn row_to_document(row: &QueryResult, score: f32, mode: RetrievalMode) -> Option<RetrievedDocument> {
    let metadata: DocumentMetadata = row
        .try_get::<Option<serde_json::Value>>("", "metadata")
        .ok()
        .flatten()
        .and_then(|value| serde_json::from_value(value).ok())
        .unwrap_or_default();

    Some(RetrievedDocument {
        id: row.try_get("", "id").ok()?,
        text: row.try_get("", "content").ok()?,
        score,
        source: row.try_get("", "source").unwrap_or_default(),
        metadata,
        retrieval_mode: mode,
    })
}

#[async_trait]
impl DocumentIndex for PgDocumentIndex {
    async fn search(
        &self,
        embedding: &[f32],
        filters: &SearchFilters,
        k: usize,
    ) -> Result<Vec<RetrievedDocument>> {
        let rows = self
            .db
            .read()
            .query_all(dense_statement(embedding, filters, k))
            .await?;

        let documents: Vec<RetrievedDocument> = rows
            .iter()
            .filter_map(|row| {
                let score = row.try_get::<f64>("", "score").ok()? as f32;
                row_to_document(row, score, RetrievalMode::Dense)
            })
            .collect();

        debug!(count = documents.len(), "Dense search completed");
        Ok(documents)
    }

    async fn keyword_search(
        &self,
        text: &str,
        filters: &SearchFilters,
        k: usize,
    ) -> Result<Vec<RetrievedDocument>> {
        let query = keyword_query(text, filters);
        if query.is_empty() {
            return Ok(vec![]);
        }

        // ts_rank_cd with length normalization for BM25-like scoring
        let sql = r#"
            SELECT
                d.id,
                d.content,
                d.source,
                d.metadata,
                ts_rank_cd(
                    to_tsvector('english', d.content),
                    plainto_tsquery('english', $1),
                    32
                ) AS score
            FROM documents d
            WHERE to_tsvector('english', d.content) @@ plainto_tsquery('english', $1)
              AND ($2::text IS NULL OR d.metadata->>'domain' IS NULL OR lower(d.metadata->>'domain') = lower($2))
            ORDER BY score DESC
            LIMIT $3
        "#;

        let rows = self
            .db
            .read()
            .query_all(Statement::from_sql_and_values(
                DbBackend::Postgres,
                sql,
                vec![query.into(), filters.domain.clone().into(), (k as i64).into()],
            ))
            .await?;

        let documents: Vec<RetrievedDocument> = rows
            .iter()
            .filter_map(|row| {
                let score: f64 = row.try_get("", "score").ok()?;
                // ts_rank_cd can exceed 1
                let normalized = (score / (score + 1.0)) as f32;
                row_to_document(row, normalized, RetrievalMode::Keyword)
            })
            .collect();

        debug!(count = documents.len(), "Keyword search completed");
        Ok(documents)
    }

    async fn ping(&self) -> Result<()> {
        self.db.ping().await
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_literal() {
        assert_eq!(vector_literal(&[0.1, 0.2, 0.3]), "[0.1,0.2,0.3]");
        assert_eq!(vector_literal(&[]), "[]");
    }

    #[test]
    fn test_dense_statement_binds_embedding() {
        let filters = SearchFilters {
            domain: Some("criminal".into()),
            sections: vec![],
        };
        let statement = dense_statement(&[0.25, -0.5], &filters, 4);

        assert!(statement.sql.contains("$1::vector"));
        assert!(!statement.sql.contains("[0.25,-0.5]"));
        assert_eq!(statement.values.map(|v| v.0.len()), Some(3));
    }

    #[test]
    fn test_keyword_query_folds_sections() {
        let filters = SearchFilters {
            domain: None,
            sections: vec!["302".into()],
        };
        assert_eq!(keyword_query(" punishment for murder ", &filters), "punishment for murder 302");
        assert_eq!(keyword_query("   ", &SearchFilters::default()), "");
    }
}
