//! SQLite-backed [`VectorStore`] implementation.
//!
//! Maps each trait operation onto the schema created by
//! [`crate::migrate`]: the base tables hold rows and embedding BLOBs,
//! the FTS5 mirror tables serve keyword queries.

use std::collections::HashSet;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::models::{Chunk, CodeExample, CrawlStatus, OriginType, Source};
use crate::store::{MatchRow, SearchFilter, Table, VectorStore};

/// SQLite implementation of the [`VectorStore`] trait.
///
/// Wraps a [`SqlitePool`] and translates every method into one or more
/// SQL statements. Vector queries scan the stored embedding BLOBs and
/// rank by cosine similarity in process; keyword queries go through the
/// FTS5 mirror tables and rank by BM25.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn to_json(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

fn from_json(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

/// Rewrites free text into an FTS5 MATCH expression.
///
/// Terms are reduced to alphanumeric runs, quoted, and joined with OR,
/// so user punctuation can never produce an FTS5 syntax error. Returns
/// `None` when no searchable term remains.
fn fts_match_expr(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|term| !term.is_empty())
        .map(|term| format!("\"{term}\""))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

fn row_to_source(row: &SqliteRow) -> Result<Source> {
    let id: String = row.get("id");
    let origin_raw: String = row.get("origin_type");
    let status_raw: String = row.get("crawl_status");
    let origin_type = OriginType::parse(&origin_raw)
        .ok_or_else(|| anyhow!("source {id}: unknown origin_type {origin_raw:?}"))?;
    let crawl_status = CrawlStatus::parse(&status_raw)
        .ok_or_else(|| anyhow!("source {id}: unknown crawl_status {status_raw:?}"))?;
    let tags: String = row.get("tags");
    Ok(Source {
        id,
        title: row.get("title"),
        summary: row.get("summary"),
        origin_type,
        crawl_status,
        knowledge_type: row.get("knowledge_type"),
        tags: from_json(&tags),
        word_count: row.get("word_count"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

const SOURCE_COLUMNS: &str = "id, title, summary, origin_type, crawl_status, \
                              knowledge_type, tags, word_count, created_at, updated_at";

#[async_trait]
impl VectorStore for SqliteStore {
    async fn upsert_source(&self, source: &Source) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sources (id, title, summary, origin_type, crawl_status,
                                 knowledge_type, tags, word_count, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                summary = excluded.summary,
                origin_type = excluded.origin_type,
                crawl_status = excluded.crawl_status,
                knowledge_type = excluded.knowledge_type,
                tags = excluded.tags,
                word_count = excluded.word_count,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&source.id)
        .bind(&source.title)
        .bind(&source.summary)
        .bind(source.origin_type.as_str())
        .bind(source.crawl_status.as_str())
        .bind(&source.knowledge_type)
        .bind(to_json(&source.tags))
        .bind(source.word_count)
        .bind(source.created_at)
        .bind(source.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_source(&self, source_id: &str) -> Result<Option<Source>> {
        let sql = format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_source).transpose()
    }

    async fn list_sources(&self) -> Result<Vec<Source>> {
        let sql = format!("SELECT {SOURCE_COLUMNS} FROM sources ORDER BY created_at ASC, id ASC");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        rows.iter().map(row_to_source).collect()
    }

    async fn delete_source_record(&self, source_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sources WHERE id = ?")
            .bind(source_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn insert_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for chunk in chunks {
            let blob = vec_to_blob(&chunk.embedding);
            sqlx::query(
                r#"
                INSERT INTO chunks (id, source_id, url, content, embedding, content_hash,
                                    headers, knowledge_type, tags, char_count, word_count, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.source_id)
            .bind(&chunk.url)
            .bind(&chunk.content)
            .bind(&blob)
            .bind(&chunk.content_hash)
            .bind(to_json(&chunk.headers))
            .bind(&chunk.knowledge_type)
            .bind(to_json(&chunk.tags))
            .bind(chunk.char_count)
            .bind(chunk.word_count)
            .bind(chunk.created_at)
            .execute(&mut *tx)
            .await?;

            sqlx::query("INSERT INTO chunks_fts (chunk_id, source_id, content) VALUES (?, ?, ?)")
                .bind(&chunk.id)
                .bind(&chunk.source_id)
                .bind(&chunk.content)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn insert_code_examples(&self, examples: &[CodeExample]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for example in examples {
            let blob = vec_to_blob(&example.embedding);
            sqlx::query(
                r#"
                INSERT INTO code_examples (id, source_id, url, code_block, summary,
                                           embedding, knowledge_type, tags, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&example.id)
            .bind(&example.source_id)
            .bind(&example.url)
            .bind(&example.code_block)
            .bind(&example.summary)
            .bind(&blob)
            .bind(&example.knowledge_type)
            .bind(to_json(&example.tags))
            .bind(example.created_at)
            .execute(&mut *tx)
            .await?;

            // Summary first so short descriptive terms rank well.
            let fts_content = format!("{}\n{}", example.summary, example.code_block);
            sqlx::query(
                "INSERT INTO code_examples_fts (example_id, source_id, content) VALUES (?, ?, ?)",
            )
            .bind(&example.id)
            .bind(&example.source_id)
            .bind(&fts_content)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_by_source(&self, source_id: &str, table: Table) -> Result<u64> {
        let (fts_sql, base_sql) = match table {
            Table::Chunks => (
                "DELETE FROM chunks_fts WHERE source_id = ?",
                "DELETE FROM chunks WHERE source_id = ?",
            ),
            Table::CodeExamples => (
                "DELETE FROM code_examples_fts WHERE source_id = ?",
                "DELETE FROM code_examples WHERE source_id = ?",
            ),
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(fts_sql)
            .bind(source_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query(base_sql)
            .bind(source_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(result.rows_affected())
    }

    async fn select_hashes_by_source(&self, source_id: &str) -> Result<HashSet<String>> {
        let rows = sqlx::query("SELECT content_hash FROM chunks WHERE source_id = ?")
            .bind(source_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(|row| row.get("content_hash")).collect())
    }

    async fn similarity_search(
        &self,
        table: Table,
        embedding: &[f32],
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<MatchRow>> {
        let mut sql = match table {
            Table::Chunks => {
                "SELECT id, source_id, url, content, embedding, knowledge_type, tags FROM chunks"
                    .to_string()
            }
            Table::CodeExamples => {
                "SELECT id, source_id, url, code_block AS content, embedding, knowledge_type, tags \
                 FROM code_examples"
                    .to_string()
            }
        };
        let mut clauses: Vec<&str> = Vec::new();
        if filter.source_id.is_some() {
            clauses.push("source_id = ?");
        }
        if filter.knowledge_type.is_some() {
            clauses.push("knowledge_type = ?");
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }

        let mut query = sqlx::query(&sql);
        if let Some(source_id) = &filter.source_id {
            query = query.bind(source_id);
        }
        if let Some(knowledge_type) = &filter.knowledge_type {
            query = query.bind(knowledge_type);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut matches: Vec<MatchRow> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let stored = blob_to_vec(&blob);
                let tags: String = row.get("tags");
                MatchRow {
                    id: row.get("id"),
                    source_id: row.get("source_id"),
                    url: row.get("url"),
                    content: row.get("content"),
                    knowledge_type: row.get("knowledge_type"),
                    tags: from_json(&tags),
                    raw_score: cosine_similarity(embedding, &stored),
                }
            })
            .collect();

        matches.sort_by(|a, b| {
            b.raw_score
                .partial_cmp(&a.raw_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(limit);

        Ok(matches)
    }

    async fn keyword_search(
        &self,
        table: Table,
        query: &str,
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<MatchRow>> {
        let expr = match fts_match_expr(query) {
            Some(expr) => expr,
            None => return Ok(Vec::new()),
        };

        let mut sql = match table {
            Table::Chunks => {
                "SELECT b.id, b.source_id, b.url, b.content, b.knowledge_type, b.tags, \
                        chunks_fts.rank AS rank \
                 FROM chunks_fts \
                 JOIN chunks b ON b.id = chunks_fts.chunk_id \
                 WHERE chunks_fts MATCH ?"
                    .to_string()
            }
            Table::CodeExamples => {
                "SELECT b.id, b.source_id, b.url, b.code_block AS content, b.knowledge_type, \
                        b.tags, code_examples_fts.rank AS rank \
                 FROM code_examples_fts \
                 JOIN code_examples b ON b.id = code_examples_fts.example_id \
                 WHERE code_examples_fts MATCH ?"
                    .to_string()
            }
        };
        if filter.source_id.is_some() {
            sql.push_str(" AND b.source_id = ?");
        }
        if filter.knowledge_type.is_some() {
            sql.push_str(" AND b.knowledge_type = ?");
        }
        sql.push_str(" ORDER BY rank LIMIT ?");

        let mut fts_query = sqlx::query(&sql).bind(&expr);
        if let Some(source_id) = &filter.source_id {
            fts_query = fts_query.bind(source_id);
        }
        if let Some(knowledge_type) = &filter.knowledge_type {
            fts_query = fts_query.bind(knowledge_type);
        }
        let rows = fts_query.bind(limit as i64).fetch_all(&self.pool).await?;

        Ok(rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                let tags: String = row.get("tags");
                MatchRow {
                    id: row.get("id"),
                    source_id: row.get("source_id"),
                    url: row.get("url"),
                    content: row.get("content"),
                    knowledge_type: row.get("knowledge_type"),
                    tags: from_json(&tags),
                    raw_score: (-rank) as f32,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ChunkingConfig, Config, CrawlConfig, DbConfig, EmbeddingConfig, FeatureFlags,
        RerankerConfig, SearchConfig,
    };
    use crate::migrate::run_migrations;
    use tempfile::TempDir;

    fn config_for(path: &std::path::Path) -> Config {
        Config {
            db: DbConfig {
                path: path.to_path_buf(),
            },
            crawl: CrawlConfig::default(),
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            reranker: RerankerConfig::default(),
            search: SearchConfig::default(),
            flags: FeatureFlags::default(),
        }
    }

    async fn open_store(dir: &TempDir) -> SqliteStore {
        let config = config_for(&dir.path().join("quarry.db"));
        run_migrations(&config).await.unwrap();
        let pool = crate::db::connect(&config).await.unwrap();
        SqliteStore::new(pool)
    }

    fn sample_source(id: &str) -> Source {
        Source {
            id: id.to_string(),
            title: format!("{id} title"),
            summary: String::new(),
            origin_type: OriginType::Url,
            crawl_status: CrawlStatus::Pending,
            knowledge_type: Some("technical".to_string()),
            tags: vec!["rust".to_string()],
            word_count: 0,
            created_at: 100,
            updated_at: 100,
        }
    }

    fn sample_chunk(id: &str, source_id: &str, content: &str, embedding: Vec<f32>) -> Chunk {
        Chunk {
            id: id.to_string(),
            source_id: source_id.to_string(),
            url: format!("{source_id}/page"),
            content: content.to_string(),
            embedding,
            content_hash: format!("hash-{id}"),
            headers: vec!["Intro".to_string()],
            knowledge_type: Some("technical".to_string()),
            tags: vec!["rust".to_string()],
            char_count: content.len() as i64,
            word_count: content.split_whitespace().count() as i64,
            created_at: 100,
        }
    }

    #[test]
    fn test_match_expr_quotes_and_joins_terms() {
        assert_eq!(
            fts_match_expr("async runtime"),
            Some("\"async\" OR \"runtime\"".to_string())
        );
    }

    #[test]
    fn test_match_expr_strips_punctuation() {
        assert_eq!(
            fts_match_expr("tokio::spawn(task)"),
            Some("\"tokio\" OR \"spawn\" OR \"task\"".to_string())
        );
    }

    #[test]
    fn test_match_expr_empty_when_no_terms() {
        assert_eq!(fts_match_expr(""), None);
        assert_eq!(fts_match_expr("?! ,,"), None);
    }

    #[tokio::test]
    async fn test_source_upsert_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let mut source = sample_source("https://example.com");
        store.upsert_source(&source).await.unwrap();

        let loaded = store.get_source(&source.id).await.unwrap().unwrap();
        assert_eq!(loaded.title, source.title);
        assert_eq!(loaded.crawl_status, CrawlStatus::Pending);
        assert_eq!(loaded.tags, vec!["rust".to_string()]);

        source.crawl_status = CrawlStatus::Completed;
        source.word_count = 42;
        source.created_at = 999;
        source.updated_at = 200;
        store.upsert_source(&source).await.unwrap();

        let updated = store.get_source(&source.id).await.unwrap().unwrap();
        assert_eq!(updated.crawl_status, CrawlStatus::Completed);
        assert_eq!(updated.word_count, 42);
        assert_eq!(updated.updated_at, 200);
        // The original insertion time survives the upsert.
        assert_eq!(updated.created_at, 100);
    }

    #[tokio::test]
    async fn test_list_sources_ordered_by_creation() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let mut newer = sample_source("https://b.example.com");
        newer.created_at = 300;
        let older = sample_source("https://a.example.com");
        store.upsert_source(&newer).await.unwrap();
        store.upsert_source(&older).await.unwrap();

        let listed = store.list_sources().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, "https://a.example.com");
        assert_eq!(listed[1].id, "https://b.example.com");
    }

    #[tokio::test]
    async fn test_chunks_feed_hashes_and_keyword_search() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        store
            .upsert_source(&sample_source("https://example.com"))
            .await
            .unwrap();

        let chunks = vec![
            sample_chunk(
                "c1",
                "https://example.com",
                "the borrow checker enforces aliasing rules",
                vec![1.0, 0.0],
            ),
            sample_chunk(
                "c2",
                "https://example.com",
                "async executors poll futures to completion",
                vec![0.0, 1.0],
            ),
        ];
        store.insert_chunks(&chunks).await.unwrap();

        let hashes = store
            .select_hashes_by_source("https://example.com")
            .await
            .unwrap();
        assert!(hashes.contains("hash-c1"));
        assert!(hashes.contains("hash-c2"));

        let hits = store
            .keyword_search(Table::Chunks, "borrow checker", &SearchFilter::default(), 10)
            .await
            .unwrap();
        assert_eq!(hits[0].id, "c1");
        assert_eq!(hits[0].url, "https://example.com/page");
        assert_eq!(hits[0].tags, vec!["rust".to_string()]);
        assert!(hits[0].raw_score > 0.0);
    }

    #[tokio::test]
    async fn test_keyword_search_survives_punctuation() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        store
            .upsert_source(&sample_source("https://example.com"))
            .await
            .unwrap();
        store
            .insert_chunks(&[sample_chunk(
                "c1",
                "https://example.com",
                "spawn a task on the runtime",
                vec![1.0],
            )])
            .await
            .unwrap();

        let hits = store
            .keyword_search(
                Table::Chunks,
                "runtime::spawn(\"task\")?",
                &SearchFilter::default(),
                10,
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "c1");

        let none = store
            .keyword_search(Table::Chunks, "::(!)", &SearchFilter::default(), 10)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_similarity_search_orders_and_filters() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        store
            .upsert_source(&sample_source("https://a.example.com"))
            .await
            .unwrap();
        store
            .upsert_source(&sample_source("https://b.example.com"))
            .await
            .unwrap();

        store
            .insert_chunks(&[
                sample_chunk("close", "https://a.example.com", "close", vec![1.0, 0.1]),
                sample_chunk("far", "https://a.example.com", "far", vec![0.0, 1.0]),
                sample_chunk("other", "https://b.example.com", "other", vec![1.0, 0.0]),
            ])
            .await
            .unwrap();

        let all = store
            .similarity_search(Table::Chunks, &[1.0, 0.0], &SearchFilter::default(), 2)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, "other");
        assert_eq!(all[1].id, "close");

        let scoped = store
            .similarity_search(
                Table::Chunks,
                &[1.0, 0.0],
                &SearchFilter::by_source("https://a.example.com"),
                10,
            )
            .await
            .unwrap();
        assert_eq!(scoped.len(), 2);
        assert_eq!(scoped[0].id, "close");
    }

    #[tokio::test]
    async fn test_delete_by_source_scrubs_fts() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        store
            .upsert_source(&sample_source("https://a.example.com"))
            .await
            .unwrap();
        store
            .upsert_source(&sample_source("https://b.example.com"))
            .await
            .unwrap();

        store
            .insert_chunks(&[
                sample_chunk("a1", "https://a.example.com", "shared phrase", vec![1.0]),
                sample_chunk("a2", "https://a.example.com", "shared phrase twice", vec![1.0]),
                sample_chunk("b1", "https://b.example.com", "shared phrase", vec![1.0]),
            ])
            .await
            .unwrap();

        let removed = store
            .delete_by_source("https://a.example.com", Table::Chunks)
            .await
            .unwrap();
        assert_eq!(removed, 2);

        let hits = store
            .keyword_search(Table::Chunks, "shared phrase", &SearchFilter::default(), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "b1");
    }

    #[tokio::test]
    async fn test_code_examples_live_in_their_own_space() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        store
            .upsert_source(&sample_source("https://example.com"))
            .await
            .unwrap();

        let example = CodeExample {
            id: "e1".to_string(),
            source_id: "https://example.com".to_string(),
            url: "https://example.com/page".to_string(),
            code_block: "fn main() { println!(\"hi\"); }".to_string(),
            summary: "rust example: printing a greeting".to_string(),
            embedding: vec![1.0, 0.0],
            knowledge_type: None,
            tags: Vec::new(),
            created_at: 100,
        };
        store.insert_code_examples(&[example]).await.unwrap();

        let by_summary = store
            .keyword_search(
                Table::CodeExamples,
                "greeting",
                &SearchFilter::default(),
                10,
            )
            .await
            .unwrap();
        assert_eq!(by_summary.len(), 1);
        assert_eq!(by_summary[0].id, "e1");
        assert!(by_summary[0].content.contains("fn main"));

        let in_chunks = store
            .keyword_search(Table::Chunks, "greeting", &SearchFilter::default(), 10)
            .await
            .unwrap();
        assert!(in_chunks.is_empty());

        let removed = store
            .delete_by_source("https://example.com", Table::CodeExamples)
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }
}
