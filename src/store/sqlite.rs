//! SQLite-backed store implementations.
//!
//! The built-in persistent backends for single-node deployments:
//! - [`SqliteVectorStore`] — embedding BLOBs with brute-force cosine search.
//!   The index dimension is persisted in a meta row so a restart with a
//!   different embedding model is caught at startup, not mid-ingestion.
//! - [`SqliteLexicalStore`] — FTS5 virtual table with BM25 ranking,
//!   min-max normalized per result batch.
//!
//! Schema creation is idempotent; both stores share one pool per database
//! file (WAL mode).

use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::EngineError;

use super::{
    normalize_min_max, LexicalHit, LexicalItem, LexicalStore, VectorHit, VectorItem, VectorStore,
};

fn store_err(e: sqlx::Error) -> EngineError {
    match e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => EngineError::store_transient(e.to_string()),
        other => EngineError::store_permanent(other.to_string()),
    }
}

fn metadata_to_json(metadata: &BTreeMap<String, String>) -> String {
    serde_json::to_string(metadata).unwrap_or_else(|_| "{}".to_string())
}

fn metadata_from_json(raw: &str) -> BTreeMap<String, String> {
    serde_json::from_str(raw).unwrap_or_default()
}

// ═══════════════════════════════════════════════════════════════════════
// Vector store
// ═══════════════════════════════════════════════════════════════════════

/// SQLite vector index: one BLOB row per chunk, cosine scan on search.
pub struct SqliteVectorStore {
    pool: SqlitePool,
    dimension: usize,
}

impl SqliteVectorStore {
    /// Open (and migrate) the vector tables.
    ///
    /// If the index already holds vectors of a different dimension than
    /// `configured_dim`, the persisted dimension wins — the factory compares
    /// it against the embedder and aborts with `DimensionMismatch`.
    pub async fn open(pool: SqlitePool, configured_dim: usize) -> Result<Self, EngineError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vector_meta (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                dimension INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vector_items (
                id TEXT PRIMARY KEY,
                embedding BLOB NOT NULL,
                metadata_json TEXT NOT NULL DEFAULT '{}'
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(store_err)?;

        let persisted: Option<i64> = sqlx::query_scalar("SELECT dimension FROM vector_meta WHERE id = 1")
            .fetch_optional(&pool)
            .await
            .map_err(store_err)?;

        let dimension = match persisted {
            Some(dim) => dim as usize,
            None => {
                sqlx::query("INSERT INTO vector_meta (id, dimension) VALUES (1, ?)")
                    .bind(configured_dim as i64)
                    .execute(&pool)
                    .await
                    .map_err(store_err)?;
                configured_dim
            }
        };

        Ok(Self { pool, dimension })
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert(&self, items: &[VectorItem]) -> Result<(), EngineError> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        for item in items {
            if item.vector.len() != self.dimension {
                return Err(EngineError::store_permanent(format!(
                    "vector for '{}' has dimension {}, index expects {}",
                    item.id,
                    item.vector.len(),
                    self.dimension
                )));
            }
            sqlx::query(
                r#"
                INSERT INTO vector_items (id, embedding, metadata_json) VALUES (?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    embedding = excluded.embedding,
                    metadata_json = excluded.metadata_json
                "#,
            )
            .bind(&item.id)
            .bind(vec_to_blob(&item.vector))
            .bind(metadata_to_json(&item.metadata))
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        }
        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    async fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<VectorHit>, EngineError> {
        let rows = sqlx::query("SELECT id, embedding, metadata_json FROM vector_items")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;

        let mut hits: Vec<VectorHit> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vector = blob_to_vec(&blob);
                let metadata: String = row.get("metadata_json");
                VectorHit {
                    id: row.get("id"),
                    score: f64::from(cosine_similarity(query, &vector) + 1.0) / 2.0,
                    metadata: metadata_from_json(&metadata),
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn delete(&self, ids: &[String]) -> Result<(), EngineError> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        for id in ids {
            sqlx::query("DELETE FROM vector_items WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(store_err)?;
        }
        tx.commit().await.map_err(store_err)?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Lexical store
// ═══════════════════════════════════════════════════════════════════════

/// SQLite FTS5 keyword index with BM25 ranking.
pub struct SqliteLexicalStore {
    pool: SqlitePool,
}

impl SqliteLexicalStore {
    /// Open (and migrate) the lexical tables.
    pub async fn open(pool: SqlitePool) -> Result<Self, EngineError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS lexical_items (
                id TEXT PRIMARY KEY,
                doc_id TEXT NOT NULL DEFAULT '',
                text TEXT NOT NULL,
                metadata_json TEXT NOT NULL DEFAULT '{}'
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(store_err)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_lexical_items_doc_id ON lexical_items(doc_id)")
            .execute(&pool)
            .await
            .map_err(store_err)?;

        // FTS5 virtual tables cannot be created with IF NOT EXISTS portably;
        // probe sqlite_master first.
        let fts_exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='lexical_fts'",
        )
        .fetch_one(&pool)
        .await
        .map_err(store_err)?;

        if !fts_exists {
            sqlx::query("CREATE VIRTUAL TABLE lexical_fts USING fts5(id UNINDEXED, text)")
                .execute(&pool)
                .await
                .map_err(store_err)?;
        }

        Ok(Self { pool })
    }
}

/// Quote query terms and join with OR so natural-language questions match
/// without FTS5 syntax errors.
fn fts_query(query: &str) -> String {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect::<Vec<_>>()
        .join(" OR ")
}

#[async_trait]
impl LexicalStore for SqliteLexicalStore {
    async fn upsert(&self, items: &[LexicalItem]) -> Result<(), EngineError> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        for item in items {
            let doc_id = item.metadata.get("doc_id").cloned().unwrap_or_default();
            sqlx::query(
                r#"
                INSERT INTO lexical_items (id, doc_id, text, metadata_json) VALUES (?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    doc_id = excluded.doc_id,
                    text = excluded.text,
                    metadata_json = excluded.metadata_json
                "#,
            )
            .bind(&item.id)
            .bind(&doc_id)
            .bind(&item.text)
            .bind(metadata_to_json(&item.metadata))
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;

            sqlx::query("DELETE FROM lexical_fts WHERE id = ?")
                .bind(&item.id)
                .execute(&mut *tx)
                .await
                .map_err(store_err)?;
            sqlx::query("INSERT INTO lexical_fts (id, text) VALUES (?, ?)")
                .bind(&item.id)
                .bind(&item.text)
                .execute(&mut *tx)
                .await
                .map_err(store_err)?;
        }
        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<LexicalHit>, EngineError> {
        let match_expr = fts_query(query);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT f.id AS id, f.rank AS rank, i.text AS text, i.metadata_json AS metadata_json
            FROM lexical_fts f
            JOIN lexical_items i ON i.id = f.id
            WHERE lexical_fts MATCH ?
            ORDER BY rank
            LIMIT ?
            "#,
        )
        .bind(&match_expr)
        .bind(top_k as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        // FTS5 rank is negative BM25 (lower = better); negate to positive.
        let raw: Vec<f64> = rows.iter().map(|r| -r.get::<f64, _>("rank")).collect();
        let normalized = normalize_min_max(&raw);

        let mut hits: Vec<LexicalHit> = rows
            .iter()
            .zip(normalized)
            .filter(|(_, norm)| *norm > 0.0)
            .map(|(row, norm)| {
                let metadata: String = row.get("metadata_json");
                LexicalHit {
                    id: row.get("id"),
                    score: norm,
                    text: row.get("text"),
                    metadata: metadata_from_json(&metadata),
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(hits)
    }

    async fn fetch(&self, ids: &[String]) -> Result<Vec<LexicalHit>, EngineError> {
        let mut hits = Vec::with_capacity(ids.len());
        for id in ids {
            let row = sqlx::query("SELECT text, metadata_json FROM lexical_items WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(store_err)?;
            if let Some(row) = row {
                let metadata: String = row.get("metadata_json");
                hits.push(LexicalHit {
                    id: id.clone(),
                    score: 0.0,
                    text: row.get("text"),
                    metadata: metadata_from_json(&metadata),
                });
            }
        }
        Ok(hits)
    }

    async fn ids_for_doc(&self, doc_id: &str) -> Result<Vec<String>, EngineError> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM lexical_items WHERE doc_id = ? ORDER BY id")
                .bind(doc_id)
                .fetch_all(&self.pool)
                .await
                .map_err(store_err)?;
        Ok(ids)
    }

    async fn delete(&self, ids: &[String]) -> Result<(), EngineError> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        for id in ids {
            sqlx::query("DELETE FROM lexical_items WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(store_err)?;
            sqlx::query("DELETE FROM lexical_fts WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(store_err)?;
        }
        tx.commit().await.map_err(store_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn memory_pool() -> SqlitePool {
        db::connect_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn vector_dimension_is_persisted() {
        let pool = memory_pool().await;
        let store = SqliteVectorStore::open(pool.clone(), 384).await.unwrap();
        assert_eq!(store.dimension(), 384);

        // Re-opening with a different configured dimension keeps the
        // persisted one; the factory turns that into DimensionMismatch.
        let reopened = SqliteVectorStore::open(pool, 1536).await.unwrap();
        assert_eq!(reopened.dimension(), 384);
    }

    #[tokio::test]
    async fn vector_roundtrip_and_delete() {
        let pool = memory_pool().await;
        let store = SqliteVectorStore::open(pool, 2).await.unwrap();
        store
            .upsert(&[VectorItem {
                id: "c1".to_string(),
                vector: vec![1.0, 0.0],
                metadata: BTreeMap::new(),
            }])
            .await
            .unwrap();

        let hits = store.search(&[1.0, 0.0], 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 1.0).abs() < 1e-6);

        store.delete(&["c1".to_string()]).await.unwrap();
        assert!(store.search(&[1.0, 0.0], 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lexical_search_normalizes_and_fetches() {
        let pool = memory_pool().await;
        let store = SqliteLexicalStore::open(pool).await.unwrap();

        let mut meta = BTreeMap::new();
        meta.insert("doc_id".to_string(), "d1".to_string());
        store
            .upsert(&[
                LexicalItem {
                    id: "c1".to_string(),
                    text: "Perseverance was built by NASA engineers.".to_string(),
                    metadata: meta.clone(),
                },
                LexicalItem {
                    id: "c2".to_string(),
                    text: "A pastry recipe with butter.".to_string(),
                    metadata: meta,
                },
            ])
            .await
            .unwrap();

        let hits = store.search("who built Perseverance", 10).await.unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].id, "c1");
        assert!(hits.iter().all(|h| h.score > 0.0 && h.score <= 1.0));

        let fetched = store.fetch(&["c2".to_string()]).await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert!(fetched[0].text.contains("pastry"));

        assert_eq!(
            store.ids_for_doc("d1").await.unwrap(),
            vec!["c1".to_string(), "c2".to_string()]
        );
    }

    #[test]
    fn fts_query_quotes_terms_and_strips_punctuation() {
        let q = fts_query("who built \"Perseverance\"?");
        assert_eq!(q, "\"who\" OR \"built\" OR \"Perseverance\"");
        assert_eq!(fts_query("  ?! "), "");
    }
}
