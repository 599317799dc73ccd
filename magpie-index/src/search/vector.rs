//! Vector similarity index.
//!
//! The contract is upsert / query / delete over (chunk id, vector) pairs.
//! The bundled implementation keeps vectors in their own SQLite table and
//! scans with cosine similarity in process — adequate for enterprise
//! document sets, and swappable for a dedicated vector database behind the
//! same trait without touching the retriever.

use anyhow::Result;
use async_trait::async_trait;
use half::f16;
use sqlx::{Row, SqlitePool};

/// Vector index contract.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, chunk_id: i64, vector: &[f16], kb_code: &str) -> Result<()>;
    /// Ranked (chunk id, similarity), best first. `kb_code = None` searches
    /// every base.
    async fn query(&self, vector: &[f16], k: usize, kb_code: Option<&str>)
    -> Result<Vec<(i64, f32)>>;
    async fn delete(&self, chunk_id: i64) -> Result<()>;
}

/// Cosine-scan implementation over a SQLite table.
#[derive(Clone, Debug)]
pub struct SqliteVectorIndex {
    pool: SqlitePool,
}

impl SqliteVectorIndex {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vectors (
                chunk_id INTEGER PRIMARY KEY,
                kb_code TEXT NOT NULL,
                embedding BLOB NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_vectors_kb ON vectors(kb_code)")
            .execute(&pool)
            .await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn upsert(&self, chunk_id: i64, vector: &[f16], kb_code: &str) -> Result<()> {
        let bytes = bytemuck::cast_slice::<f16, u8>(vector);
        sqlx::query(
            "INSERT INTO vectors (chunk_id, kb_code, embedding) VALUES (?1, ?2, ?3)
             ON CONFLICT(chunk_id) DO UPDATE SET kb_code = excluded.kb_code,
                                                 embedding = excluded.embedding",
        )
        .bind(chunk_id)
        .bind(kb_code)
        .bind(bytes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f16],
        k: usize,
        kb_code: Option<&str>,
    ) -> Result<Vec<(i64, f32)>> {
        if vector.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let rows = match kb_code {
            Some(kb) => {
                sqlx::query("SELECT chunk_id, embedding FROM vectors WHERE kb_code = ?1")
                    .bind(kb)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT chunk_id, embedding FROM vectors")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut scored: Vec<(i64, f32)> = Vec::with_capacity(rows.len());
        for row in rows {
            let chunk_id: i64 = row.get("chunk_id");
            let bytes: Vec<u8> = row.get("embedding");
            let stored = bytemuck::cast_slice::<u8, f16>(&bytes);
            let similarity = cosine_similarity(vector, stored);
            scored.push((chunk_id, similarity));
        }

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn delete(&self, chunk_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM vectors WHERE chunk_id = ?1")
            .bind(chunk_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Cosine similarity between two f16 vectors. Mismatched or zero-norm
/// inputs score 0.
fn cosine_similarity(a: &[f16], b: &[f16]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| f32::from(*x) * f32::from(*y))
        .sum();
    let norm_a: f32 = a.iter().map(|x| f32::from(*x).powi(2)).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| f32::from(*x).powi(2)).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(values: &[f32]) -> Vec<f16> {
        values.iter().map(|x| f16::from_f32(*x)).collect()
    }

    async fn memory_index() -> SqliteVectorIndex {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(sqlx::sqlite::SqliteConnectOptions::new().in_memory(true))
            .await
            .unwrap();
        SqliteVectorIndex::new(pool).await.unwrap()
    }

    #[test]
    fn cosine_basics() {
        let a = v(&[1.0, 0.0]);
        let b = v(&[1.0, 0.0]);
        let c = v(&[0.0, 1.0]);
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-3);
        assert!(cosine_similarity(&a, &c).abs() < 1e-3);
        assert_eq!(cosine_similarity(&a, &v(&[1.0])), 0.0);
        assert_eq!(cosine_similarity(&a, &v(&[0.0, 0.0])), 0.0);
    }

    #[tokio::test]
    async fn nearest_neighbours_rank_by_similarity() -> Result<()> {
        let index = memory_index().await;
        index.upsert(1, &v(&[1.0, 0.0, 0.0]), "kb1").await?;
        index.upsert(2, &v(&[0.9, 0.1, 0.0]), "kb1").await?;
        index.upsert(3, &v(&[0.0, 0.0, 1.0]), "kb1").await?;

        let results = index.query(&v(&[1.0, 0.0, 0.0]), 2, Some("kb1")).await?;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, 1);
        assert_eq!(results[1].0, 2);
        Ok(())
    }

    #[tokio::test]
    async fn scope_filters_by_knowledge_base() -> Result<()> {
        let index = memory_index().await;
        index.upsert(1, &v(&[1.0, 0.0]), "kb1").await?;
        index.upsert(2, &v(&[1.0, 0.0]), "kb2").await?;

        let kb1 = index.query(&v(&[1.0, 0.0]), 10, Some("kb1")).await?;
        assert_eq!(kb1.len(), 1);
        assert_eq!(kb1[0].0, 1);

        let all = index.query(&v(&[1.0, 0.0]), 10, None).await?;
        assert_eq!(all.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn delete_and_reupsert() -> Result<()> {
        let index = memory_index().await;
        index.upsert(1, &v(&[1.0, 0.0]), "kb1").await?;
        index.delete(1).await?;
        assert!(
            index
                .query(&v(&[1.0, 0.0]), 10, Some("kb1"))
                .await?
                .is_empty()
        );

        // Upsert replaces in place.
        index.upsert(2, &v(&[1.0, 0.0]), "kb1").await?;
        index.upsert(2, &v(&[0.0, 1.0]), "kb1").await?;
        let results = index.query(&v(&[0.0, 1.0]), 1, Some("kb1")).await?;
        assert_eq!(results[0].0, 2);
        assert!(results[0].1 > 0.9);
        Ok(())
    }
}
