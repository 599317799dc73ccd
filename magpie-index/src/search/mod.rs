//! Hybrid retrieval: BM25 + vector similarity fused by reciprocal rank.
//!
//! A query runs both subsystems — keyword scoring over chunk text and
//! nearest-neighbour search over chunk embeddings — and fuses the two
//! ranked lists with RRF. Neither subsystem's raw scores are compared to
//! the other's; only rank positions matter, which keeps the combination
//! deterministic and robust to either side returning nothing.

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

pub mod fusion;
pub mod lexical;
pub mod vector;

pub use fusion::{FusedHit, RRF_CONSTANT, reciprocal_rank_fusion};
pub use lexical::{Bm25Index, LexicalIndex};
pub use vector::{SqliteVectorIndex, VectorIndex};

use crate::embed::EmbeddingProvider;
use crate::store::JobStore;

/// One ranked query result, resolved back to chunk content and provenance.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    /// Opaque chunk identifier (`<hash-prefix>:<seq>`).
    pub chunk_id: String,
    pub document_path: String,
    pub kb_code: String,
    pub seq: i64,
    pub content: String,
    pub section: Option<String>,
    pub page_start: Option<i64>,
    pub page_end: Option<i64>,
    /// Fused RRF score.
    pub score: f64,
}

/// Fuses lexical and vector rankings over committed chunk data.
#[derive(Clone)]
pub struct HybridRetriever {
    store: JobStore,
    lexical: Arc<dyn LexicalIndex>,
    vector: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    overfetch_factor: usize,
    rrf_constant: u32,
}

impl HybridRetriever {
    pub fn new(
        store: JobStore,
        lexical: Arc<dyn LexicalIndex>,
        vector: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        overfetch_factor: usize,
        rrf_constant: u32,
    ) -> Self {
        Self {
            store,
            lexical,
            vector,
            embedder,
            overfetch_factor: overfetch_factor.max(1),
            rrf_constant,
        }
    }

    /// Run a hybrid query, returning at most `k` hits.
    ///
    /// Queries are read-only against committed chunk data. A chunk that
    /// disappears between ranking and resolution (concurrent re-processing)
    /// is silently skipped — the delete-then-write replacement policy means
    /// stale ids resolve to nothing rather than to mixed content.
    pub async fn query(
        &self,
        text: &str,
        k: usize,
        kb_code: Option<&str>,
    ) -> Result<Vec<SearchHit>> {
        if k == 0 || text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let fetch_n = k.saturating_mul(self.overfetch_factor);

        let lexical_ranks = self.lexical.query(text, fetch_n, kb_code);

        // Vector search degrades to nothing when the query cannot be
        // embedded; the lexical ranking then dominates the fusion.
        let vector_ranks = match self.embedder.embed_texts(&[text.to_string()]).await {
            Ok(mut embeddings) if !embeddings.is_empty() => {
                let query_vector = embeddings.remove(0);
                match self.vector.query(&query_vector, fetch_n, kb_code).await {
                    Ok(ranks) => ranks,
                    Err(e) => {
                        warn!("vector search failed, falling back to lexical only: {e}");
                        Vec::new()
                    }
                }
            }
            Ok(_) => Vec::new(),
            Err(e) => {
                debug!("query embedding unavailable: {e}");
                Vec::new()
            }
        };

        let fused = reciprocal_rank_fusion(&[&lexical_ranks, &vector_ranks], self.rrf_constant);

        let mut hits = Vec::with_capacity(k);
        for candidate in fused {
            if hits.len() >= k {
                break;
            }
            let Some(chunk) = self.store.get_chunk(candidate.chunk_id).await? else {
                continue;
            };
            let document_path = self
                .store
                .get_document_by_id(chunk.document_id)
                .await?
                .map(|d| d.path)
                .unwrap_or_default();
            hits.push(SearchHit {
                chunk_id: chunk.external_id(),
                document_path,
                kb_code: chunk.kb_code.clone(),
                seq: chunk.seq,
                content: chunk.content.clone(),
                section: chunk.section.clone(),
                page_start: chunk.page_start,
                page_end: chunk.page_end,
                score: candidate.score,
            });
        }

        debug!(
            query = text,
            k,
            lexical = lexical_ranks.len(),
            vector = vector_ranks.len(),
            returned = hits.len(),
            "hybrid query"
        );
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::NoEmbeddingProvider;
    use crate::store::{ChunkRecord, NewDocument};

    async fn seeded_retriever() -> Result<(HybridRetriever, JobStore)> {
        let store = JobStore::open_memory().await?;
        let doc = store
            .upsert_document(&NewDocument {
                path: "docs/strategy.md".to_string(),
                kb_code: "kb1".to_string(),
                name: "strategy.md".to_string(),
                extension: "md".to_string(),
                size: 64,
                content_hash: [9; 32],
                modified_at: 100,
            })
            .await?;

        let chunks: Vec<ChunkRecord> = [
            "the sales strategy for next quarter",
            "engineering roadmap and hiring plan",
            "sales figures and revenue strategy detail",
        ]
        .iter()
        .enumerate()
        .map(|(i, text)| ChunkRecord {
            id: None,
            document_id: doc.id,
            seq: i as i64,
            content: text.to_string(),
            page_start: None,
            page_end: None,
            section: None,
            kb_code: "kb1".to_string(),
            doc_hash: [9; 32],
            embedding: None,
            vector_ref: None,
        })
        .collect();
        let ids = store.insert_chunks(&chunks).await?;

        let lexical = Arc::new(Bm25Index::new());
        for (id, chunk) in ids.iter().zip(&chunks) {
            lexical.index(*id, "kb1", &chunk.content);
        }
        let vector = Arc::new(SqliteVectorIndex::new(store.pool().clone()).await?);

        let retriever = HybridRetriever::new(
            store.clone(),
            lexical,
            vector,
            Arc::new(NoEmbeddingProvider),
            4,
            60,
        );
        Ok((retriever, store))
    }

    #[tokio::test]
    async fn lexical_only_query_returns_ranked_hits() -> Result<()> {
        let (retriever, _store) = seeded_retriever().await?;
        let hits = retriever.query("sales strategy", 2, Some("kb1")).await?;

        assert!(!hits.is_empty());
        assert!(hits.len() <= 2);
        assert!(hits[0].content.contains("sales"));
        assert!(hits[0].chunk_id.contains(':'));
        Ok(())
    }

    #[tokio::test]
    async fn empty_query_returns_nothing() -> Result<()> {
        let (retriever, _store) = seeded_retriever().await?;
        assert!(retriever.query("", 5, None).await?.is_empty());
        assert!(retriever.query("sales", 0, None).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn out_of_scope_queries_miss() -> Result<()> {
        let (retriever, _store) = seeded_retriever().await?;
        let hits = retriever.query("sales strategy", 5, Some("kb2")).await?;
        assert!(hits.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn deleted_chunks_drop_out_of_results() -> Result<()> {
        let (retriever, store) = seeded_retriever().await?;
        let doc = store.get_document("docs/strategy.md", "kb1").await?.unwrap();

        // Simulate the delete phase of re-processing: store rows gone,
        // lexical entries still present until the pipeline removes them.
        store.delete_document_chunks(doc.id).await?;
        let hits = retriever.query("sales strategy", 5, Some("kb1")).await?;
        assert!(hits.is_empty());
        Ok(())
    }
}
