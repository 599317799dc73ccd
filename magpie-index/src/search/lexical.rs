//! BM25 lexical index.
//!
//! Keyword scoring wraps the `bm25` crate. One search engine is kept per
//! knowledge base so scoped queries never leak across bases; an unscoped
//! query merges the per-base results by score. The index lives in memory
//! and is rebuilt from the chunk store on startup — chunk text in the store
//! is the durable copy.

use bm25::{Document, Language, SearchEngine, SearchEngineBuilder};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

use crate::store::JobStore;

/// Lexical index contract: index, query, delete.
pub trait LexicalIndex: Send + Sync {
    fn index(&self, chunk_id: i64, kb_code: &str, text: &str);
    /// Ranked (chunk id, BM25 score), best first. `kb_code = None` searches
    /// every base.
    fn query(&self, text: &str, k: usize, kb_code: Option<&str>) -> Vec<(i64, f32)>;
    fn delete(&self, chunk_id: i64);
}

#[derive(Default)]
struct Bm25State {
    engines: HashMap<String, SearchEngine<u64>>,
    /// chunk id → owning kb, so deletes can find the right engine.
    owners: HashMap<u64, String>,
}

/// In-memory BM25 implementation of [`LexicalIndex`].
pub struct Bm25Index {
    state: Mutex<Bm25State>,
}

impl Bm25Index {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Bm25State::default()),
        }
    }

    /// Re-index every stored chunk. Returns the number indexed.
    pub async fn rebuild_from_store(&self, store: &JobStore) -> anyhow::Result<usize> {
        let chunks = store.all_chunks(None).await?;
        let mut count = 0;
        for chunk in &chunks {
            if let Some(id) = chunk.id {
                self.index(id, &chunk.kb_code, &chunk.content);
                count += 1;
            }
        }
        debug!(count, "lexical index rebuilt from store");
        Ok(count)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Bm25State> {
        // Lock poisoning only happens after a panic in another holder;
        // the index data is still structurally sound, so recover it.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for Bm25Index {
    fn default() -> Self {
        Self::new()
    }
}

impl LexicalIndex for Bm25Index {
    fn index(&self, chunk_id: i64, kb_code: &str, text: &str) {
        let mut state = self.lock();
        let engine = state.engines.entry(kb_code.to_string()).or_insert_with(|| {
            let empty: Vec<Document<u64>> = Vec::new();
            SearchEngineBuilder::<u64>::with_documents(Language::English, empty).build()
        });
        engine.upsert(Document {
            id: chunk_id as u64,
            contents: text.to_string(),
        });
        state.owners.insert(chunk_id as u64, kb_code.to_string());
    }

    fn query(&self, text: &str, k: usize, kb_code: Option<&str>) -> Vec<(i64, f32)> {
        if text.trim().is_empty() || k == 0 {
            return Vec::new();
        }
        let state = self.lock();

        let mut results: Vec<(i64, f32)> = match kb_code {
            Some(kb) => state
                .engines
                .get(kb)
                .map(|engine| {
                    engine
                        .search(text, k)
                        .into_iter()
                        .map(|r| (r.document.id as i64, r.score))
                        .collect()
                })
                .unwrap_or_default(),
            None => state
                .engines
                .values()
                .flat_map(|engine| {
                    engine
                        .search(text, k)
                        .into_iter()
                        .map(|r| (r.document.id as i64, r.score))
                })
                .collect(),
        };

        results.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        results.truncate(k);
        results
    }

    fn delete(&self, chunk_id: i64) {
        let mut state = self.lock();
        if let Some(kb) = state.owners.remove(&(chunk_id as u64)) {
            if let Some(engine) = state.engines.get_mut(&kb) {
                engine.remove(&(chunk_id as u64));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexes_and_ranks_by_term_frequency() {
        let index = Bm25Index::new();
        index.index(1, "kb1", "rust programming");
        index.index(2, "kb1", "rust rust rust is a programming language");
        index.index(3, "kb1", "python scripting");

        let results = index.query("rust", 10, Some("kb1"));
        assert!(results.iter().any(|(id, _)| *id == 1));
        assert!(results.iter().any(|(id, _)| *id == 2));
        assert!(!results.iter().any(|(id, _)| *id == 3));
    }

    #[test]
    fn scoping_never_leaks_across_knowledge_bases() {
        let index = Bm25Index::new();
        index.index(1, "kb1", "sales strategy overview");
        index.index(2, "kb2", "sales figures for the quarter");

        let kb1 = index.query("sales", 10, Some("kb1"));
        assert_eq!(kb1.len(), 1);
        assert_eq!(kb1[0].0, 1);

        let all = index.query("sales", 10, None);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn empty_query_and_empty_index_return_nothing() {
        let index = Bm25Index::new();
        assert!(index.query("", 10, None).is_empty());
        assert!(index.query("anything", 10, Some("kb1")).is_empty());
        index.index(1, "kb1", "text");
        assert!(index.query("   ", 10, Some("kb1")).is_empty());
    }

    #[test]
    fn deleted_chunks_stop_matching() {
        let index = Bm25Index::new();
        index.index(1, "kb1", "contract renewal terms");
        assert_eq!(index.query("contract", 10, Some("kb1")).len(), 1);

        index.delete(1);
        assert!(index.query("contract", 10, Some("kb1")).is_empty());
        // Deleting again is harmless.
        index.delete(1);
    }

    #[test]
    fn truncates_to_k() {
        let index = Bm25Index::new();
        for i in 0..20 {
            index.index(i, "kb1", &format!("shared token number {i}"));
        }
        let results = index.query("shared token", 5, Some("kb1"));
        assert!(results.len() <= 5);
    }
}
