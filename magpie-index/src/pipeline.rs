//! Chunk/embed pipeline.
//!
//! Once a document's content is available — markdown from the external
//! parser, or raw text for formats that skip it — this pipeline slices it,
//! embeds the slices, and writes chunks plus index entries.
//!
//! Replacement is delete-then-write: on re-processing, the old chunk set is
//! removed from both indices and the store, and that removal commits before
//! the first new chunk is written. A query in the gap sees zero hits for
//! the document; it never sees old and new content mixed.

use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

use magpie_chunk::StructuralChunker;

use crate::embed::EmbeddingProvider;
use crate::search::{LexicalIndex, VectorIndex};
use crate::store::{ChunkRecord, DocumentRecord, DocumentStatus, JobStore};

/// What one pipeline run produced.
#[derive(Debug, Default)]
pub struct PipelineOutcome {
    pub chunks_written: usize,
    pub embeddings_written: usize,
    /// Old chunks removed before the new set was written.
    pub chunks_replaced: usize,
}

/// Turns parsed content into stored, indexed chunks.
pub struct ChunkEmbedPipeline {
    store: JobStore,
    chunker: StructuralChunker,
    embedder: Arc<dyn EmbeddingProvider>,
    lexical: Arc<dyn LexicalIndex>,
    vector: Arc<dyn VectorIndex>,
}

impl ChunkEmbedPipeline {
    pub fn new(
        store: JobStore,
        chunker: StructuralChunker,
        embedder: Arc<dyn EmbeddingProvider>,
        lexical: Arc<dyn LexicalIndex>,
        vector: Arc<dyn VectorIndex>,
    ) -> Self {
        Self {
            store,
            chunker,
            embedder,
            lexical,
            vector,
        }
    }

    /// Process content for a document that just reached `parsed`.
    ///
    /// Advances the document to `vectorized` only when every chunk got an
    /// embedding; if the embedding collaborator is unavailable the chunks
    /// are still stored and lexically indexed, and the document stays
    /// `parsed` so a later run can finish the job.
    pub async fn process_parsed(
        &self,
        document: &DocumentRecord,
        content: &str,
        now: i64,
    ) -> Result<PipelineOutcome> {
        let pieces = self.chunker.chunk(content);
        let mut outcome = PipelineOutcome::default();

        // Delete phase: old identifiers vanish everywhere before any new
        // chunk becomes visible.
        let old_ids = self.store.chunk_ids_for_document(document.id).await?;
        for id in &old_ids {
            self.lexical.delete(*id);
            self.vector.delete(*id).await?;
        }
        outcome.chunks_replaced = self.store.delete_document_chunks(document.id).await?;

        if pieces.is_empty() {
            warn!(path = %document.path, "no chunks produced; document left at parsed");
            return Ok(outcome);
        }

        let texts: Vec<String> = pieces.iter().map(|p| p.text.clone()).collect();
        let embeddings = match self.embedder.embed_texts(&texts).await {
            Ok(vectors) if vectors.len() == texts.len() => Some(vectors),
            Ok(vectors) => {
                warn!(
                    expected = texts.len(),
                    got = vectors.len(),
                    "embedding provider returned a short batch; storing chunks without vectors"
                );
                None
            }
            Err(e) => {
                warn!("embedding unavailable, storing chunks without vectors: {e}");
                None
            }
        };

        let mut records: Vec<ChunkRecord> = pieces
            .iter()
            .map(|piece| ChunkRecord {
                id: None,
                document_id: document.id,
                seq: piece.sequence as i64,
                content: piece.text.clone(),
                page_start: piece.page_start.map(i64::from),
                page_end: piece.page_end.map(i64::from),
                section: piece.section.clone(),
                kb_code: document.kb_code.clone(),
                doc_hash: document.content_hash,
                embedding: None,
                vector_ref: None,
            })
            .collect();
        if let Some(vectors) = &embeddings {
            for (record, vector) in records.iter_mut().zip(vectors.iter()) {
                record.embedding = Some(vector.clone());
            }
        }

        // Write phase.
        let ids = self.store.insert_chunks(&records).await?;
        outcome.chunks_written = ids.len();

        for (id, record) in ids.iter().zip(&records) {
            self.lexical.index(*id, &record.kb_code, &record.content);
            if let Some(vector) = &record.embedding {
                self.vector.upsert(*id, vector, &record.kb_code).await?;
                outcome.embeddings_written += 1;
            }
        }

        if embeddings.is_some() {
            self.store
                .advance_document_status(
                    document.id,
                    DocumentStatus::Parsed,
                    DocumentStatus::Vectorized,
                    now,
                )
                .await?;
        }

        info!(
            path = %document.path,
            chunks = outcome.chunks_written,
            embedded = outcome.embeddings_written,
            replaced = outcome.chunks_replaced,
            "pipeline run complete"
        );
        Ok(outcome)
    }

    /// Ingest a format that needs no external parsing: the raw content is
    /// the parsed content. Marks the document `parsed` first, then runs the
    /// normal pipeline.
    pub async fn process_direct(
        &self,
        document: &DocumentRecord,
        content: &str,
        now: i64,
    ) -> Result<PipelineOutcome> {
        let advanced = self
            .store
            .advance_document_status(
                document.id,
                DocumentStatus::Unparsed,
                DocumentStatus::Parsed,
                now,
            )
            .await?;
        debug!(path = %document.path, advanced, "direct-format document marked parsed");
        self.process_parsed(document, content, now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::NoEmbeddingProvider;
    use crate::search::{Bm25Index, SqliteVectorIndex};
    use crate::store::NewDocument;
    use anyhow::Result;
    use async_trait::async_trait;
    use half::f16;
    use magpie_chunk::ChunkerConfig;

    /// Deterministic toy embedder: projects text onto letter-bucket counts.
    #[derive(Debug)]
    struct BucketEmbedder;

    #[async_trait]
    impl EmbeddingProvider for BucketEmbedder {
        async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f16>>> {
            Ok(texts
                .iter()
                .map(|text| {
                    let mut buckets = [0f32; 8];
                    for b in text.bytes() {
                        buckets[(b % 8) as usize] += 1.0;
                    }
                    let norm = buckets.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-6);
                    buckets.iter().map(|x| f16::from_f32(x / norm)).collect()
                })
                .collect())
        }

        fn embedding_dimension(&self) -> usize {
            8
        }

        fn provider_name(&self) -> &str {
            "bucket-test"
        }
    }

    async fn setup(
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<(ChunkEmbedPipeline, JobStore, DocumentRecord)> {
        let store = JobStore::open_memory().await?;
        let doc = store
            .upsert_document(&NewDocument {
                path: "docs/note.md".to_string(),
                kb_code: "kb1".to_string(),
                name: "note.md".to_string(),
                extension: "md".to_string(),
                size: 128,
                content_hash: [1; 32],
                modified_at: 100,
            })
            .await?;

        let pipeline = ChunkEmbedPipeline::new(
            store.clone(),
            StructuralChunker::new(ChunkerConfig::default().with_target_size(80)),
            embedder,
            Arc::new(Bm25Index::new()),
            Arc::new(SqliteVectorIndex::new(store.pool().clone()).await?),
        );
        Ok((pipeline, store, doc))
    }

    #[tokio::test]
    async fn direct_ingestion_reaches_vectorized() -> Result<()> {
        let (pipeline, store, doc) = setup(Arc::new(BucketEmbedder)).await?;

        let outcome = pipeline
            .process_direct(&doc, "# Note\n\nSome body text worth indexing.\n", 200)
            .await?;
        assert!(outcome.chunks_written > 0);
        assert_eq!(outcome.chunks_written, outcome.embeddings_written);

        let doc = store.get_document_by_id(doc.id).await?.unwrap();
        assert_eq!(doc.status, DocumentStatus::Vectorized);

        let chunks = store.chunks_for_document(doc.id).await?;
        assert!(chunks.iter().all(|c| c.embedding.is_some()));
        Ok(())
    }

    #[tokio::test]
    async fn embedding_outage_leaves_document_parsed() -> Result<()> {
        let (pipeline, store, doc) = setup(Arc::new(NoEmbeddingProvider)).await?;

        let outcome = pipeline
            .process_direct(&doc, "plain text without vectors", 200)
            .await?;
        assert!(outcome.chunks_written > 0);
        assert_eq!(outcome.embeddings_written, 0);

        let doc = store.get_document_by_id(doc.id).await?.unwrap();
        assert_eq!(doc.status, DocumentStatus::Parsed);
        Ok(())
    }

    #[tokio::test]
    async fn reprocessing_replaces_the_whole_chunk_set() -> Result<()> {
        let (pipeline, store, doc) = setup(Arc::new(BucketEmbedder)).await?;

        pipeline
            .process_direct(&doc, "original content about contracts", 200)
            .await?;
        let first = store.chunks_for_document(doc.id).await?;
        assert!(!first.is_empty());

        // New content hash: the upsert resets the lifecycle, then the
        // pipeline replaces every chunk.
        let renewed = NewDocument {
            path: doc.path.clone(),
            kb_code: doc.kb_code.clone(),
            name: doc.name.clone(),
            extension: doc.extension.clone(),
            size: 256,
            content_hash: [2; 32],
            modified_at: 300,
        };
        let doc = store.upsert_document(&renewed).await?;
        assert_eq!(doc.status, DocumentStatus::Unparsed);

        let outcome = pipeline
            .process_direct(&doc, "revised content about renewals", 400)
            .await?;
        assert_eq!(outcome.chunks_replaced, first.len());

        let replaced = store.chunks_for_document(doc.id).await?;
        assert!(replaced.iter().all(|c| c.content.contains("revised")));
        // External ids from the old hash no longer exist.
        assert!(replaced.iter().all(|c| c.doc_hash == [2; 32]));
        Ok(())
    }

    #[tokio::test]
    async fn empty_content_produces_no_chunks() -> Result<()> {
        let (pipeline, store, doc) = setup(Arc::new(BucketEmbedder)).await?;
        let outcome = pipeline.process_direct(&doc, "   \n", 200).await?;
        assert_eq!(outcome.chunks_written, 0);

        let doc = store.get_document_by_id(doc.id).await?.unwrap();
        assert_eq!(doc.status, DocumentStatus::Parsed);
        Ok(())
    }
}
