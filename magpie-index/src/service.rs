//! Caller-facing operations.
//!
//! This is the surface the (external) API layer consumes: request
//! processing for a set of paths, poll a handle for progress, remove
//! documents, and query. Input errors — missing file, unsupported format,
//! oversized file — are rejected synchronously and never enter the state
//! machine; everything after validation happens in background tasks whose
//! progress is tracked per file under an opaque handle.

use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{info, warn};
use uuid::Uuid;

use magpie_chunk::StructuralChunker;
use magpie_parse::ParseProvider;

use crate::clock::{Clock, SystemClock};
use crate::config::IngestConfig;
use crate::embed::EmbeddingProvider;
use crate::orchestrator::ParseOrchestrator;
use crate::pipeline::ChunkEmbedPipeline;
use crate::scanner::{is_supported_extension, needs_external_parsing};
use crate::search::{
    Bm25Index, HybridRetriever, LexicalIndex, SearchHit, SqliteVectorIndex, VectorIndex,
};
use crate::store::{BatchStatus, DocumentStatus, JobStore, NewDocument};

/// Opaque handle for one processing request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessingHandle(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Pending,
    Processing,
    Completed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    Completed,
    Failed,
}

/// Per-file progress through the processing stages.
#[derive(Debug, Clone, Serialize)]
pub struct FileProgress {
    pub path: String,
    pub parsing: StageState,
    pub chunking: StageState,
    pub vectorization: StageState,
    pub storage: StageState,
    pub terminal: Option<TerminalState>,
    /// Last concrete error detail, never a generic message.
    pub error: Option<String>,
}

impl FileProgress {
    fn new(path: String) -> Self {
        Self {
            path,
            parsing: StageState::Pending,
            chunking: StageState::Pending,
            vectorization: StageState::Pending,
            storage: StageState::Pending,
            terminal: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallState {
    Processing,
    Completed,
    Failed,
}

/// Aggregated view of one processing request.
#[derive(Debug, Clone, Serialize)]
pub struct BatchProgress {
    pub handle: String,
    pub kb_code: String,
    pub total: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub overall: OverallState,
    pub files: Vec<FileProgress>,
}

/// Result of removing one document.
#[derive(Debug, Clone, Serialize)]
pub struct RemovalResult {
    pub path: String,
    pub removed: bool,
    pub chunks_deleted: usize,
    pub error: Option<String>,
}

#[derive(Debug)]
struct RequestState {
    kb_code: String,
    files: HashMap<String, FileProgress>,
}

/// The ingestion service: validation, background processing, progress
/// tracking, removal, and hybrid query.
#[derive(Clone)]
pub struct IngestService {
    store: JobStore,
    config: Arc<IngestConfig>,
    orchestrator: ParseOrchestrator,
    pipeline: Arc<ChunkEmbedPipeline>,
    retriever: HybridRetriever,
    lexical: Arc<dyn LexicalIndex>,
    vector: Arc<dyn VectorIndex>,
    clock: Arc<dyn Clock>,
    requests: Arc<RwLock<HashMap<String, RequestState>>>,
    /// Paths currently being processed, for same-document serialization on
    /// top of the store's single-active-batch rule.
    in_flight: Arc<Mutex<HashSet<(String, String)>>>,
}

impl IngestService {
    pub async fn new(
        store: JobStore,
        provider: Arc<dyn ParseProvider>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: IngestConfig,
    ) -> Result<Self> {
        Self::with_clock(store, provider, embedder, config, Arc::new(SystemClock)).await
    }

    /// Construction with an explicit clock, for tests that drive time.
    pub async fn with_clock(
        store: JobStore,
        provider: Arc<dyn ParseProvider>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: IngestConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let config = Arc::new(config);

        let lexical = Arc::new(Bm25Index::new());
        let indexed = lexical.rebuild_from_store(&store).await?;
        if indexed > 0 {
            info!(chunks = indexed, "lexical index restored from store");
        }
        let vector = Arc::new(SqliteVectorIndex::new(store.pool().clone()).await?);

        let pipeline = Arc::new(ChunkEmbedPipeline::new(
            store.clone(),
            StructuralChunker::new(config.chunking.clone()),
            embedder.clone(),
            lexical.clone(),
            vector.clone(),
        ));
        let orchestrator = ParseOrchestrator::new(
            store.clone(),
            provider,
            pipeline.clone(),
            config.clone(),
            clock.clone(),
        );
        let retriever = HybridRetriever::new(
            store.clone(),
            lexical.clone(),
            vector.clone(),
            embedder,
            config.overfetch_factor,
            config.rrf_constant,
        );

        Ok(Self {
            store,
            config,
            orchestrator,
            pipeline,
            retriever,
            lexical,
            vector,
            clock,
            requests: Arc::new(RwLock::new(HashMap::new())),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn orchestrator(&self) -> &ParseOrchestrator {
        &self.orchestrator
    }

    pub fn retriever(&self) -> &HybridRetriever {
        &self.retriever
    }

    /// Start the periodic result-poll scheduler. Returns the task handle
    /// and a shutdown sender.
    pub fn spawn_scheduler(&self) -> (tokio::task::JoinHandle<()>, mpsc::UnboundedSender<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let orchestrator = self.orchestrator.clone();
        let handle = tokio::spawn(async move { orchestrator.run(rx).await });
        (handle, tx)
    }

    // ----- request processing --------------------------------------------

    /// Validate and start processing for a set of paths. Validation is
    /// synchronous: any missing, unsupported, or oversized file rejects
    /// the whole request before any work starts.
    pub async fn request_processing(
        &self,
        paths: Vec<PathBuf>,
        kb_code: &str,
        timeout: Duration,
    ) -> Result<ProcessingHandle> {
        if paths.is_empty() {
            bail!("no paths given");
        }
        for path in &paths {
            self.validate_input(path)?;
        }

        let handle = ProcessingHandle(format!("req-{}", Uuid::new_v4().simple()));
        {
            let mut requests = self.requests.write().await;
            requests.insert(
                handle.0.clone(),
                RequestState {
                    kb_code: kb_code.to_string(),
                    files: paths
                        .iter()
                        .map(|p| {
                            let key = p.to_string_lossy().into_owned();
                            (key.clone(), FileProgress::new(key))
                        })
                        .collect(),
                },
            );
        }

        for path in paths {
            let service = self.clone();
            let handle_id = handle.0.clone();
            let kb = kb_code.to_string();
            tokio::spawn(async move {
                service.process_one(handle_id, path, kb, timeout).await;
            });
        }

        Ok(handle)
    }

    /// Synchronous input checks; failures here never create any state.
    fn validate_input(&self, path: &Path) -> Result<()> {
        let metadata = std::fs::metadata(path)
            .with_context(|| format!("file does not exist: {}", path.display()))?;
        if !metadata.is_file() {
            bail!("not a regular file: {}", path.display());
        }
        if metadata.len() > self.config.max_file_size {
            bail!(
                "file exceeds the {} byte limit: {}",
                self.config.max_file_size,
                path.display()
            );
        }
        let supported = path
            .extension()
            .map(|e| is_supported_extension(&e.to_string_lossy()))
            .unwrap_or(false);
        if !supported {
            bail!("unsupported file format: {}", path.display());
        }
        Ok(())
    }

    async fn process_one(&self, handle: String, path: PathBuf, kb_code: String, timeout: Duration) {
        let key = path.to_string_lossy().into_owned();

        {
            let mut in_flight = self.in_flight.lock().await;
            if !in_flight.insert((key.clone(), kb_code.clone())) {
                self.mark_failed(&handle, &key, "document is already being processed")
                    .await;
                return;
            }
        }

        let result = tokio::time::timeout(timeout, self.drive_file(&handle, &path, &kb_code)).await;
        match result {
            Ok(Ok(())) => {
                self.update_progress(&handle, &key, |p| {
                    p.storage = StageState::Completed;
                    p.terminal = Some(TerminalState::Completed);
                })
                .await;
            }
            Ok(Err(e)) => {
                self.mark_failed(&handle, &key, &format!("{e:#}")).await;
            }
            Err(_) => {
                self.mark_failed(
                    &handle,
                    &key,
                    &format!("processing timed out after {}s", timeout.as_secs()),
                )
                .await;
            }
        }

        let mut in_flight = self.in_flight.lock().await;
        in_flight.remove(&(key, kb_code));
    }

    /// Process one validated file to a terminal state.
    async fn drive_file(&self, handle: &str, path: &Path, kb_code: &str) -> Result<()> {
        let key = path.to_string_lossy().into_owned();
        let content = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let content_hash = *blake3::hash(&content).as_bytes();
        let metadata = tokio::fs::metadata(path).await?;
        let modified_at = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        let document = self
            .store
            .upsert_document(&NewDocument {
                path: key.clone(),
                kb_code: kb_code.to_string(),
                name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| key.clone()),
                extension: extension.clone(),
                size: content.len() as i64,
                content_hash,
                modified_at,
            })
            .await?;

        // Already fully processed with identical content: nothing to do.
        if document.status == DocumentStatus::Vectorized {
            self.update_progress(handle, &key, |p| {
                p.parsing = StageState::Skipped;
                p.chunking = StageState::Skipped;
                p.vectorization = StageState::Skipped;
            })
            .await;
            return Ok(());
        }

        if needs_external_parsing(&extension) {
            self.update_progress(handle, &key, |p| p.parsing = StageState::Processing)
                .await;
            self.orchestrator.submit_document(&document, content).await?;
            self.wait_for_batch_terminal(handle, &key, kb_code).await?;
        } else {
            // Direct formats carry their own content.
            self.update_progress(handle, &key, |p| {
                p.parsing = StageState::Skipped;
                p.chunking = StageState::Processing;
            })
            .await;
            let text = String::from_utf8_lossy(&content).into_owned();
            let outcome = self
                .pipeline
                .process_direct(&document, &text, self.clock.unix())
                .await?;
            self.update_progress(handle, &key, |p| {
                p.chunking = StageState::Completed;
                p.vectorization = if outcome.embeddings_written > 0 {
                    StageState::Completed
                } else {
                    StageState::Failed
                };
            })
            .await;
        }
        Ok(())
    }

    /// Observe the store until the document's batch reaches a terminal
    /// state. The scheduler does the actual polling; this just watches.
    async fn wait_for_batch_terminal(&self, handle: &str, key: &str, kb_code: &str) -> Result<()> {
        loop {
            let state = self.store.document_state(key, kb_code).await?;
            let Some((document, Some(batch), _job)) = state else {
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            };

            match batch.status {
                BatchStatus::Completed => {
                    self.update_progress(handle, key, |p| {
                        p.parsing = StageState::Completed;
                        p.chunking = StageState::Completed;
                        p.vectorization = if document.status == DocumentStatus::Vectorized {
                            StageState::Completed
                        } else {
                            StageState::Processing
                        };
                    })
                    .await;
                    return Ok(());
                }
                BatchStatus::Failed => {
                    let detail = batch
                        .error
                        .unwrap_or_else(|| "parse batch failed without detail".to_string());
                    bail!(detail);
                }
                BatchStatus::Submitted | BatchStatus::Retrieved => {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
        }
    }

    async fn update_progress(&self, handle: &str, key: &str, f: impl FnOnce(&mut FileProgress)) {
        let mut requests = self.requests.write().await;
        if let Some(state) = requests.get_mut(handle) {
            if let Some(progress) = state.files.get_mut(key) {
                f(progress);
            }
        }
    }

    async fn mark_failed(&self, handle: &str, key: &str, error: &str) {
        warn!(path = key, "processing failed: {error}");
        self.update_progress(handle, key, |p| {
            p.terminal = Some(TerminalState::Failed);
            p.error = Some(error.to_string());
        })
        .await;
    }

    // ----- status ---------------------------------------------------------

    /// Aggregate progress for a handle. `None` for unknown handles.
    pub async fn get_status(&self, handle: &ProcessingHandle) -> Option<BatchProgress> {
        let requests = self.requests.read().await;
        let state = requests.get(&handle.0)?;

        let files: Vec<FileProgress> = state.files.values().cloned().collect();
        let completed = files
            .iter()
            .filter(|f| f.terminal == Some(TerminalState::Completed))
            .count();
        let failed = files
            .iter()
            .filter(|f| f.terminal == Some(TerminalState::Failed))
            .count();
        let in_progress = files.len() - completed - failed;

        let overall = if in_progress > 0 {
            OverallState::Processing
        } else if failed > 0 {
            OverallState::Failed
        } else {
            OverallState::Completed
        };

        Some(BatchProgress {
            handle: handle.0.clone(),
            kb_code: state.kb_code.clone(),
            total: files.len(),
            in_progress,
            completed,
            failed,
            overall,
            files,
        })
    }

    // ----- removal --------------------------------------------------------

    /// Remove documents: cancel live processing, drop chunks from both
    /// indices and the store, soft-delete the document rows.
    pub async fn remove_documents(
        &self,
        paths: &[PathBuf],
        kb_code: &str,
    ) -> Result<Vec<RemovalResult>> {
        let mut results = Vec::with_capacity(paths.len());
        for path in paths {
            let key = path.to_string_lossy().into_owned();
            results.push(self.remove_one(&key, kb_code).await);
        }
        Ok(results)
    }

    async fn remove_one(&self, key: &str, kb_code: &str) -> RemovalResult {
        match self.try_remove(key, kb_code).await {
            Ok(chunks_deleted) => RemovalResult {
                path: key.to_string(),
                removed: true,
                chunks_deleted,
                error: None,
            },
            Err(e) => RemovalResult {
                path: key.to_string(),
                removed: false,
                chunks_deleted: 0,
                error: Some(format!("{e:#}")),
            },
        }
    }

    async fn try_remove(&self, key: &str, kb_code: &str) -> Result<usize> {
        let document = self
            .store
            .get_document(key, kb_code)
            .await?
            .with_context(|| format!("document is not tracked: {key}"))?;

        // Stop any future polling first; mid-flight calls finish on their
        // own and find the job failed.
        let canceled = self.store.request_cancel(key, kb_code).await?;
        if canceled {
            info!(path = key, "canceled in-flight processing before removal");
        }

        let chunk_ids = self.store.chunk_ids_for_document(document.id).await?;
        for id in &chunk_ids {
            self.lexical.delete(*id);
            self.vector.delete(*id).await?;
        }
        let deleted = self.store.delete_document_chunks(document.id).await?;
        self.store
            .soft_delete_document(document.id, self.clock.unix())
            .await?;
        info!(path = key, chunks = deleted, "document removed");
        Ok(deleted)
    }

    // ----- query ----------------------------------------------------------

    /// Hybrid query over committed chunks.
    pub async fn query(
        &self,
        text: &str,
        k: usize,
        kb_code: Option<&str>,
    ) -> Result<Vec<SearchHit>> {
        self.retriever.query(text, k, kb_code).await
    }
}
