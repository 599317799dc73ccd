//! SQLite-backed job store.
//!
//! Schema overview:
//!
//! ```sql
//! documents(id, path, kb_code, name, extension, size, content_hash,
//!           modified_at, status, parsed_at, deleted_at, created_at)
//! parse_batches(id, document_id → documents, provider_batch_id UNIQUE,
//!               status, submitted_at, retrieved_at, markdown_path,
//!               assets_path, error)
//! retrieval_jobs(id, batch_id → parse_batches UNIQUE, status, next_run,
//!                attempt, max_attempts, base_interval_secs, claimed_at,
//!                cancel_requested, last_error)
//! retrieval_attempts(id, job_id → retrieval_jobs, attempt, started_at,
//!                    success, response_code, message, latency_ms)
//! chunks(id, document_id → documents, seq, content, page_start, page_end,
//!        section, kb_code, doc_hash, embedding, vector_ref, created_at)
//! ```
//!
//! Foreign keys cascade from documents downward. Timestamps are unix
//! seconds supplied by the caller's clock, never read from the database, so
//! scheduling stays testable.

use anyhow::{Context, Result, bail};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use std::path::Path;

use super::{
    AttemptRecord, BatchRecord, BatchStatus, ChunkRecord, ContentHash, DocumentRecord,
    DocumentStatus, JobRecord, JobStatus, NewDocument, StoreStats,
};

/// SQLite store for all processing state. Cheap to clone; clones share the
/// connection pool.
#[derive(Clone, Debug)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// Open (creating if missing) the store database under `base`.
    pub async fn open(base: &Path) -> Result<Self> {
        let db_path = base.join(".magpie.db");
        let pool = SqlitePool::connect_with(
            SqliteConnectOptions::new()
                .filename(db_path)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .busy_timeout(std::time::Duration::from_secs(5))
                .foreign_keys(true)
                .create_if_missing(true)
                .auto_vacuum(sqlx::sqlite::SqliteAutoVacuum::Full),
        )
        .await?;
        Self::new_with_pool(pool).await
    }

    /// In-memory store for tests. A single pooled connection, since every
    /// `:memory:` connection is its own database.
    pub async fn open_memory() -> Result<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(
                SqliteConnectOptions::new()
                    .in_memory(true)
                    .foreign_keys(true),
            )
            .await?;
        Self::new_with_pool(pool).await
    }

    async fn new_with_pool(pool: SqlitePool) -> Result<Self> {
        Self::create_tables(&pool).await?;
        Ok(Self { pool })
    }

    async fn create_tables(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL,
                kb_code TEXT NOT NULL,
                name TEXT NOT NULL,
                extension TEXT NOT NULL,
                size INTEGER NOT NULL,
                content_hash BLOB NOT NULL,
                modified_at INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'unparsed',
                parsed_at INTEGER,
                deleted_at INTEGER,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                CONSTRAINT unique_document UNIQUE(path, kb_code)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS parse_batches (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                document_id INTEGER NOT NULL,
                provider_batch_id TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL DEFAULT 'submitted',
                submitted_at INTEGER NOT NULL,
                retrieved_at INTEGER,
                markdown_path TEXT,
                assets_path TEXT,
                error TEXT,
                FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS retrieval_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                batch_id INTEGER NOT NULL UNIQUE,
                status TEXT NOT NULL DEFAULT 'scheduled',
                next_run INTEGER NOT NULL,
                attempt INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                base_interval_secs INTEGER NOT NULL,
                claimed_at INTEGER,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                FOREIGN KEY (batch_id) REFERENCES parse_batches(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS retrieval_attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id INTEGER NOT NULL,
                attempt INTEGER NOT NULL,
                started_at INTEGER NOT NULL,
                success INTEGER NOT NULL,
                response_code TEXT,
                message TEXT,
                latency_ms INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (job_id) REFERENCES retrieval_jobs(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                document_id INTEGER NOT NULL,
                seq INTEGER NOT NULL,
                content TEXT NOT NULL,
                page_start INTEGER,
                page_end INTEGER,
                section TEXT,
                kb_code TEXT NOT NULL,
                doc_hash BLOB NOT NULL,
                embedding BLOB,
                vector_ref TEXT,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                CONSTRAINT unique_chunk UNIQUE(document_id, seq),
                FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_path ON documents(path, kb_code)")
            .execute(pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_batches_document ON parse_batches(document_id)",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_due ON retrieval_jobs(status, next_run)",
        )
        .execute(pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_kb ON chunks(kb_code)")
            .execute(pool)
            .await?;

        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ----- documents ------------------------------------------------------

    /// Register a document or refresh its metadata. A changed content hash
    /// resets the document to `unparsed` (the explicit re-parse trigger);
    /// an unchanged hash leaves the lifecycle status alone. Revives
    /// soft-deleted rows.
    pub async fn upsert_document(&self, new: &NewDocument) -> Result<DocumentRecord> {
        sqlx::query(
            r#"
            INSERT INTO documents (path, kb_code, name, extension, size, content_hash, modified_at, status)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'unparsed')
            ON CONFLICT(path, kb_code) DO UPDATE SET
                name = excluded.name,
                extension = excluded.extension,
                size = excluded.size,
                modified_at = excluded.modified_at,
                status = CASE WHEN documents.content_hash <> excluded.content_hash
                              THEN 'unparsed' ELSE documents.status END,
                parsed_at = CASE WHEN documents.content_hash <> excluded.content_hash
                                 THEN NULL ELSE documents.parsed_at END,
                content_hash = excluded.content_hash,
                deleted_at = NULL
            "#,
        )
        .bind(&new.path)
        .bind(&new.kb_code)
        .bind(&new.name)
        .bind(&new.extension)
        .bind(new.size)
        .bind(&new.content_hash[..])
        .bind(new.modified_at)
        .execute(&self.pool)
        .await?;

        self.get_document(&new.path, &new.kb_code)
            .await?
            .context("document vanished after upsert")
    }

    pub async fn get_document(&self, path: &str, kb_code: &str) -> Result<Option<DocumentRecord>> {
        let row = sqlx::query("SELECT * FROM documents WHERE path = ?1 AND kb_code = ?2")
            .bind(path)
            .bind(kb_code)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| document_from_row(&r)).transpose()
    }

    pub async fn get_document_by_id(&self, id: i64) -> Result<Option<DocumentRecord>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| document_from_row(&r)).transpose()
    }

    /// All live (not soft-deleted) documents, optionally scoped to one
    /// knowledge base.
    pub async fn list_documents(&self, kb_code: Option<&str>) -> Result<Vec<DocumentRecord>> {
        let rows = match kb_code {
            Some(kb) => {
                sqlx::query(
                    "SELECT * FROM documents WHERE kb_code = ?1 AND deleted_at IS NULL ORDER BY path",
                )
                .bind(kb)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM documents WHERE deleted_at IS NULL ORDER BY path")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(document_from_row).collect()
    }

    /// Conditional lifecycle advance: succeeds only when the document is
    /// still in `from`. Never moves status backward.
    pub async fn advance_document_status(
        &self,
        id: i64,
        from: DocumentStatus,
        to: DocumentStatus,
        now: i64,
    ) -> Result<bool> {
        let result = if to == DocumentStatus::Parsed {
            sqlx::query(
                "UPDATE documents SET status = ?1, parsed_at = ?2 WHERE id = ?3 AND status = ?4",
            )
            .bind(to.as_str())
            .bind(now)
            .bind(id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query("UPDATE documents SET status = ?1 WHERE id = ?2 AND status = ?3")
                .bind(to.as_str())
                .bind(id)
                .bind(from.as_str())
                .execute(&self.pool)
                .await?
        };
        Ok(result.rows_affected() == 1)
    }

    /// Soft delete: the row survives (so batches and attempts stay
    /// resolvable) but stops appearing in listings and scans.
    pub async fn soft_delete_document(&self, id: i64, now: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE documents SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    // ----- parse batches --------------------------------------------------

    /// Record a provider-acknowledged submission. Refuses to create a
    /// second active batch for a document that already has one — this is
    /// the rule that serializes concurrent processing of the same path.
    pub async fn create_batch(
        &self,
        document_id: i64,
        provider_batch_id: &str,
        now: i64,
    ) -> Result<BatchRecord> {
        let mut tx = self.pool.begin().await?;

        let active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM parse_batches
             WHERE document_id = ?1 AND status IN ('submitted', 'retrieved')",
        )
        .bind(document_id)
        .fetch_one(&mut *tx)
        .await?;
        if active > 0 {
            bail!("document {document_id} already has an active parse batch");
        }

        let result = sqlx::query(
            "INSERT INTO parse_batches (document_id, provider_batch_id, status, submitted_at)
             VALUES (?1, ?2, 'submitted', ?3)",
        )
        .bind(document_id)
        .bind(provider_batch_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        let id = result.last_insert_rowid();
        tx.commit().await?;

        self.get_batch(id).await?.context("batch vanished after insert")
    }

    pub async fn get_batch(&self, id: i64) -> Result<Option<BatchRecord>> {
        let row = sqlx::query("SELECT * FROM parse_batches WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| batch_from_row(&r)).transpose()
    }

    pub async fn get_batch_by_provider_id(
        &self,
        provider_batch_id: &str,
    ) -> Result<Option<BatchRecord>> {
        let row = sqlx::query("SELECT * FROM parse_batches WHERE provider_batch_id = ?1")
            .bind(provider_batch_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| batch_from_row(&r)).transpose()
    }

    /// The non-terminal batch for a document, if any.
    pub async fn active_batch_for_document(
        &self,
        document_id: i64,
    ) -> Result<Option<BatchRecord>> {
        let row = sqlx::query(
            "SELECT * FROM parse_batches
             WHERE document_id = ?1 AND status IN ('submitted', 'retrieved')
             ORDER BY id DESC LIMIT 1",
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| batch_from_row(&r)).transpose()
    }

    /// The most recent batch for a document regardless of state.
    pub async fn latest_batch_for_document(
        &self,
        document_id: i64,
    ) -> Result<Option<BatchRecord>> {
        let row = sqlx::query(
            "SELECT * FROM parse_batches WHERE document_id = ?1 ORDER BY id DESC LIMIT 1",
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| batch_from_row(&r)).transpose()
    }

    /// Flip `submitted` → `retrieved` once the provider reports the result
    /// ready. Idempotent across retried downloads: already-retrieved
    /// batches are left alone and the call reports success.
    pub async fn mark_batch_retrieved(&self, id: i64, now: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE parse_batches SET status = 'retrieved', retrieved_at = ?1
             WHERE id = ?2 AND status = 'submitted'",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn complete_batch(
        &self,
        id: i64,
        markdown_path: &str,
        assets_path: Option<&str>,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE parse_batches
             SET status = 'completed', markdown_path = ?1, assets_path = ?2,
                 retrieved_at = COALESCE(retrieved_at, ?3)
             WHERE id = ?4 AND status IN ('submitted', 'retrieved')",
        )
        .bind(markdown_path)
        .bind(assets_path)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn fail_batch(&self, id: i64, error: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE parse_batches SET status = 'failed', error = ?1
             WHERE id = ?2 AND status NOT IN ('completed', 'failed')",
        )
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    // ----- retrieval jobs -------------------------------------------------

    /// Create the (single) retrieval job for a batch.
    pub async fn create_job(
        &self,
        batch_id: i64,
        next_run: i64,
        max_attempts: u32,
        base_interval_secs: i64,
    ) -> Result<JobRecord> {
        let result = sqlx::query(
            "INSERT INTO retrieval_jobs (batch_id, status, next_run, max_attempts, base_interval_secs)
             VALUES (?1, 'scheduled', ?2, ?3, ?4)",
        )
        .bind(batch_id)
        .bind(next_run)
        .bind(max_attempts as i64)
        .bind(base_interval_secs)
        .execute(&self.pool)
        .await?;
        let id = result.last_insert_rowid();
        self.get_job(id).await?.context("job vanished after insert")
    }

    pub async fn get_job(&self, id: i64) -> Result<Option<JobRecord>> {
        let row = sqlx::query("SELECT * FROM retrieval_jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    pub async fn job_for_batch(&self, batch_id: i64) -> Result<Option<JobRecord>> {
        let row = sqlx::query("SELECT * FROM retrieval_jobs WHERE batch_id = ?1")
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    /// Jobs eligible to poll at `now`, oldest due first. Includes
    /// `in_progress` jobs whose claim predates `stale_before` — a crashed
    /// poller must not park a job forever.
    pub async fn due_jobs(
        &self,
        now: i64,
        stale_before: i64,
        limit: usize,
    ) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM retrieval_jobs
             WHERE (status = 'scheduled' AND next_run <= ?1)
                OR (status = 'in_progress' AND claimed_at IS NOT NULL AND claimed_at <= ?2)
             ORDER BY next_run ASC LIMIT ?3",
        )
        .bind(now)
        .bind(stale_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Exclusive claim: moves a `scheduled` job to `in_progress` and
    /// increments its attempt counter, or re-claims an `in_progress` job
    /// whose claim is older than `stale_after_secs` (a crashed poller must
    /// not block the job forever). Returns the refreshed row on success,
    /// `None` when another worker holds the job.
    pub async fn claim_job(
        &self,
        id: i64,
        now: i64,
        stale_after_secs: i64,
    ) -> Result<Option<JobRecord>> {
        let stale_before = now - stale_after_secs;
        let result = sqlx::query(
            "UPDATE retrieval_jobs SET status = 'in_progress', claimed_at = ?1, attempt = attempt + 1
             WHERE id = ?2
               AND (status = 'scheduled'
                    OR (status = 'in_progress' AND claimed_at IS NOT NULL AND claimed_at <= ?3))",
        )
        .bind(now)
        .bind(id)
        .bind(stale_before)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            self.get_job(id).await
        } else {
            Ok(None)
        }
    }

    /// Put a claimed job back on the schedule after a transient failure.
    pub async fn reschedule_job(&self, id: i64, next_run: i64, error: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE retrieval_jobs
             SET status = 'scheduled', next_run = ?1, last_error = ?2, claimed_at = NULL
             WHERE id = ?3 AND status = 'in_progress'",
        )
        .bind(next_run)
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn complete_job(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE retrieval_jobs SET status = 'completed', claimed_at = NULL
             WHERE id = ?1 AND status = 'in_progress'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn fail_job(&self, id: i64, error: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE retrieval_jobs
             SET status = 'failed', last_error = ?1, claimed_at = NULL
             WHERE id = ?2 AND status IN ('scheduled', 'in_progress')",
        )
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Flag the live job for a document's active batch so the scheduler
    /// fails it instead of polling again. No mid-flight call is aborted.
    pub async fn request_cancel(&self, path: &str, kb_code: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE retrieval_jobs SET cancel_requested = 1
             WHERE status IN ('scheduled', 'in_progress')
               AND batch_id IN (
                   SELECT b.id FROM parse_batches b
                   JOIN documents d ON b.document_id = d.id
                   WHERE d.path = ?1 AND d.kb_code = ?2
                     AND b.status IN ('submitted', 'retrieved'))",
        )
        .bind(path)
        .bind(kb_code)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ----- retrieval attempts ---------------------------------------------

    /// Append one poll's audit record. Attempts are never updated or
    /// deleted except by cascade.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_attempt(
        &self,
        job_id: i64,
        attempt: i64,
        started_at: i64,
        success: bool,
        response_code: Option<&str>,
        message: Option<&str>,
        latency_ms: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO retrieval_attempts
             (job_id, attempt, started_at, success, response_code, message, latency_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(job_id)
        .bind(attempt)
        .bind(started_at)
        .bind(success)
        .bind(response_code)
        .bind(message)
        .bind(latency_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn attempts_for_job(&self, job_id: i64) -> Result<Vec<AttemptRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM retrieval_attempts WHERE job_id = ?1 ORDER BY attempt ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(attempt_from_row).collect()
    }

    // ----- chunks ---------------------------------------------------------

    /// Chunk row ids for a document, for index cleanup before deletion.
    pub async fn chunk_ids_for_document(&self, document_id: i64) -> Result<Vec<i64>> {
        let rows = sqlx::query("SELECT id FROM chunks WHERE document_id = ?1 ORDER BY seq")
            .bind(document_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get::<i64, _>("id")).collect())
    }

    /// Delete all chunks for a document. Committed before replacement
    /// chunks are written, so a concurrent query sees either the old set or
    /// nothing, never a mix.
    pub async fn delete_document_chunks(&self, document_id: i64) -> Result<usize> {
        let result = sqlx::query("DELETE FROM chunks WHERE document_id = ?1")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    /// Insert a document's replacement chunk set in one transaction.
    /// Returns the new row ids in input order.
    pub async fn insert_chunks(&self, chunks: &[ChunkRecord]) -> Result<Vec<i64>> {
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(chunks.len());

        for chunk in chunks {
            let embedding_bytes = chunk
                .embedding
                .as_ref()
                .map(|e| bytemuck::cast_slice::<half::f16, u8>(e));

            let result = sqlx::query(
                "INSERT INTO chunks
                 (document_id, seq, content, page_start, page_end, section, kb_code, doc_hash, embedding, vector_ref)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )
            .bind(chunk.document_id)
            .bind(chunk.seq)
            .bind(&chunk.content)
            .bind(chunk.page_start)
            .bind(chunk.page_end)
            .bind(chunk.section.as_deref())
            .bind(&chunk.kb_code)
            .bind(&chunk.doc_hash[..])
            .bind(embedding_bytes)
            .bind(chunk.vector_ref.as_deref())
            .execute(&mut *tx)
            .await?;
            ids.push(result.last_insert_rowid());
        }

        tx.commit().await?;
        Ok(ids)
    }

    pub async fn get_chunk(&self, id: i64) -> Result<Option<ChunkRecord>> {
        let row = sqlx::query("SELECT * FROM chunks WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| chunk_from_row(&r)).transpose()
    }

    pub async fn chunks_for_document(&self, document_id: i64) -> Result<Vec<ChunkRecord>> {
        let rows = sqlx::query("SELECT * FROM chunks WHERE document_id = ?1 ORDER BY seq")
            .bind(document_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(chunk_from_row).collect()
    }

    /// Every stored chunk, optionally scoped. Used to rebuild the lexical
    /// index on startup.
    pub async fn all_chunks(&self, kb_code: Option<&str>) -> Result<Vec<ChunkRecord>> {
        let rows = match kb_code {
            Some(kb) => {
                sqlx::query("SELECT * FROM chunks WHERE kb_code = ?1 ORDER BY document_id, seq")
                    .bind(kb)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM chunks ORDER BY document_id, seq")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(chunk_from_row).collect()
    }

    // ----- aggregates -----------------------------------------------------

    pub async fn stats(&self) -> Result<StoreStats> {
        let documents: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE deleted_at IS NULL")
                .fetch_one(&self.pool)
                .await?;
        let batches: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM parse_batches")
            .fetch_one(&self.pool)
            .await?;
        let scheduled_jobs: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM retrieval_jobs WHERE status = 'scheduled'")
                .fetch_one(&self.pool)
                .await?;
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let embedded_chunks: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE embedding IS NOT NULL")
                .fetch_one(&self.pool)
                .await?;

        Ok(StoreStats {
            documents: documents as usize,
            batches: batches as usize,
            scheduled_jobs: scheduled_jobs as usize,
            chunks: chunks as usize,
            embedded_chunks: embedded_chunks as usize,
        })
    }

    /// Joined processing state for one document path: the document row, its
    /// latest batch, and that batch's job. This is the operator-facing
    /// progress view.
    pub async fn document_state(
        &self,
        path: &str,
        kb_code: &str,
    ) -> Result<Option<(DocumentRecord, Option<BatchRecord>, Option<JobRecord>)>> {
        let Some(document) = self.get_document(path, kb_code).await? else {
            return Ok(None);
        };
        let batch = self.latest_batch_for_document(document.id).await?;
        let job = match &batch {
            Some(b) => self.job_for_batch(b.id).await?,
            None => None,
        };
        Ok(Some((document, batch, job)))
    }
}

// ----- row decoding -------------------------------------------------------

fn hash_from_row(row: &SqliteRow, column: &str) -> Result<ContentHash> {
    let bytes: Vec<u8> = row.get(column);
    bytes
        .as_slice()
        .try_into()
        .context("stored hash is not 32 bytes")
}

fn document_from_row(row: &SqliteRow) -> Result<DocumentRecord> {
    let status: String = row.get("status");
    Ok(DocumentRecord {
        id: row.get("id"),
        path: row.get("path"),
        kb_code: row.get("kb_code"),
        name: row.get("name"),
        extension: row.get("extension"),
        size: row.get("size"),
        content_hash: hash_from_row(row, "content_hash")?,
        modified_at: row.get("modified_at"),
        status: DocumentStatus::parse(&status)?,
        parsed_at: row.get("parsed_at"),
        deleted_at: row.get("deleted_at"),
    })
}

fn batch_from_row(row: &SqliteRow) -> Result<BatchRecord> {
    let status: String = row.get("status");
    Ok(BatchRecord {
        id: row.get("id"),
        document_id: row.get("document_id"),
        provider_batch_id: row.get("provider_batch_id"),
        status: BatchStatus::parse(&status)?,
        submitted_at: row.get("submitted_at"),
        retrieved_at: row.get("retrieved_at"),
        markdown_path: row.get("markdown_path"),
        assets_path: row.get("assets_path"),
        error: row.get("error"),
    })
}

fn job_from_row(row: &SqliteRow) -> Result<JobRecord> {
    let status: String = row.get("status");
    Ok(JobRecord {
        id: row.get("id"),
        batch_id: row.get("batch_id"),
        status: JobStatus::parse(&status)?,
        next_run: row.get("next_run"),
        attempt: row.get("attempt"),
        max_attempts: row.get("max_attempts"),
        base_interval_secs: row.get("base_interval_secs"),
        claimed_at: row.get("claimed_at"),
        cancel_requested: row.get::<i64, _>("cancel_requested") != 0,
        last_error: row.get("last_error"),
    })
}

fn attempt_from_row(row: &SqliteRow) -> Result<AttemptRecord> {
    Ok(AttemptRecord {
        id: row.get("id"),
        job_id: row.get("job_id"),
        attempt: row.get("attempt"),
        started_at: row.get("started_at"),
        success: row.get::<i64, _>("success") != 0,
        response_code: row.get("response_code"),
        message: row.get("message"),
        latency_ms: row.get("latency_ms"),
    })
}

fn chunk_from_row(row: &SqliteRow) -> Result<ChunkRecord> {
    let embedding_bytes: Option<Vec<u8>> = row.get("embedding");
    let embedding =
        embedding_bytes.map(|bytes| bytemuck::cast_slice::<u8, half::f16>(&bytes).to_vec());

    Ok(ChunkRecord {
        id: Some(row.get("id")),
        document_id: row.get("document_id"),
        seq: row.get("seq"),
        content: row.get("content"),
        page_start: row.get("page_start"),
        page_end: row.get("page_end"),
        section: row.get("section"),
        kb_code: row.get("kb_code"),
        doc_hash: hash_from_row(row, "doc_hash")?,
        embedding,
        vector_ref: row.get("vector_ref"),
    })
}
