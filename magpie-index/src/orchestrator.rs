//! Parse orchestration.
//!
//! Drives each document through the external-parser state machine:
//!
//! ```text
//! submitted --(external ack)--> retrieved --(download+extract ok)--> completed
//! submitted --(submit error)--> failed
//! retrieved --(download/extract error, attempts remain)--> scheduled(retry)
//! scheduled --(attempts exhausted)--> failed
//! ```
//!
//! Submission persists the provider-assigned batch identifier *between*
//! the provider's acknowledgement and the content upload — once the
//! provider has accepted work, the identifier is durable before anything
//! else can fail. Polling is tick-driven: each tick claims due jobs with a
//! conditional update (at most one in-flight poll per job, with a stale
//! window so a crashed poller never blocks a job forever), and transient
//! failures reschedule with exponential backoff until the attempt budget
//! runs out. Terminal failure never advances the document's lifecycle
//! status.

use anyhow::{Context, Result};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio_stream::{StreamExt, wrappers::IntervalStream};
use tracing::{debug, error, info, warn};

use magpie_parse::{ParseProvider, PollOutcome, SubmitRequest, unpack_bundle};

use crate::clock::Clock;
use crate::config::IngestConfig;
use crate::pipeline::ChunkEmbedPipeline;
use crate::store::{BatchRecord, DocumentRecord, DocumentStatus, JobRecord, JobStore};

/// What happened to one claimed job during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDisposition {
    /// Another worker held the claim.
    Skipped,
    /// Result retrieved, batch completed, pipeline run.
    Completed,
    /// Transient failure; rescheduled with backoff.
    Rescheduled,
    /// Terminal failure (exhausted, permanent error, or canceled).
    Failed,
}

/// Aggregate of one scheduler tick.
#[derive(Debug, Default, Clone, Copy)]
pub struct TickStats {
    pub due: usize,
    pub completed: usize,
    pub rescheduled: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Tick-driven orchestrator. Cheap to clone; clones share the store pool,
/// provider, pipeline, and worker semaphore.
#[derive(Clone)]
pub struct ParseOrchestrator {
    store: JobStore,
    provider: Arc<dyn ParseProvider>,
    pipeline: Arc<ChunkEmbedPipeline>,
    config: Arc<IngestConfig>,
    clock: Arc<dyn Clock>,
    poll_permits: Arc<Semaphore>,
}

impl ParseOrchestrator {
    pub fn new(
        store: JobStore,
        provider: Arc<dyn ParseProvider>,
        pipeline: Arc<ChunkEmbedPipeline>,
        config: Arc<IngestConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let poll_permits = Arc::new(Semaphore::new(config.max_concurrent_polls));
        Self {
            store,
            provider,
            pipeline,
            config,
            clock,
            poll_permits,
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Submit one document to the external parser and schedule its result
    /// poll.
    ///
    /// Ordering is deliberate: the provider acknowledgement (which carries
    /// the batch identifier) is persisted as a batch row *before* the
    /// content upload runs. An upload failure then lands in the recorded
    /// `submitted → failed` edge instead of orphaning a provider-side
    /// batch nobody remembers.
    pub async fn submit_document(
        &self,
        document: &DocumentRecord,
        content: Vec<u8>,
    ) -> Result<BatchRecord> {
        // Fast-path refusal; the store re-checks atomically below.
        if let Some(active) = self.store.active_batch_for_document(document.id).await? {
            anyhow::bail!(
                "document {} already has active batch {}",
                document.path,
                active.provider_batch_id
            );
        }

        let request = SubmitRequest {
            file_name: document.name.clone(),
            data_id: format!(
                "{}-{}",
                document.id,
                hex::encode(&document.content_hash[..4])
            ),
        };

        let ack = self
            .provider
            .submit(&request)
            .await
            .with_context(|| format!("submitting {}", document.path))?;

        let now = self.clock.unix();
        let batch = self
            .store
            .create_batch(document.id, &ack.batch_id, now)
            .await?;
        info!(path = %document.path, batch = %ack.batch_id, "submission acknowledged");

        if let Err(e) = self.provider.upload(&ack, content).await {
            self.store
                .fail_batch(batch.id, &format!("content upload failed: {e}"))
                .await?;
            return Err(e).with_context(|| format!("uploading {}", document.path));
        }

        let next_run = now + self.config.initial_poll_delay_secs;
        self.store
            .create_job(
                batch.id,
                next_run,
                self.config.retry.max_attempts,
                self.config.retry.base_interval_secs,
            )
            .await?;
        debug!(batch = %ack.batch_id, next_run, "retrieval job scheduled");

        self.store
            .get_batch(batch.id)
            .await?
            .context("batch vanished after submission")
    }

    /// One scheduler pass: claim and poll every due job, bounded by the
    /// worker semaphore. Polls for distinct jobs run concurrently; polls
    /// for the same job are serialized by the claim.
    pub async fn run_tick(&self) -> Result<TickStats> {
        let now = self.clock.unix();
        let stale_before = now - self.config.claim_stale_after_secs;
        let due = self.store.due_jobs(now, stale_before, 256).await?;
        let mut stats = TickStats {
            due: due.len(),
            ..TickStats::default()
        };
        if due.is_empty() {
            return Ok(stats);
        }
        debug!(due = due.len(), "scheduler tick");

        let mut tasks = Vec::with_capacity(due.len());
        for job in due {
            let orchestrator = self.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = orchestrator.poll_permits.acquire().await.ok();
                orchestrator.poll_job(job).await
            }));
        }

        for outcome in join_all(tasks).await {
            match outcome {
                Ok(Ok(PollDisposition::Completed)) => stats.completed += 1,
                Ok(Ok(PollDisposition::Rescheduled)) => stats.rescheduled += 1,
                Ok(Ok(PollDisposition::Failed)) => stats.failed += 1,
                Ok(Ok(PollDisposition::Skipped)) => stats.skipped += 1,
                Ok(Err(e)) => {
                    stats.failed += 1;
                    error!("poll errored outside the state machine: {e:#}");
                }
                Err(e) => {
                    stats.failed += 1;
                    error!("poll task panicked: {e}");
                }
            }
        }
        Ok(stats)
    }

    /// Claim and poll one job.
    async fn poll_job(&self, job: JobRecord) -> Result<PollDisposition> {
        let now = self.clock.unix();
        let Some(job) = self
            .store
            .claim_job(job.id, now, self.config.claim_stale_after_secs)
            .await?
        else {
            return Ok(PollDisposition::Skipped);
        };

        let batch = self
            .store
            .get_batch(job.batch_id)
            .await?
            .context("claimed job references a missing batch")?;

        // Cancellation is observed at claim time; no provider call is made.
        if job.cancel_requested {
            let message = "processing canceled by caller";
            self.store.fail_job(job.id, message).await?;
            self.store.fail_batch(batch.id, message).await?;
            info!(batch = %batch.provider_batch_id, "job canceled before poll");
            return Ok(PollDisposition::Failed);
        }

        let started = std::time::Instant::now();
        let poll_result = self.provider.poll(&batch.provider_batch_id).await;
        let latency_ms = started.elapsed().as_millis() as i64;

        match poll_result {
            Ok(PollOutcome::Ready { result_url }) => {
                self.store.mark_batch_retrieved(batch.id, now).await?;
                match self.retrieve_and_complete(&job, &batch, &result_url, latency_ms).await {
                    Ok(()) => Ok(PollDisposition::Completed),
                    Err(e) => {
                        self.transient_failure(&job, &batch, "retrieve_error", &format!("{e:#}"), latency_ms)
                            .await
                    }
                }
            }
            Ok(PollOutcome::NotReady) => {
                self.transient_failure(&job, &batch, "not_ready", "result not ready", latency_ms)
                    .await
            }
            Ok(PollOutcome::Failed { message, permanent }) if permanent => {
                self.permanent_failure(&job, &batch, "provider_failed", &message, latency_ms)
                    .await
            }
            Ok(PollOutcome::Failed { message, .. }) => {
                self.transient_failure(&job, &batch, "provider_failed", &message, latency_ms)
                    .await
            }
            Err(e) if e.is_permanent() => {
                self.permanent_failure(&job, &batch, "poll_error", &e.to_string(), latency_ms)
                    .await
            }
            Err(e) => {
                self.transient_failure(&job, &batch, "poll_error", &e.to_string(), latency_ms)
                    .await
            }
        }
    }

    /// Download, extract, persist output locations, flip batch and job to
    /// completed, advance the document, and hand off to the pipeline.
    async fn retrieve_and_complete(
        &self,
        job: &JobRecord,
        batch: &BatchRecord,
        result_url: &str,
        latency_ms: i64,
    ) -> Result<()> {
        let bytes = self.provider.fetch(result_url).await?;
        let dest = self.config.result_dir.join(&batch.provider_batch_id);
        let unpacked = unpack_bundle(bytes, &dest).await?;

        let now = self.clock.unix();
        self.store
            .record_attempt(
                job.id,
                job.attempt,
                now,
                true,
                Some("ready"),
                None,
                latency_ms,
            )
            .await?;
        self.store
            .complete_batch(
                batch.id,
                &unpacked.markdown_path.to_string_lossy(),
                unpacked.assets_dir.as_deref().map(|p| p.to_string_lossy()).as_deref(),
                now,
            )
            .await?;
        self.store.complete_job(job.id).await?;

        let document = self
            .store
            .get_document_by_id(batch.document_id)
            .await?
            .context("batch references a missing document")?;
        self.store
            .advance_document_status(
                document.id,
                DocumentStatus::Unparsed,
                DocumentStatus::Parsed,
                now,
            )
            .await?;
        info!(path = %document.path, batch = %batch.provider_batch_id, "parse completed");

        // Within one document the stages are strictly ordered: the chunk
        // write happens only after the batch completed.
        self.pipeline
            .process_parsed(&document, &unpacked.markdown, now)
            .await?;
        Ok(())
    }

    /// Record a failed attempt; reschedule with backoff while budget
    /// remains, otherwise fail job and batch. The document is never
    /// advanced — and never demoted — on failure.
    async fn transient_failure(
        &self,
        job: &JobRecord,
        batch: &BatchRecord,
        code: &str,
        message: &str,
        latency_ms: i64,
    ) -> Result<PollDisposition> {
        let now = self.clock.unix();
        self.store
            .record_attempt(
                job.id,
                job.attempt,
                now,
                false,
                Some(code),
                Some(message),
                latency_ms,
            )
            .await?;

        if job.attempt < job.max_attempts {
            // attempt is 1-based after the claim, so the first retry waits
            // exactly the base interval.
            let delay = self
                .config
                .retry
                .backoff_delay((job.attempt as u32).saturating_sub(1));
            let next_run = now + delay.as_secs() as i64;
            self.store.reschedule_job(job.id, next_run, message).await?;
            debug!(
                batch = %batch.provider_batch_id,
                attempt = job.attempt,
                next_run,
                "transient failure, rescheduled"
            );
            Ok(PollDisposition::Rescheduled)
        } else {
            let detail = format!(
                "retries exhausted after {} attempts; last error: {message}",
                job.attempt
            );
            self.store.fail_job(job.id, &detail).await?;
            self.store.fail_batch(batch.id, &detail).await?;
            warn!(batch = %batch.provider_batch_id, "attempt budget exhausted, batch failed");
            Ok(PollDisposition::Failed)
        }
    }

    /// Permanent provider errors skip the remaining attempt budget.
    async fn permanent_failure(
        &self,
        job: &JobRecord,
        batch: &BatchRecord,
        code: &str,
        message: &str,
        latency_ms: i64,
    ) -> Result<PollDisposition> {
        let now = self.clock.unix();
        self.store
            .record_attempt(
                job.id,
                job.attempt,
                now,
                false,
                Some(code),
                Some(message),
                latency_ms,
            )
            .await?;
        self.store.fail_job(job.id, message).await?;
        self.store.fail_batch(batch.id, message).await?;
        warn!(batch = %batch.provider_batch_id, "permanent provider failure: {message}");
        Ok(PollDisposition::Failed)
    }

    /// Run the periodic scheduler until a shutdown signal arrives. Tick
    /// errors are logged and do not stop the loop.
    pub async fn run(&self, mut shutdown: mpsc::UnboundedReceiver<()>) {
        let mut ticks = IntervalStream::new(tokio::time::interval(self.config.tick_interval()));
        info!(
            interval_secs = self.config.tick_interval_secs,
            "scheduler running"
        );
        loop {
            tokio::select! {
                _ = ticks.next() => {
                    if let Err(e) = self.run_tick().await {
                        error!("scheduler tick failed: {e:#}");
                    }
                }
                _ = shutdown.recv() => {
                    info!("scheduler shutting down");
                    break;
                }
            }
        }
    }
}
