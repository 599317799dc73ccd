//! Durable processing state.
//!
//! The job store is the single source of truth for where every document is
//! in its life: document → parse batch → retrieval job → retrieval attempt,
//! plus the chunks written once parsing succeeds. Five tables, foreign keys
//! cascading from documents downward, one typed status enum per entity.
//!
//! All state transitions go through conditional updates keyed on the
//! current status (compare-and-set style), which is what makes concurrent
//! schedulers safe without a global lock: a transition whose precondition
//! no longer holds simply affects zero rows.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

pub mod job_store;

pub use job_store::JobStore;

/// Blake3 content hash (32 bytes).
pub type ContentHash = [u8; 32];

/// Document lifecycle. Monotonically non-decreasing except an explicit
/// re-parse reset back to `Unparsed` when content changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Unparsed,
    Parsed,
    Vectorized,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unparsed => "unparsed",
            Self::Parsed => "parsed",
            Self::Vectorized => "vectorized",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "unparsed" => Ok(Self::Unparsed),
            "parsed" => Ok(Self::Parsed),
            "vectorized" => Ok(Self::Vectorized),
            other => bail!("unknown document status: {other}"),
        }
    }
}

/// One external parsing submission for one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Submitted,
    Retrieved,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Retrieved => "retrieved",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "submitted" => Ok(Self::Submitted),
            "retrieved" => Ok(Self::Retrieved),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => bail!("unknown batch status: {other}"),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// The scheduling unit that polls a batch's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Scheduled,
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => bail!("unknown job status: {other}"),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A tracked document. Identity is (path, kb_code); soft-deleted rows keep
/// their id so historical batches and attempts stay resolvable.
#[derive(Debug, Clone)]
pub struct DocumentRecord {
    pub id: i64,
    pub path: String,
    pub kb_code: String,
    pub name: String,
    pub extension: String,
    pub size: i64,
    pub content_hash: ContentHash,
    pub modified_at: i64,
    pub status: DocumentStatus,
    pub parsed_at: Option<i64>,
    pub deleted_at: Option<i64>,
}

/// Input for registering or refreshing a document.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub path: String,
    pub kb_code: String,
    pub name: String,
    pub extension: String,
    pub size: i64,
    pub content_hash: ContentHash,
    pub modified_at: i64,
}

/// A parse batch row. `provider_batch_id` is assigned by the external
/// parser and never generated locally.
#[derive(Debug, Clone)]
pub struct BatchRecord {
    pub id: i64,
    pub document_id: i64,
    pub provider_batch_id: String,
    pub status: BatchStatus,
    pub submitted_at: i64,
    pub retrieved_at: Option<i64>,
    pub markdown_path: Option<String>,
    pub assets_path: Option<String>,
    pub error: Option<String>,
}

/// A retrieval job row. Exactly one per batch.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: i64,
    pub batch_id: i64,
    pub status: JobStatus,
    pub next_run: i64,
    pub attempt: i64,
    pub max_attempts: i64,
    pub base_interval_secs: i64,
    pub claimed_at: Option<i64>,
    pub cancel_requested: bool,
    pub last_error: Option<String>,
}

/// Immutable audit record of one poll.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub id: i64,
    pub job_id: i64,
    pub attempt: i64,
    pub started_at: i64,
    pub success: bool,
    pub response_code: Option<String>,
    pub message: Option<String>,
    pub latency_ms: i64,
}

/// A stored chunk. Identity is (document, seq); the externally visible
/// identifier also embeds the owning content hash so identifiers from one
/// revision can never alias another revision's content.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub id: Option<i64>,
    pub document_id: i64,
    pub seq: i64,
    pub content: String,
    pub page_start: Option<i64>,
    pub page_end: Option<i64>,
    pub section: Option<String>,
    pub kb_code: String,
    pub doc_hash: ContentHash,
    pub embedding: Option<Vec<half::f16>>,
    pub vector_ref: Option<String>,
}

impl ChunkRecord {
    /// Opaque caller-facing chunk identifier.
    pub fn external_id(&self) -> String {
        format!("{}:{}", hex::encode(&self.doc_hash[..8]), self.seq)
    }
}

/// Aggregate counts over the store, for status output.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub documents: usize,
    pub batches: usize,
    pub scheduled_jobs: usize,
    pub chunks: usize,
    pub embedded_chunks: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for status in [
            DocumentStatus::Unparsed,
            DocumentStatus::Parsed,
            DocumentStatus::Vectorized,
        ] {
            assert_eq!(DocumentStatus::parse(status.as_str()).unwrap(), status);
        }
        for status in [
            BatchStatus::Submitted,
            BatchStatus::Retrieved,
            BatchStatus::Completed,
            BatchStatus::Failed,
        ] {
            assert_eq!(BatchStatus::parse(status.as_str()).unwrap(), status);
        }
        for status in [
            JobStatus::Scheduled,
            JobStatus::InProgress,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(DocumentStatus::parse("2").is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(BatchStatus::Completed.is_terminal());
        assert!(BatchStatus::Failed.is_terminal());
        assert!(!BatchStatus::Submitted.is_terminal());
        assert!(!BatchStatus::Retrieved.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Scheduled.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
    }

    #[test]
    fn external_chunk_ids_embed_the_content_hash() {
        let mut hash = [0u8; 32];
        hash[0] = 0xab;
        let chunk = ChunkRecord {
            id: Some(1),
            document_id: 1,
            seq: 3,
            content: "text".to_string(),
            page_start: None,
            page_end: None,
            section: None,
            kb_code: "kb1".to_string(),
            doc_hash: hash,
            embedding: None,
            vector_ref: None,
        };
        let id = chunk.external_id();
        assert!(id.starts_with("ab"));
        assert!(id.ends_with(":3"));
    }
}
