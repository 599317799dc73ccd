//! magpie-index: document ingestion orchestration and hybrid retrieval.
//!
//! This crate tracks enterprise documents through an asynchronous external
//! parsing provider, slices and embeds the parsed content, and answers
//! queries by fusing keyword and vector rankings.
//!
//! ## Key Modules
//!
//! - **[`store`]**: the durable five-entity processing state (documents,
//!   parse batches, retrieval jobs, attempts, chunks) with conditional
//!   compare-and-set transitions
//! - **[`orchestrator`]**: the submit → poll → retrieve → retry-with-backoff
//!   state machine and its tick-driven scheduler
//! - **[`scanner`]**: read-only change detection (new / modified / removed)
//! - **[`pipeline`]**: chunk boundary policy application, embedding, and
//!   delete-then-write chunk replacement
//! - **[`search`]**: BM25 + vector retrieval fused by reciprocal rank
//! - **[`service`]**: the caller-facing operations (request processing,
//!   status, removal, query)
//!
//! ## Architecture
//!
//! ```text
//! ChangeDetector → ParseOrchestrator → (external parser)
//!                        ↓ scheduler ticks, claims, backoff
//!                   JobStore (SQLite)
//!                        ↓ parsed markdown
//!              ChunkEmbedPipeline → lexical + vector indices
//!                                          ↓
//!                                   HybridRetriever → ranked chunks
//! ```

pub mod clock;
pub mod config;
pub mod embed;
pub mod orchestrator;
pub mod pipeline;
pub mod scanner;
pub mod search;
pub mod service;
pub mod store;
