//! Chunk boundary policy for parsed documents.
//!
//! This crate owns one decision: where a document gets sliced before
//! embedding. It splits markdown (or plain text) into pieces bounded by a
//! target size, preferring structural boundaries — headings, page-break
//! markers, paragraphs — over raw character cuts, and attaches page and
//! section provenance to each piece. Embedding itself happens elsewhere;
//! the pieces produced here are the addressable units the rest of the
//! system stores, indexes, and returns from queries.

pub mod text;

pub use text::{ChunkPiece, ChunkerConfig, StructuralChunker};
