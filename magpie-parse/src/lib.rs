//! External document-parser collaborator.
//!
//! The ingestion core never converts document formats itself: PDF and
//! office files are handed to an asynchronous third-party parsing provider
//! that converts them to markdown and returns the result as a downloadable
//! archive. This crate holds everything that touches that provider:
//!
//! - [`ParseProvider`]: the narrow contract the orchestrator drives —
//!   submit, upload, poll, fetch. Batch identifiers are always
//!   provider-assigned; nothing in this crate or its callers ever invents
//!   one.
//! - [`HttpParseProvider`]: the production implementation over the
//!   provider's batch HTTP API.
//! - [`extract`]: unpacking of result archives (markdown plus extracted
//!   images).
//! - [`ParseError`]: the error taxonomy the retry machinery keys on —
//!   input errors are rejected up front, transient errors drive backoff,
//!   permanent errors fail fast.

pub mod client;
pub mod config;
pub mod error;
pub mod extract;

pub use client::{HttpParseProvider, ParseProvider, PollOutcome, SubmitAck, SubmitRequest};
pub use config::ParseApiConfig;
pub use error::{ParseError, Result};
pub use extract::{ParsedBundle, UnpackedBundle, extract_bundle, unpack_bundle};
