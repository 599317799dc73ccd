//! Provider contract and HTTP client.
//!
//! Submission is a two-phase exchange: the provider acknowledges a batch
//! and returns an upload URL, then the document bytes are PUT to that URL.
//! The phases are exposed separately on [`ParseProvider`] so the caller can
//! persist the provider-assigned batch identifier *between* them — losing
//! the identifier after a successful acknowledgement is the one failure the
//! orchestration design must make structurally impossible.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ParseApiConfig;
use crate::error::{ParseError, Result};

/// A single-document submission to the provider.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// Original file name, shown back by the provider in results.
    pub file_name: String,
    /// Caller-chosen correlation id echoed in poll results.
    pub data_id: String,
}

/// Provider acknowledgement of a submission.
///
/// `batch_id` is opaque and provider-assigned; it is the only key under
/// which results can ever be retrieved.
#[derive(Debug, Clone)]
pub struct SubmitAck {
    pub batch_id: String,
    pub upload_url: String,
}

/// Outcome of one result poll.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// The provider is still working; try again later.
    NotReady,
    /// The result archive is ready at the given URL.
    Ready { result_url: String },
    /// The provider reported a failure for this document. `permanent`
    /// distinguishes unrecoverable document problems from conditions worth
    /// retrying.
    Failed { message: String, permanent: bool },
}

/// The narrow contract the orchestrator drives. Everything here is blocking
/// I/O with the configured timeout; a timeout surfaces as a transient error.
#[async_trait]
pub trait ParseProvider: Send + Sync {
    /// Register a document for parsing. Returns the provider-assigned batch
    /// identifier and the URL the content must be uploaded to.
    async fn submit(&self, request: &SubmitRequest) -> Result<SubmitAck>;

    /// Upload the document bytes for an acknowledged submission.
    async fn upload(&self, ack: &SubmitAck, content: Vec<u8>) -> Result<()>;

    /// Ask whether results for a batch are ready.
    async fn poll(&self, batch_id: &str) -> Result<PollOutcome>;

    /// Download a ready result archive.
    async fn fetch(&self, result_url: &str) -> Result<Vec<u8>>;
}

#[derive(Serialize)]
struct FileEntry<'a> {
    name: &'a str,
    is_ocr: bool,
    data_id: &'a str,
    language: &'a str,
}

#[derive(Serialize)]
struct SubmitBody<'a> {
    enable_formula: bool,
    language: &'a str,
    layout_model: &'a str,
    enable_table: bool,
    files: Vec<FileEntry<'a>>,
}

#[derive(Deserialize)]
struct Envelope<T> {
    code: i64,
    msg: Option<String>,
    data: Option<T>,
}

#[derive(Deserialize)]
struct SubmitData {
    batch_id: String,
    file_urls: Vec<String>,
}

#[derive(Deserialize)]
struct BatchResults {
    extract_result: Vec<ExtractItem>,
}

#[derive(Deserialize)]
struct ExtractItem {
    #[serde(default)]
    state: String,
    #[serde(default)]
    full_zip_url: Option<String>,
    #[serde(default)]
    err_msg: Option<String>,
}

/// HTTP implementation of [`ParseProvider`] for the provider's batch API:
/// `POST {base}/file-urls/batch` to register, PUT to the returned URL to
/// upload, `GET {base}/extract-results/batch/{id}` to poll.
#[derive(Debug, Clone)]
pub struct HttpParseProvider {
    client: Client,
    config: ParseApiConfig,
}

impl HttpParseProvider {
    pub fn new(config: ParseApiConfig) -> Result<Self> {
        config.validate()?;
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self { client, config })
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.config.api_key)
    }
}

#[async_trait]
impl ParseProvider for HttpParseProvider {
    async fn submit(&self, request: &SubmitRequest) -> Result<SubmitAck> {
        let body = SubmitBody {
            enable_formula: self.config.enable_formula,
            language: &self.config.language,
            layout_model: &self.config.layout_model,
            enable_table: self.config.enable_table,
            files: vec![FileEntry {
                name: &request.file_name,
                is_ocr: self.config.is_ocr,
                data_id: &request.data_id,
                language: &self.config.language,
            }],
        };

        let url = format!("{}/file-urls/batch", self.config.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", self.bearer())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("submission rejected with status {status}");
            return Err(if status.is_server_error() {
                ParseError::transient(message)
            } else {
                ParseError::permanent(message)
            });
        }

        let envelope: Envelope<SubmitData> = response.json().await?;
        if envelope.code != 0 {
            return Err(ParseError::permanent(format!(
                "submission refused by provider (code {}): {}",
                envelope.code,
                envelope.msg.unwrap_or_else(|| "unknown error".to_string())
            )));
        }

        let data = envelope
            .data
            .ok_or_else(|| ParseError::permanent("submission response carried no data"))?;
        let upload_url = data
            .file_urls
            .into_iter()
            .next()
            .ok_or_else(|| ParseError::permanent("submission response carried no upload url"))?;

        debug!(batch_id = %data.batch_id, file = %request.file_name, "provider accepted submission");
        Ok(SubmitAck {
            batch_id: data.batch_id,
            upload_url,
        })
    }

    async fn upload(&self, ack: &SubmitAck, content: Vec<u8>) -> Result<()> {
        let response = self.client.put(&ack.upload_url).body(content).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ParseError::transient(format!(
                "content upload for batch {} failed with status {status}",
                ack.batch_id
            )));
        }
        debug!(batch_id = %ack.batch_id, "content uploaded");
        Ok(())
    }

    async fn poll(&self, batch_id: &str) -> Result<PollOutcome> {
        let url = format!("{}/extract-results/batch/{batch_id}", self.config.base_url);
        let response = self
            .client
            .get(&url)
            .header("Authorization", self.bearer())
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Err(ParseError::permanent(format!(
                "provider does not know batch {batch_id}"
            )));
        }
        if !status.is_success() {
            return Err(ParseError::transient(format!(
                "result poll for batch {batch_id} failed with status {status}"
            )));
        }

        let envelope: Envelope<BatchResults> = response.json().await?;
        if envelope.code != 0 {
            return Err(ParseError::transient(format!(
                "result poll refused (code {}): {}",
                envelope.code,
                envelope.msg.unwrap_or_else(|| "unknown error".to_string())
            )));
        }

        let results = envelope
            .data
            .map(|d| d.extract_result)
            .unwrap_or_default();

        // Single-document batches: the first entry is the one we asked for.
        let Some(item) = results.into_iter().next() else {
            return Ok(PollOutcome::NotReady);
        };

        match item.state.as_str() {
            "done" => match item.full_zip_url {
                Some(result_url) => Ok(PollOutcome::Ready { result_url }),
                None => {
                    warn!(batch_id, "provider reported done without a result url");
                    Ok(PollOutcome::NotReady)
                }
            },
            "failed" => Ok(PollOutcome::Failed {
                message: item
                    .err_msg
                    .unwrap_or_else(|| "provider reported failure without detail".to_string()),
                permanent: true,
            }),
            _ => Ok(PollOutcome::NotReady),
        }
    }

    async fn fetch(&self, result_url: &str) -> Result<Vec<u8>> {
        let response = self.client.get(result_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ParseError::transient(format!(
                "result download failed with status {status}"
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_outcome_equality() {
        assert_eq!(PollOutcome::NotReady, PollOutcome::NotReady);
        assert_ne!(
            PollOutcome::NotReady,
            PollOutcome::Ready {
                result_url: "https://example.invalid/r.zip".to_string()
            }
        );
    }

    #[test]
    fn provider_rejects_unconfigured_key() {
        let result = HttpParseProvider::new(ParseApiConfig::default());
        assert!(matches!(result, Err(ParseError::Input { .. })));
    }

    #[test]
    fn submit_body_wire_shape() {
        let body = SubmitBody {
            enable_formula: true,
            language: "ch",
            layout_model: "doclayout_yolo",
            enable_table: true,
            files: vec![FileEntry {
                name: "a.pdf",
                is_ocr: true,
                data_id: "a-1",
                language: "ch",
            }],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["enable_formula"], true);
        assert_eq!(json["files"][0]["name"], "a.pdf");
        assert_eq!(json["files"][0]["data_id"], "a-1");
    }

    #[test]
    fn poll_response_parses_provider_states() {
        let raw = r#"{
            "code": 0,
            "data": {
                "extract_result": [
                    {"file_name": "a.pdf", "state": "done",
                     "full_zip_url": "https://example.invalid/a.zip", "data_id": "a-1"}
                ]
            }
        }"#;
        let envelope: Envelope<BatchResults> = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.code, 0);
        let mut data = envelope.data.unwrap();
        let item = data.extract_result.remove(0);
        assert_eq!(item.state, "done");
        assert_eq!(
            item.full_zip_url.as_deref(),
            Some("https://example.invalid/a.zip")
        );
    }
}
