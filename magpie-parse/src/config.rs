//! Provider API configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ParseError, Result};

/// Default provider API root.
pub const DEFAULT_BASE_URL: &str = "https://mineru.net/api/v4";
/// Default per-request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Configuration for the external parsing provider.
///
/// One explicit structure with named, typed fields — feature flags that the
/// provider accepts per submission live here rather than in an untyped
/// options map. Defaults match what the provider recommends for mixed
/// scanned/digital enterprise documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseApiConfig {
    /// API root, e.g. `https://mineru.net/api/v4`.
    pub base_url: String,
    /// Bearer token for the provider API.
    pub api_key: String,
    /// Enable formula recognition in parsed output.
    pub enable_formula: bool,
    /// Enable table recognition in parsed output.
    pub enable_table: bool,
    /// Run OCR on scanned pages.
    pub is_ocr: bool,
    /// Document language hint passed to the provider.
    pub language: String,
    /// Layout analysis model requested from the provider.
    pub layout_model: String,
    /// Per-request timeout in seconds; a timed-out call is a transient
    /// failure, never a success.
    pub request_timeout_secs: u64,
}

impl Default for ParseApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: String::new(),
            enable_formula: true,
            enable_table: true,
            is_ocr: true,
            language: "ch".to_string(),
            layout_model: "doclayout_yolo".to_string(),
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl ParseApiConfig {
    pub fn new<S: Into<String>>(api_key: S) -> Self {
        Self {
            api_key: api_key.into(),
            ..Self::default()
        }
    }

    pub fn with_base_url<S: Into<String>>(mut self, base_url: S) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_language<S: Into<String>>(mut self, language: S) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Reject configurations that can never authenticate.
    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(ParseError::input("provider api key is not set"));
        }
        if self.base_url.trim().is_empty() {
            return Err(ParseError::input("provider base url is not set"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_flags_match_provider_recommendations() {
        let config = ParseApiConfig::default();
        assert!(config.enable_formula);
        assert!(config.enable_table);
        assert!(config.is_ocr);
        assert_eq!(config.request_timeout_secs, DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn validate_rejects_missing_key() {
        let config = ParseApiConfig::default();
        assert!(config.validate().is_err());

        let config = ParseApiConfig::new("token");
        assert!(config.validate().is_ok());
    }
}
