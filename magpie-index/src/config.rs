//! Ingestion configuration.
//!
//! One explicit structure with named, typed fields and documented defaults,
//! passed by reference into the orchestrator and retriever at construction.
//! Nothing reads an untyped options map at runtime.

use anyhow::{Context, Result};
use magpie_chunk::ChunkerConfig;
use magpie_parse::ParseApiConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Retry policy for result polling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Poll attempts before a job is declared failed. Default 5.
    pub max_attempts: u32,
    /// Base retry interval in seconds. Default 60.
    pub base_interval_secs: i64,
    /// Upper bound on any single backoff delay, in seconds. Default 3600.
    pub cap_secs: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_interval_secs: 60,
            cap_secs: 3600,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay as a pure function of the attempt exponent:
    /// `min(base * 2^attempt, cap)` seconds.
    ///
    /// The scheduler passes `completed_attempts - 1` here, so the first
    /// retry lands after exactly the base interval.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.min(30);
        let secs = self
            .base_interval_secs
            .saturating_mul(1i64 << shift)
            .min(self.cap_secs)
            .max(0);
        Duration::from_secs(secs as u64)
    }
}

/// Top-level ingestion configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Scheduler tick interval in seconds. Default 60.
    pub tick_interval_secs: u64,
    /// Upper bound on concurrent result polls per tick. Default 4.
    pub max_concurrent_polls: usize,
    /// Delay between submission and the first poll, in seconds. Default 60.
    pub initial_poll_delay_secs: i64,
    /// Result-poll retry policy.
    pub retry: RetryPolicy,
    /// A claim older than this is considered abandoned and reclaimable,
    /// in seconds. Default 600.
    pub claim_stale_after_secs: i64,
    /// Chunk boundary policy.
    pub chunking: ChunkerConfig,
    /// Vector search over-fetch multiplier: `k' = k * overfetch_factor`.
    /// Default 4.
    pub overfetch_factor: usize,
    /// Rank-fusion damping constant. Default 60.
    pub rrf_constant: u32,
    /// Files larger than this are rejected up front, in bytes. Default 50 MiB.
    pub max_file_size: u64,
    /// Directory parsed results (markdown + assets) are unpacked into.
    pub result_dir: PathBuf,
    /// External parsing provider settings.
    pub parser: ParseApiConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            max_concurrent_polls: 4,
            initial_poll_delay_secs: 60,
            retry: RetryPolicy::default(),
            claim_stale_after_secs: 600,
            chunking: ChunkerConfig::default(),
            overfetch_factor: 4,
            rrf_constant: 60,
            max_file_size: 50 * 1024 * 1024,
            result_dir: PathBuf::from("parsed_results"),
            parser: ParseApiConfig::default(),
        }
    }
}

impl IngestConfig {
    pub fn with_result_dir(mut self, dir: PathBuf) -> Self {
        self.result_dir = dir;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval_secs = interval.as_secs().max(1);
        self
    }

    pub fn with_max_concurrent_polls(mut self, polls: usize) -> Self {
        self.max_concurrent_polls = polls.max(1);
        self
    }

    pub fn with_parser(mut self, parser: ParseApiConfig) -> Self {
        self.parser = parser;
        self
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    /// Parse a configuration from TOML text. Missing tables fall back to
    /// the documented defaults via serde defaults on the full structure.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid ingest configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_pure_and_capped() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.backoff_delay(0), Duration::from_secs(60));
        assert_eq!(retry.backoff_delay(1), Duration::from_secs(120));
        assert_eq!(retry.backoff_delay(2), Duration::from_secs(240));
        assert_eq!(retry.backoff_delay(3), Duration::from_secs(480));
        assert_eq!(retry.backoff_delay(4), Duration::from_secs(960));
        // Beyond the cap every delay is the cap.
        assert_eq!(retry.backoff_delay(6), Duration::from_secs(3600));
        assert_eq!(retry.backoff_delay(30), Duration::from_secs(3600));
        // Deterministic: same inputs, same answer.
        assert_eq!(retry.backoff_delay(2), retry.backoff_delay(2));
    }

    #[test]
    fn backoff_does_not_overflow_on_huge_attempts() {
        let retry = RetryPolicy {
            max_attempts: 5,
            base_interval_secs: i64::MAX / 2,
            cap_secs: 3600,
        };
        assert_eq!(retry.backoff_delay(u32::MAX), Duration::from_secs(3600));
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let config = IngestConfig::default();
        assert_eq!(config.tick_interval_secs, 60);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_interval_secs, 60);
        assert_eq!(config.retry.cap_secs, 3600);
        assert_eq!(config.rrf_constant, 60);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = IngestConfig::default();
        let text = toml::to_string(&config).unwrap();
        let parsed = IngestConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.tick_interval_secs, config.tick_interval_secs);
        assert_eq!(parsed.retry.max_attempts, config.retry.max_attempts);
        assert_eq!(parsed.chunking.target_size, config.chunking.target_size);
    }
}
