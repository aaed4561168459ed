// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Configuration loading, validation, and defaults for refbase.
//!
//! There is no global settings singleton: a [`RepoConfig`] is loaded once and
//! passed into component constructors. Every section has defaults matching
//! the shipped behaviour, so an empty TOML document is a valid configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The TOML document could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// A field failed validation.
    #[error("invalid config: {field}: {reason}")]
    Invalid {
        /// Dotted path of the offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// Serde helper — `Duration` as integer seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(val: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(val.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(de)?;
        Ok(Duration::from_secs(secs))
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Import pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// How many times to retry a batch on classified transient errors before
    /// marking it failed.
    pub batch_retry_depth: u32,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_retry_depth: 3,
        }
    }
}

/// Deduplication scoring thresholds.
///
/// The defaults are the evaluated operating point: precision over recall —
/// a missed duplicate costs less than a false merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Search score at or above which a pair is high confidence (given the
    /// minimum Jaccard below).
    pub es_high_score_threshold: f64,
    /// Minimum search score for the medium-confidence Jaccard check.
    pub es_min_score_threshold: f64,
    /// Jaccard threshold for medium confidence.
    pub jaccard_threshold: f64,
    /// Minimum Jaccard required alongside a high search score.
    pub high_score_min_jaccard: f64,
    /// Maximum source-title token count for the short-title fallback.
    pub short_title_max_tokens: usize,
    /// Minimum search score for the short-title fallback.
    pub short_title_min_es_score: f64,
    /// Minimum Jaccard for the short-title fallback.
    pub short_title_min_jaccard: f64,
    /// Minimum title tokens accepted as DOI-match corroboration when the
    /// source has no authors.
    pub doi_safety_min_title_tokens: usize,
    /// How many candidates to evaluate per source.
    pub top_k: usize,
    /// Maximum author clauses contributed to the candidate query.
    pub max_author_clauses: usize,
    /// Author name tokens shorter than this are dropped (single-letter
    /// initials inflate scores without signal).
    pub min_author_token_length: usize,
    /// Author count above which a paper is treated as a collaboration and
    /// author clauses are skipped entirely.
    pub collaboration_author_threshold: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            es_high_score_threshold: 100.0,
            es_min_score_threshold: 50.0,
            jaccard_threshold: 0.6,
            high_score_min_jaccard: 0.3,
            short_title_max_tokens: 2,
            short_title_min_es_score: 20.0,
            short_title_min_jaccard: 0.99,
            doi_safety_min_title_tokens: 3,
            top_k: 10,
            max_author_clauses: 25,
            min_author_token_length: 2,
            collaboration_author_threshold: 50,
        }
    }
}

/// Enhancement dispatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Hard cap on references per robot batch regardless of the requested
    /// limit.
    pub max_batch_size: usize,
    /// Lease granted when the robot does not request one.
    #[serde(with = "duration_secs")]
    pub default_lease: Duration,
    /// Maximum retry-chain depth before a request is left degraded.
    pub max_retry_depth: u32,
    /// How often the expiry sweeper runs.
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            default_lease: Duration::from_secs(600),
            max_retry_depth: 3,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Search endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Fields a bare query term expands against.
    pub default_fields: Vec<String>,
    /// Results per page.
    pub page_size: usize,
    /// Natural limit on pageable hits: page × page_size may not exceed this.
    pub max_result_window: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_fields: vec!["title".into(), "abstract".into(), "authors".into()],
            page_size: 20,
            max_result_window: 10_000,
        }
    }
}

/// Blob store gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobConfig {
    /// Container artifacts are written into.
    pub container: String,
    /// Key signing time-scoped URLs.
    pub signing_key: String,
    /// How long a signed URL stays valid.
    #[serde(with = "duration_secs")]
    pub signed_url_expiry: Duration,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            container: "refbase".into(),
            signing_key: "insecure-local-signing-key".into(),
            signed_url_expiry: Duration::from_secs(3600),
        }
    }
}

/// Message bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Window past which a task still holding a message lock is abandoned
    /// and the message redelivered. Should exceed the longest expected
    /// processing time.
    #[serde(with = "duration_secs")]
    pub lock_renewal_window: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            lock_renewal_window: Duration::from_secs(3600 * 3),
        }
    }
}

// ---------------------------------------------------------------------------
// RepoConfig
// ---------------------------------------------------------------------------

/// The full configuration, passed into component constructors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    /// Import pipeline section.
    pub import: ImportConfig,
    /// Deduplication section.
    pub dedup: DedupConfig,
    /// Dispatch section.
    pub dispatch: DispatchConfig,
    /// Search section.
    pub search: SearchConfig,
    /// Blob gateway section.
    pub blob: BlobConfig,
    /// Message bus section.
    pub bus: BusConfig,
}

impl RepoConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dedup.top_k == 0 {
            return Err(ConfigError::Invalid {
                field: "dedup.top_k",
                reason: "must be at least 1".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.dedup.jaccard_threshold)
            || !(0.0..=1.0).contains(&self.dedup.high_score_min_jaccard)
            || !(0.0..=1.0).contains(&self.dedup.short_title_min_jaccard)
        {
            return Err(ConfigError::Invalid {
                field: "dedup",
                reason: "jaccard thresholds must be within [0, 1]".into(),
            });
        }
        if self.dispatch.max_batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "dispatch.max_batch_size",
                reason: "must be at least 1".into(),
            });
        }
        if self.search.page_size == 0 {
            return Err(ConfigError::Invalid {
                field: "search.page_size",
                reason: "must be at least 1".into(),
            });
        }
        if self.search.default_fields.is_empty() {
            return Err(ConfigError::Invalid {
                field: "search.default_fields",
                reason: "must name at least one field".into(),
            });
        }
        Ok(())
    }
}
