// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Unified error taxonomy with stable error codes for refbase.
//!
//! Every error carries a category, a stable machine-readable code of the form
//! `RB-X###`, and a human-readable detail string. The taxonomy is shared by
//! all crates in the workspace so that retry classification and HTTP status
//! mapping live in exactly one place.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Import pipeline errors.
    Ingest,
    /// Deduplication engine errors.
    Dedup,
    /// Enhancement dispatch errors.
    Dispatch,
    /// Search / percolation store errors.
    Search,
    /// Authoritative store errors.
    Store,
    /// Blob storage errors.
    Blob,
    /// Message bus errors.
    Bus,
    /// Robot communication errors.
    Robot,
    /// Configuration errors.
    Config,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ingest => "ingest",
            Self::Dedup => "dedup",
            Self::Dispatch => "dispatch",
            Self::Search => "search",
            Self::Store => "store",
            Self::Blob => "blob",
            Self::Bus => "bus",
            Self::Robot => "robot",
            Self::Config => "config",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// RepoError
// ---------------------------------------------------------------------------

/// The workspace-wide error type.
///
/// Variants map 1:1 onto the failure modes of the reference lifecycle. The
/// import pipeline consults [`RepoError::is_transient`] to decide whether a
/// batch is eligible for another attempt; the HTTP layer consults
/// [`RepoError::status`] for the response status.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepoError {
    /// An expected row or document is absent.
    #[error("{entity} not found: {lookup}")]
    NotFound {
        /// The entity kind that was looked up.
        entity: &'static str,
        /// Human-readable lookup description (id, name, ...).
        lookup: String,
    },

    /// A uniqueness or referential invariant was violated.
    ///
    /// Frequently caused by concurrent inserts on the same identifier, which
    /// is why this class is retried a bounded number of times during batch
    /// processing.
    #[error("integrity violation on {entity}: {collision}")]
    Integrity {
        /// The entity kind the violation occurred on.
        entity: &'static str,
        /// Details of the violated constraint.
        collision: String,
    },

    /// Wire data did not validate against the expected shape.
    #[error("invalid payload: {detail}")]
    InvalidPayload {
        /// Field-level validation detail.
        detail: String,
    },

    /// A line or document could not be parsed at all.
    #[error("parse error: {detail}")]
    Parse {
        /// Parser diagnostic.
        detail: String,
    },

    /// Wire data parsed but could not be converted into the domain model.
    #[error("wire-to-domain conversion failed: {detail}")]
    WireToDomain {
        /// Conversion diagnostic, field-by-field.
        detail: String,
    },

    /// The search store rejected a document.
    #[error("search store rejected document: {detail}")]
    SearchMalformed {
        /// Rejection detail.
        detail: String,
    },

    /// The search store rejected a query.
    #[error("search query rejected: {detail}")]
    SearchQuery {
        /// Rejection detail.
        detail: String,
    },

    /// A robot could not be reached or answered 5xx. Transient; the
    /// enhancement request moves to `failed` and an operator may retry.
    #[error("robot unreachable: {detail}")]
    RobotUnreachable {
        /// Transport or status detail.
        detail: String,
    },

    /// A robot answered 4xx. Permanent; carries the robot's response text.
    #[error("robot rejected enhancement request: {detail}")]
    RobotEnhancement {
        /// The robot's response body.
        detail: String,
    },

    /// A deduplication invariant was violated.
    #[error("deduplication error: {detail}")]
    Deduplication {
        /// Invariant diagnostic.
        detail: String,
    },

    /// Projecting a reference into the search store failed.
    #[error("projection error: {detail}")]
    Projection {
        /// Projection diagnostic.
        detail: String,
    },

    /// A unit-of-work invariant was violated (e.g. commit-ordering misuse).
    #[error("unit of work error: {detail}")]
    UnitOfWork {
        /// Diagnostic.
        detail: String,
    },

    /// Blob storage failure.
    #[error("blob storage error: {detail}")]
    Blob {
        /// Storage diagnostic.
        detail: String,
    },

    /// Message bus failure. Lock losses are classified transient.
    #[error("message bus error: {detail}")]
    Bus {
        /// Bus diagnostic.
        detail: String,
        /// Whether the failure was a lock loss (redeliverable).
        lock_lost: bool,
    },

    /// The configuration is invalid or incomplete.
    #[error("configuration error: {detail}")]
    Config {
        /// Validation diagnostic.
        detail: String,
    },

    /// A conflicting state transition was requested.
    #[error("{detail}")]
    Conflict {
        /// Conflict description, surfaced verbatim to callers.
        detail: String,
    },

    /// An unexpected internal error.
    #[error("internal error: {detail}")]
    Internal {
        /// Diagnostic.
        detail: String,
    },
}

impl RepoError {
    /// Shorthand for a [`RepoError::NotFound`].
    pub fn not_found(entity: &'static str, lookup: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            lookup: lookup.into(),
        }
    }

    /// Shorthand for a [`RepoError::Integrity`].
    pub fn integrity(entity: &'static str, collision: impl Into<String>) -> Self {
        Self::Integrity {
            entity,
            collision: collision.into(),
        }
    }

    /// Shorthand for a [`RepoError::InvalidPayload`].
    pub fn invalid_payload(detail: impl Into<String>) -> Self {
        Self::InvalidPayload {
            detail: detail.into(),
        }
    }

    /// Shorthand for a [`RepoError::Conflict`].
    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::Conflict {
            detail: detail.into(),
        }
    }

    /// Shorthand for a [`RepoError::Internal`].
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::Internal {
            detail: detail.into(),
        }
    }

    /// The category this error belongs to.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } | Self::Integrity { .. } | Self::UnitOfWork { .. } => {
                ErrorCategory::Store
            }
            Self::InvalidPayload { .. } | Self::Parse { .. } | Self::WireToDomain { .. } => {
                ErrorCategory::Ingest
            }
            Self::SearchMalformed { .. } | Self::SearchQuery { .. } => ErrorCategory::Search,
            Self::RobotUnreachable { .. } | Self::RobotEnhancement { .. } => ErrorCategory::Robot,
            Self::Deduplication { .. } => ErrorCategory::Dedup,
            Self::Projection { .. } => ErrorCategory::Search,
            Self::Blob { .. } => ErrorCategory::Blob,
            Self::Bus { .. } => ErrorCategory::Bus,
            Self::Config { .. } => ErrorCategory::Config,
            Self::Conflict { .. } => ErrorCategory::Dispatch,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Stable machine-readable code (e.g. `"RB-S002"`).
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "RB-S001",
            Self::Integrity { .. } => "RB-S002",
            Self::UnitOfWork { .. } => "RB-S003",
            Self::InvalidPayload { .. } => "RB-I001",
            Self::Parse { .. } => "RB-I002",
            Self::WireToDomain { .. } => "RB-I003",
            Self::SearchMalformed { .. } => "RB-E001",
            Self::SearchQuery { .. } => "RB-E002",
            Self::Projection { .. } => "RB-E003",
            Self::RobotUnreachable { .. } => "RB-R001",
            Self::RobotEnhancement { .. } => "RB-R002",
            Self::Deduplication { .. } => "RB-D001",
            Self::Conflict { .. } => "RB-D002",
            Self::Blob { .. } => "RB-B001",
            Self::Bus { .. } => "RB-B002",
            Self::Config { .. } => "RB-C001",
            Self::Internal { .. } => "RB-X001",
        }
    }

    /// Whether this error class is eligible for bounded retry.
    ///
    /// Integrity collisions (concurrent inserts on the same identifier), bus
    /// lock losses and unreachable robots are transient; validation failures
    /// and robot rejections are terminal.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Integrity { .. } | Self::Bus { lock_lost: true, .. } | Self::RobotUnreachable { .. }
        )
    }

    /// HTTP status code this error surfaces as.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::Integrity { .. } | Self::Conflict { .. } => 409,
            Self::InvalidPayload { .. } | Self::Parse { .. } | Self::WireToDomain { .. } => 422,
            Self::SearchMalformed { .. } | Self::SearchQuery { .. } => 400,
            Self::RobotUnreachable { .. } | Self::RobotEnhancement { .. } => 502,
            Self::Deduplication { .. }
            | Self::Projection { .. }
            | Self::UnitOfWork { .. }
            | Self::Blob { .. }
            | Self::Bus { .. }
            | Self::Config { .. }
            | Self::Internal { .. } => 500,
        }
    }

    /// The detail string surfaced to clients alongside the code.
    #[must_use]
    pub fn detail(&self) -> String {
        self.to_string()
    }
}

/// Convenience alias used across the workspace.
pub type RepoResult<T> = Result<T, RepoError>;

// ---------------------------------------------------------------------------
// Wire body
// ---------------------------------------------------------------------------

/// Serializable error body for HTTP responses and per-line failure records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    /// Stable machine code (`RB-X###`).
    pub code: String,
    /// Error category.
    pub category: ErrorCategory,
    /// Human-readable detail.
    pub detail: String,
}

impl From<&RepoError> for ErrorBody {
    fn from(err: &RepoError) -> Self {
        Self {
            code: err.code().to_string(),
            category: err.category(),
            detail: err.detail(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrity_is_transient_and_conflicts() {
        let err = RepoError::integrity("identifier", "duplicate (doi, 10.1/x)");
        assert!(err.is_transient());
        assert_eq!(err.status(), 409);
        assert_eq!(err.code(), "RB-S002");
    }

    #[test]
    fn validation_failures_are_terminal() {
        let err = RepoError::invalid_payload("identifiers must be non-empty");
        assert!(!err.is_transient());
        assert_eq!(err.status(), 422);
    }

    #[test]
    fn bus_lock_loss_is_transient_but_other_bus_errors_are_not() {
        let lost = RepoError::Bus {
            detail: "lock lost during renewal".into(),
            lock_lost: true,
        };
        let other = RepoError::Bus {
            detail: "queue closed".into(),
            lock_lost: false,
        };
        assert!(lost.is_transient());
        assert!(!other.is_transient());
    }

    #[test]
    fn robot_errors_split_transient_permanent() {
        let unreachable = RepoError::RobotUnreachable {
            detail: "connect timeout".into(),
        };
        let rejected = RepoError::RobotEnhancement {
            detail: "unsupported reference shape".into(),
        };
        assert!(unreachable.is_transient());
        assert!(!rejected.is_transient());
    }

    #[test]
    fn error_body_round_trips() {
        let err = RepoError::not_found("reference", "0198c0de");
        let body = ErrorBody::from(&err);
        let json = serde_json::to_string(&body).unwrap();
        let back: ErrorBody = serde_json::from_str(&json).unwrap();
        assert_eq!(body, back);
        assert_eq!(back.code, "RB-S001");
    }
}
