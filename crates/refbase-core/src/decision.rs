// SPDX-License-Identifier: MIT OR Apache-2.0
//! Duplicate determinations and their audit trail.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome of deduplicating a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateDetermination {
    /// The chosen representative for its cluster. Points at no one.
    Canonical,
    /// A duplicate of some canonical reference.
    Duplicate,
    /// Byte-for-byte equivalent to an existing canonical after normalized
    /// projection; the incoming reference row is not retained.
    ExactDuplicate,
    /// Insufficient data (no title or year) to judge.
    Unsearchable,
    /// Not yet evaluated.
    Unresolved,
}

impl DuplicateDetermination {
    /// Whether this determination makes the reference eligible as a candidate
    /// canonical for future deduplication.
    #[must_use]
    pub fn is_at_rest_canonical(&self) -> bool {
        matches!(self, Self::Canonical)
    }
}

/// One decision row for a reference.
///
/// Exactly one decision per reference has `active_decision = true` at any
/// time; superseded rows are retained (inactive) for audit. A duplicate's
/// `canonical_reference_id` must resolve to a reference whose active decision
/// is canonical at that instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ReferenceDuplicateDecision {
    /// Row id.
    pub id: Uuid,
    /// The reference the decision is about.
    pub reference_id: Uuid,
    /// The determination.
    pub determination: DuplicateDetermination,
    /// The canonical this reference duplicates, when `determination` is
    /// `duplicate` or `exact_duplicate`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_reference_id: Option<Uuid>,
    /// Non-winning candidates considered during scoring, kept for audit.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidate_canonical_ids: Vec<Uuid>,
    /// Whether this is the reference's active decision.
    pub active_decision: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl ReferenceDuplicateDecision {
    /// Create an active decision row.
    #[must_use]
    pub fn active(reference_id: Uuid, determination: DuplicateDetermination) -> Self {
        Self {
            id: Uuid::new_v4(),
            reference_id,
            determination,
            canonical_reference_id: None,
            candidate_canonical_ids: Vec::new(),
            active_decision: true,
            created_at: Utc::now(),
        }
    }

    /// Set the canonical target.
    #[must_use]
    pub fn with_canonical(mut self, canonical_reference_id: Uuid) -> Self {
        self.canonical_reference_id = Some(canonical_reference_id);
        self
    }

    /// Attach the audit trail of non-winning candidates.
    #[must_use]
    pub fn with_candidates(mut self, candidate_canonical_ids: Vec<Uuid>) -> Self {
        self.candidate_canonical_ids = candidate_canonical_ids;
        self
    }
}
