// SPDX-License-Identifier: MIT OR Apache-2.0
//! Enhancement requests and their derived status.

use crate::pending::PendingEnhancementStatus;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A request for one robot to enrich a set of references.
///
/// Status is not stored: it is derived from the statuses of the request's
/// pending enhancements via [`EnhancementRequestStatus::derive`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EnhancementRequest {
    /// Row id.
    pub id: Uuid,
    /// The references to enhance.
    pub reference_ids: Vec<Uuid>,
    /// The robot to request the enhancement from.
    pub robot_id: Uuid,
    /// Where the request came from (an operator, `robot-automation`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Scheduling priority; higher polls first.
    #[serde(default)]
    pub priority: i32,
    /// Opaque parameters passed through to the robot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enhancement_parameters: Option<serde_json::Value>,
    /// Procedural error affecting the whole request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The robot's response text when it permanently rejected the request.
    /// A recorded rejection overrides the derived status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl EnhancementRequest {
    /// Create a request for a robot over a set of references.
    #[must_use]
    pub fn new(robot_id: Uuid, reference_ids: Vec<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            reference_ids,
            robot_id,
            source: None,
            priority: 0,
            enhancement_parameters: None,
            error: None,
            rejection: None,
            created_at: Utc::now(),
        }
    }

    /// Set the request source.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set the scheduling priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Derived status of an enhancement request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EnhancementRequestStatus {
    /// Received; no pending enhancements materialized yet.
    Received,
    /// Work is queued or leased and nothing has failed.
    Accepted,
    /// The robot permanently rejected the request (4xx); the robot's
    /// response text is recorded on the request.
    Rejected,
    /// Results are being imported.
    Importing,
    /// Imported enhancements are being indexed.
    Indexing,
    /// Some work failed and some completed.
    PartialFailed,
    /// All work failed or expired.
    Failed,
    /// All work completed.
    Completed,
}

impl EnhancementRequestStatus {
    /// Derive the request status from the multiset of its pending-enhancement
    /// statuses. First match wins:
    ///
    /// 1. no rows → `received`
    /// 2. all completed → `completed`
    /// 3. any pending/processing and no failures → `accepted`
    /// 4. any importing → `importing`
    /// 5. any indexing → `indexing`
    /// 6. any failure and any completion → `partial_failed`
    /// 7. all failed/expired → `failed`
    /// 8. otherwise (failures mixed with in-flight work) → `partial_failed`
    ///
    /// `indexing_failed` counts as a failure. A permanent robot rejection is
    /// not derivable from row statuses; it is recorded on the request and
    /// overrides this derivation (see the store's status lookup).
    #[must_use]
    pub fn derive(statuses: &[PendingEnhancementStatus]) -> Self {
        use PendingEnhancementStatus as P;

        if statuses.is_empty() {
            return Self::Received;
        }
        let any = |pred: fn(&P) -> bool| statuses.iter().any(|s| pred(s));
        let all = |pred: fn(&P) -> bool| statuses.iter().all(|s| pred(s));

        let is_failure =
            |s: &P| matches!(s, P::Failed | P::Expired | P::IndexingFailed);

        if all(|s| matches!(s, P::Completed)) {
            return Self::Completed;
        }
        if any(|s| matches!(s, P::Pending | P::Processing))
            && !statuses.iter().any(is_failure)
        {
            return Self::Accepted;
        }
        if any(|s| matches!(s, P::Importing)) {
            return Self::Importing;
        }
        if any(|s| matches!(s, P::Indexing)) {
            return Self::Indexing;
        }
        if statuses.iter().any(is_failure) && any(|s| matches!(s, P::Completed)) {
            return Self::PartialFailed;
        }
        if statuses.iter().all(is_failure) {
            return Self::Failed;
        }
        Self::PartialFailed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PendingEnhancementStatus as P;

    #[test]
    fn empty_is_received() {
        assert_eq!(
            EnhancementRequestStatus::derive(&[]),
            EnhancementRequestStatus::Received
        );
    }

    #[test]
    fn all_completed() {
        assert_eq!(
            EnhancementRequestStatus::derive(&[P::Completed, P::Completed]),
            EnhancementRequestStatus::Completed
        );
    }

    #[test]
    fn in_flight_without_failures_is_accepted() {
        assert_eq!(
            EnhancementRequestStatus::derive(&[P::Pending, P::Completed]),
            EnhancementRequestStatus::Accepted
        );
        assert_eq!(
            EnhancementRequestStatus::derive(&[P::Processing]),
            EnhancementRequestStatus::Accepted
        );
    }

    #[test]
    fn importing_and_indexing() {
        assert_eq!(
            EnhancementRequestStatus::derive(&[P::Importing, P::Completed]),
            EnhancementRequestStatus::Importing
        );
        assert_eq!(
            EnhancementRequestStatus::derive(&[P::Indexing, P::Completed]),
            EnhancementRequestStatus::Indexing
        );
    }

    #[test]
    fn partial_and_full_failure() {
        assert_eq!(
            EnhancementRequestStatus::derive(&[P::Failed, P::Completed]),
            EnhancementRequestStatus::PartialFailed
        );
        assert_eq!(
            EnhancementRequestStatus::derive(&[P::Failed, P::Expired]),
            EnhancementRequestStatus::Failed
        );
    }

    #[test]
    fn failure_mixed_with_in_flight_is_partial() {
        assert_eq!(
            EnhancementRequestStatus::derive(&[P::Failed, P::Pending]),
            EnhancementRequestStatus::PartialFailed
        );
    }

    #[test]
    fn indexing_failed_counts_as_failure() {
        assert_eq!(
            EnhancementRequestStatus::derive(&[P::IndexingFailed, P::IndexingFailed]),
            EnhancementRequestStatus::Failed
        );
    }
}
