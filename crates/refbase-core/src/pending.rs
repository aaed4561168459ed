// SPDX-License-Identifier: MIT OR Apache-2.0
//! Pending enhancements and the robot batches that lease them.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a single unit of enhancement work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PendingEnhancementStatus {
    /// Waiting to be picked up. Only pending items may be leased.
    Pending,
    /// Leased to a robot batch; the lease timestamp is non-null.
    Processing,
    /// The robot delivered results; the artifact is being imported.
    Importing,
    /// The enhancement was imported and is being indexed.
    Indexing,
    /// The enhancement was imported but indexing failed.
    IndexingFailed,
    /// Done.
    Completed,
    /// Failed terminally.
    Failed,
    /// The lease expired before the robot delivered.
    Expired,
}

impl PendingEnhancementStatus {
    /// Whether this status is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Expired | Self::IndexingFailed
        )
    }

    /// Whether a row in this status holds a live lease.
    #[must_use]
    pub fn is_leased(&self) -> bool {
        matches!(self, Self::Processing | Self::Importing)
    }
}

/// A unit of work: one reference to be enhanced by one robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PendingEnhancement {
    /// Row id.
    pub id: Uuid,
    /// The reference to enhance.
    pub reference_id: Uuid,
    /// The robot expected to do the work.
    pub robot_id: Uuid,
    /// The owning enhancement request.
    pub enhancement_request_id: Uuid,
    /// Provenance string recorded on produced enhancements.
    pub source: String,
    /// Current status.
    pub status: PendingEnhancementStatus,
    /// Lease expiry while leased; cleared otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// The expired row this one retries, forming a retry chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<Uuid>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl PendingEnhancement {
    /// Create a pending unit of work.
    #[must_use]
    pub fn new(
        reference_id: Uuid,
        robot_id: Uuid,
        enhancement_request_id: Uuid,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            reference_id,
            robot_id,
            enhancement_request_id,
            source: source.into(),
            status: PendingEnhancementStatus::Pending,
            expires_at: None,
            retry_of: None,
            created_at: Utc::now(),
        }
    }

    /// Create the retry sibling of an expired row.
    #[must_use]
    pub fn retry_sibling(expired: &PendingEnhancement) -> Self {
        Self {
            id: Uuid::new_v4(),
            reference_id: expired.reference_id,
            robot_id: expired.robot_id,
            enhancement_request_id: expired.enhancement_request_id,
            source: expired.source.clone(),
            status: PendingEnhancementStatus::Pending,
            expires_at: None,
            retry_of: Some(expired.id),
            created_at: Utc::now(),
        }
    }
}

/// Lifecycle of a leased robot batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RobotEnhancementBatchStatus {
    /// Leased out, awaiting results.
    Pending,
    /// All member work reached a terminal state.
    Completed,
    /// The robot reported a terminal error for the whole batch.
    Failed,
}

/// A batched lease: the references handed to a robot in one poll.
///
/// A pending enhancement belongs to at most one non-terminal batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RobotEnhancementBatch {
    /// Row id.
    pub id: Uuid,
    /// The robot that leased this batch.
    pub robot_id: Uuid,
    /// Batch status.
    pub status: RobotEnhancementBatchStatus,
    /// Blob URI of the hydrated reference JSONL handed to the robot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_file: Option<String>,
    /// Blob URI the robot writes its result JSONL to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_file: Option<String>,
    /// Member pending-enhancement rows.
    pub pending_enhancement_ids: Vec<Uuid>,
    /// Lease expiry for the whole batch.
    pub expires_at: DateTime<Utc>,
}
