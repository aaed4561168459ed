// SPDX-License-Identifier: MIT OR Apache-2.0
//! Import grouping: records, batches and per-line results.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Strategy applied when an ingested reference collides with an existing one
/// by identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum CollisionStrategy {
    /// Replace enhancements, preserve the merged identifier set.
    Overwrite,
    /// Concatenate enhancements, merge identifiers.
    Append,
    /// Keep existing rows on `(kind, source)` key collisions.
    #[default]
    MergeDefensive,
    /// Prefer incoming rows on key collisions.
    MergeAggressive,
}

/// Lifecycle of an import record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ImportRecordStatus {
    /// Created; batches may still be enqueued.
    Created,
    /// Finalised; all batches are terminal and no more may be enqueued.
    Finalised,
}

/// An import process: one upstream search/export producing many batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ImportRecord {
    /// Row id.
    pub id: Uuid,
    /// Name of the processor that produced the artifacts.
    pub processor_name: String,
    /// Version of the processor.
    pub processor_version: String,
    /// Upstream source name (e.g. `openalex`).
    pub source_name: String,
    /// Number of references the processor expects to deliver, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_reference_count: Option<usize>,
    /// When the upstream search was executed.
    pub searched_at: DateTime<Utc>,
    /// Record status.
    pub status: ImportRecordStatus,
}

/// Batch status, rolled up from per-line results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ImportBatchStatus {
    /// Registered, waiting for a worker.
    Created,
    /// A worker is processing lines.
    Processing,
    /// Every line succeeded.
    Completed,
    /// Some lines failed, some succeeded.
    PartiallyFailed,
    /// Every line failed.
    Failed,
}

impl ImportBatchStatus {
    /// Whether the batch has reached a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::PartiallyFailed | Self::Failed)
    }
}

/// A batch: a pointer to a newline-delimited JSON artifact to ingest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ImportBatch {
    /// Row id.
    pub id: Uuid,
    /// The owning import record.
    pub import_record_id: Uuid,
    /// Where the JSONL artifact lives.
    pub storage_url: String,
    /// Collision strategy applied to every line in this batch.
    pub collision_strategy: CollisionStrategy,
    /// Batch status.
    pub status: ImportBatchStatus,
}

impl ImportBatch {
    /// Register a batch against a record.
    #[must_use]
    pub fn new(
        import_record_id: Uuid,
        storage_url: impl Into<String>,
        collision_strategy: CollisionStrategy,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            import_record_id,
            storage_url: storage_url.into(),
            collision_strategy,
            status: ImportBatchStatus::Created,
        }
    }
}

/// Outcome of one line of a batch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ImportResultStatus {
    /// A new reference was created.
    Created,
    /// An existing reference was updated by merge.
    Updated,
    /// The reference landed but part of the line was rejected.
    PartiallyFailed,
    /// The line failed entirely.
    Failed,
    /// The line was cancelled before processing.
    Cancelled,
}

impl ImportResultStatus {
    /// Whether the line produced a usable reference.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Created | Self::Updated | Self::PartiallyFailed)
    }
}

/// Per-line outcome, keyed by the line ordinal within the artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ImportResult {
    /// Row id.
    pub id: Uuid,
    /// The owning batch.
    pub import_batch_id: Uuid,
    /// Zero-based line ordinal in the artifact.
    pub line_ordinal: usize,
    /// Line outcome.
    pub status: ImportResultStatus,
    /// The reference created or updated, when the line succeeded. For an
    /// exact duplicate this points at the retained canonical.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<Uuid>,
    /// Failure detail, when the line failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_details: Option<String>,
}

impl ImportResult {
    /// Record a line outcome.
    #[must_use]
    pub fn new(import_batch_id: Uuid, line_ordinal: usize, status: ImportResultStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            import_batch_id,
            line_ordinal,
            status,
            reference_id: None,
            failure_details: None,
        }
    }

    /// Attach the produced reference.
    #[must_use]
    pub fn with_reference(mut self, reference_id: Uuid) -> Self {
        self.reference_id = Some(reference_id);
        self
    }

    /// Attach failure detail.
    #[must_use]
    pub fn with_failure(mut self, detail: impl Into<String>) -> Self {
        self.failure_details = Some(detail.into());
        self
    }
}

/// Roll a set of line results up into the batch's terminal status.
///
/// `completed` when all lines succeeded, `failed` when all failed,
/// `partially_failed` otherwise.
#[must_use]
pub fn rollup_batch_status(results: &[ImportResult]) -> ImportBatchStatus {
    if results.is_empty() {
        return ImportBatchStatus::Completed;
    }
    let successes = results.iter().filter(|r| r.status.is_success()).count();
    if successes == results.len() {
        ImportBatchStatus::Completed
    } else if successes == 0 {
        ImportBatchStatus::Failed
    } else {
        ImportBatchStatus::PartiallyFailed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(status: ImportResultStatus) -> ImportResult {
        ImportResult::new(Uuid::new_v4(), 0, status)
    }

    #[test]
    fn rollup_all_success() {
        let results = vec![
            result(ImportResultStatus::Created),
            result(ImportResultStatus::Updated),
        ];
        assert_eq!(rollup_batch_status(&results), ImportBatchStatus::Completed);
    }

    #[test]
    fn rollup_mixed() {
        let results = vec![
            result(ImportResultStatus::Created),
            result(ImportResultStatus::Failed),
        ];
        assert_eq!(
            rollup_batch_status(&results),
            ImportBatchStatus::PartiallyFailed
        );
    }

    #[test]
    fn rollup_all_failed() {
        let results = vec![
            result(ImportResultStatus::Failed),
            result(ImportResultStatus::Failed),
        ];
        assert_eq!(rollup_batch_status(&results), ImportBatchStatus::Failed);
    }
}
