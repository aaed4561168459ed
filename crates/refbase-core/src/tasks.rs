// SPDX-License-Identifier: MIT OR Apache-2.0
//! Task kinds and payloads flowing over the bus.
//!
//! The per-reference lifecycle is a strict chain enforced by continuation:
//! batch processing publishes [`DEDUP_REFERENCE`] per ingested reference, the
//! deduplication worker publishes [`PERCOLATE_CHANGES`], and the percolation
//! worker emits pending work. No ordering is guaranteed across references.

use crate::changeset::ReferenceChangeset;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Process one import batch artifact.
pub const PROCESS_IMPORT_BATCH: &str = "process_import_batch";
/// Deduplicate one ingested reference, then reproject it.
pub const DEDUP_REFERENCE: &str = "dedup_reference";
/// Percolate one reference change against the stored automations.
pub const PERCOLATE_CHANGES: &str = "percolate_changes";
/// Import the result artifact of a robot enhancement batch.
pub const IMPORT_ROBOT_RESULTS: &str = "import_robot_results";
/// Walk the authoritative store and reproject into the aliased index.
pub const REPAIR_INDEX: &str = "repair_index";

/// Payload of a [`PROCESS_IMPORT_BATCH`] task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessBatchPayload {
    /// The batch to process.
    pub import_batch_id: Uuid,
    /// Remaining transient-error retries.
    pub remaining_retries: u32,
}

/// Payload of a [`DEDUP_REFERENCE`] task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupPayload {
    /// The ingested reference.
    pub reference_id: Uuid,
    /// The delta the ingest applied, carried through to percolation.
    pub changeset: ReferenceChangeset,
}

/// Payload of a [`PERCOLATE_CHANGES`] task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PercolatePayload {
    /// The changed reference.
    pub reference_id: Uuid,
    /// The delta just applied.
    pub changeset: ReferenceChangeset,
}

/// Payload of an [`IMPORT_ROBOT_RESULTS`] task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportResultsPayload {
    /// The robot enhancement batch whose result artifact is ready.
    pub robot_enhancement_batch_id: Uuid,
}

/// Payload of a [`REPAIR_INDEX`] task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairPayload {
    /// The alias to repair.
    pub alias: String,
}
