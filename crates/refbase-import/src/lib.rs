// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! The import pipeline.
//!
//! Accepts import records and batches (pointers to newline-delimited JSON
//! artifacts), processes each line — validate, resolve by identifier
//! equality, create or merge under the batch's collision policy — and records
//! a per-line result keyed by ordinal. Enqueuing a batch returns immediately;
//! processing runs asynchronously off the bus, with bounded retries on
//! classified transient errors only. Each successfully ingested reference is
//! handed to the deduplication continuation task, which in turn queues
//! projection and percolation.

use refbase_blob::{BlobClient, BlobFile};
use refbase_bus::{MessageBus, Task};
use refbase_config::ImportConfig;
use refbase_core::tasks::{DedupPayload, ProcessBatchPayload, DEDUP_REFERENCE, PROCESS_IMPORT_BATCH};
use refbase_core::wire::ReferenceWire;
use refbase_core::{
    rollup_batch_status, CollisionStrategy, ImportBatch, ImportBatchStatus, ImportRecord,
    ImportRecordStatus, ImportResult, ImportResultStatus, Reference, ReferenceChangeset,
};
use refbase_error::{RepoError, RepoResult};
use refbase_store::RepositoryStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Summary of a batch's per-line outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportBatchSummary {
    /// The batch.
    pub import_batch_id: Uuid,
    /// Current batch status.
    pub status: ImportBatchStatus,
    /// Line counts per outcome.
    pub counts: BTreeMap<ImportResultStatus, usize>,
    /// Failure details of failed lines, keyed by ordinal.
    pub failures: BTreeMap<usize, String>,
}

// ---------------------------------------------------------------------------
// ImportService
// ---------------------------------------------------------------------------

/// Front service for registering imports and reading their outcomes.
pub struct ImportService {
    store: Arc<RepositoryStore>,
    bus: Arc<MessageBus>,
    config: ImportConfig,
}

impl ImportService {
    /// Create the service.
    #[must_use]
    pub fn new(store: Arc<RepositoryStore>, bus: Arc<MessageBus>, config: ImportConfig) -> Self {
        Self { store, bus, config }
    }

    /// Create an import record.
    pub async fn create_import_record(&self, record: ImportRecord) -> RepoResult<ImportRecord> {
        self.store.insert_import_record(record.clone()).await?;
        Ok(record)
    }

    /// Register a batch and enqueue its processing task. Returns immediately
    /// with the batch; processing is asynchronous.
    pub async fn enqueue_batch(
        &self,
        import_record_id: Uuid,
        storage_url: &str,
        collision_strategy: CollisionStrategy,
    ) -> RepoResult<ImportBatch> {
        // Reject malformed artifact pointers up front.
        BlobFile::parse_uri(storage_url)?;
        let batch = ImportBatch::new(import_record_id, storage_url, collision_strategy);
        self.store.insert_import_batch(batch.clone()).await?;
        info!(
            target: "refbase.import.service",
            import_batch_id = %batch.id,
            import_record_id = %import_record_id,
            "enqueueing import batch"
        );
        self.bus
            .publish(
                Task::new(
                    PROCESS_IMPORT_BATCH,
                    serde_json::to_value(ProcessBatchPayload {
                        import_batch_id: batch.id,
                        remaining_retries: self.config.batch_retry_depth,
                    })
                    .map_err(|e| RepoError::internal(e.to_string()))?,
                )
                .with_lock_renewal(),
            )
            .await;
        Ok(batch)
    }

    /// Finalise an import record once its batches are terminal.
    pub async fn finalise_record(&self, import_record_id: Uuid) -> RepoResult<ImportRecord> {
        self.store.finalise_import_record(import_record_id).await
    }

    /// Fetch an import record.
    pub async fn get_record(&self, import_record_id: Uuid) -> RepoResult<ImportRecord> {
        self.store.get_import_record(import_record_id).await
    }

    /// Summarize a batch's results.
    pub async fn get_batch_summary(&self, import_batch_id: Uuid) -> RepoResult<ImportBatchSummary> {
        let batch = self.store.get_import_batch(import_batch_id).await?;
        let results = self.store.results_for_batch(import_batch_id, None).await;
        let mut counts: BTreeMap<ImportResultStatus, usize> = BTreeMap::new();
        let mut failures = BTreeMap::new();
        for result in &results {
            *counts.entry(result.status).or_insert(0) += 1;
            if let Some(details) = &result.failure_details {
                failures.insert(result.line_ordinal, details.clone());
            }
        }
        Ok(ImportBatchSummary {
            import_batch_id,
            status: batch.status,
            counts,
            failures,
        })
    }

    /// Per-line results, optionally filtered by outcome.
    pub async fn get_results(
        &self,
        import_batch_id: Uuid,
        status: Option<ImportResultStatus>,
    ) -> RepoResult<Vec<ImportResult>> {
        self.store.get_import_batch(import_batch_id).await?;
        Ok(self.store.results_for_batch(import_batch_id, status).await)
    }
}

// ---------------------------------------------------------------------------
// BatchProcessor
// ---------------------------------------------------------------------------

/// Outcome of one processed line.
enum LineOutcome {
    /// A reference was created or updated; carries the continuation inputs.
    Ingested {
        reference: Reference,
        changeset: ReferenceChangeset,
        status: ImportResultStatus,
    },
    /// The line failed terminally.
    Rejected { details: String },
}

/// Processes batch artifacts line by line.
pub struct BatchProcessor {
    store: Arc<RepositoryStore>,
    blob: Arc<dyn BlobClient>,
    bus: Arc<MessageBus>,
}

impl BatchProcessor {
    /// Create a processor.
    #[must_use]
    pub fn new(
        store: Arc<RepositoryStore>,
        blob: Arc<dyn BlobClient>,
        bus: Arc<MessageBus>,
    ) -> Self {
        Self { store, blob, bus }
    }

    /// Process a batch with bounded retries on classified transient errors.
    ///
    /// Validation failures are terminal and recorded per line; a transient
    /// error (identifier-collision integrity violations from concurrent
    /// inserts, bus lock losses) aborts the pass and the batch is replayed —
    /// per-line results are keyed by ordinal, so a replay overwrites rather
    /// than duplicates.
    pub async fn process_with_retries(
        &self,
        import_batch_id: Uuid,
        remaining_retries: u32,
    ) -> RepoResult<ImportBatchStatus> {
        let mut attempts_left = remaining_retries;
        loop {
            match self.process_once(import_batch_id).await {
                Ok(status) => return Ok(status),
                Err(err) if err.is_transient() && attempts_left > 0 => {
                    attempts_left -= 1;
                    warn!(
                        target: "refbase.import.batch",
                        import_batch_id = %import_batch_id,
                        attempts_left,
                        error = %err,
                        "transient error, replaying batch"
                    );
                }
                Err(err) => {
                    warn!(
                        target: "refbase.import.batch",
                        import_batch_id = %import_batch_id,
                        error = %err,
                        "batch failed"
                    );
                    self.store
                        .set_import_batch_status(import_batch_id, ImportBatchStatus::Failed)
                        .await?;
                    return Err(err);
                }
            }
        }
    }

    /// One processing pass over the artifact.
    async fn process_once(&self, import_batch_id: Uuid) -> RepoResult<ImportBatchStatus> {
        let batch = self.store.get_import_batch(import_batch_id).await?;
        self.store
            .set_import_batch_status(import_batch_id, ImportBatchStatus::Processing)
            .await?;

        let file = BlobFile::parse_uri(&batch.storage_url)?;
        let lines = self.blob.read_lines(&file).await?;
        debug!(
            target: "refbase.import.batch",
            import_batch_id = %import_batch_id,
            lines = lines.len(),
            "processing artifact"
        );

        let mut results = Vec::with_capacity(lines.len());
        for (ordinal, line) in lines.iter().enumerate() {
            let outcome = self.process_line(line, batch.collision_strategy).await?;
            let result = match outcome {
                LineOutcome::Ingested {
                    reference,
                    changeset,
                    status,
                } => {
                    // Continuation: dedup → projection → percolation, one
                    // strict per-reference chain.
                    if !changeset.is_empty() {
                        self.bus
                            .publish(Task::new(
                                DEDUP_REFERENCE,
                                serde_json::to_value(DedupPayload {
                                    reference_id: reference.id,
                                    changeset,
                                })
                                .map_err(|e| RepoError::internal(e.to_string()))?,
                            ))
                            .await;
                    }
                    ImportResult::new(import_batch_id, ordinal, status)
                        .with_reference(reference.id)
                }
                LineOutcome::Rejected { details } => {
                    ImportResult::new(import_batch_id, ordinal, ImportResultStatus::Failed)
                        .with_failure(details)
                }
            };
            self.store.upsert_import_result(result.clone()).await?;
            results.push(result);
        }

        let status = rollup_batch_status(&results);
        self.store
            .set_import_batch_status(import_batch_id, status)
            .await?;
        info!(
            target: "refbase.import.batch",
            import_batch_id = %import_batch_id,
            status = ?status,
            "batch terminal"
        );
        Ok(status)
    }

    /// Process one artifact line. Terminal failures come back as
    /// [`LineOutcome::Rejected`]; transient errors propagate to abort the
    /// pass.
    async fn process_line(
        &self,
        line: &str,
        strategy: CollisionStrategy,
    ) -> RepoResult<LineOutcome> {
        let wire = match ReferenceWire::parse_line(line) {
            Ok(wire) => wire,
            Err(err) => {
                return Ok(LineOutcome::Rejected {
                    details: err.detail(),
                });
            }
        };

        let keys: Vec<_> = wire.identifiers.iter().map(|i| i.key()).collect();
        let matches = self.store.find_with_identifiers(&keys).await;
        match matches.into_iter().next() {
            Some(mut existing) => {
                let incoming = wire.into_reference();
                let changeset = existing.merge(incoming, strategy)?;
                self.store.update_reference(existing.clone()).await?;
                Ok(LineOutcome::Ingested {
                    reference: existing,
                    changeset,
                    status: ImportResultStatus::Updated,
                })
            }
            None => {
                let reference = wire.into_reference();
                self.store.insert_reference(reference.clone()).await?;
                let changeset = ReferenceChangeset::full(&reference);
                Ok(LineOutcome::Ingested {
                    reference,
                    changeset,
                    status: ImportResultStatus::Created,
                })
            }
        }
    }
}

/// Build a fresh import record; convenience for callers of
/// [`ImportService::create_import_record`].
#[must_use]
pub fn new_import_record(
    processor_name: impl Into<String>,
    processor_version: impl Into<String>,
    source_name: impl Into<String>,
    searched_at: chrono::DateTime<chrono::Utc>,
) -> ImportRecord {
    ImportRecord {
        id: Uuid::new_v4(),
        processor_name: processor_name.into(),
        processor_version: processor_version.into(),
        source_name: source_name.into(),
        expected_reference_count: None,
        searched_at,
        status: ImportRecordStatus::Created,
    }
}
