// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! The authoritative store.
//!
//! Holds the durable relational-style state of the repository: references
//! (with their identifier and enhancement rows), duplicate decisions, import
//! records/batches/results, enhancement requests, pending enhancements, robot
//! enhancement batches, robots and robot automations.
//!
//! All multi-row invariants are enforced inside single critical sections:
//! identifier uniqueness, exactly-one-active decision per reference, and the
//! claim semantics of pending-enhancement selection (concurrent pollers skip
//! rows claimed by a winner, the SKIP LOCKED analog). Retry chains are
//! resolved through the id→row arena, never through pointer cycles.

use chrono::{DateTime, Utc};
use refbase_core::{
    EnhancementRequest, EnhancementRequestStatus, IdentifierKey, ImportBatch, ImportBatchStatus,
    ImportRecord, ImportRecordStatus, ImportResult, ImportResultStatus, PendingEnhancement,
    PendingEnhancementStatus, Reference, ReferenceDuplicateDecision, Robot,
    RobotAutomation, RobotEnhancementBatch,
};
use refbase_error::{RepoError, RepoResult};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct StoreState {
    references: BTreeMap<Uuid, Reference>,
    /// Identifier uniqueness index: key → owning reference.
    identifier_owners: BTreeMap<IdentifierKey, Uuid>,
    decisions: BTreeMap<Uuid, ReferenceDuplicateDecision>,
    import_records: BTreeMap<Uuid, ImportRecord>,
    import_batches: BTreeMap<Uuid, ImportBatch>,
    /// Import results keyed by (batch, line ordinal); retried batches
    /// overwrite their previous per-line outcome.
    import_results: BTreeMap<(Uuid, usize), ImportResult>,
    requests: BTreeMap<Uuid, EnhancementRequest>,
    pendings: BTreeMap<Uuid, PendingEnhancement>,
    robot_batches: BTreeMap<Uuid, RobotEnhancementBatch>,
    robots: BTreeMap<Uuid, Robot>,
    robot_names: BTreeMap<String, Uuid>,
    automations: BTreeMap<Uuid, RobotAutomation>,
}

/// The authoritative store.
#[derive(Default)]
pub struct RepositoryStore {
    state: RwLock<StoreState>,
}

impl RepositoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// References
// ---------------------------------------------------------------------------

impl RepositoryStore {
    /// Insert a new reference, enforcing identifier uniqueness.
    ///
    /// A key already owned by another reference raises an integrity error —
    /// the classified-transient collision the import pipeline retries on,
    /// because it is usually a concurrent insert of the same work.
    pub async fn insert_reference(&self, reference: Reference) -> RepoResult<()> {
        reference.validate()?;
        let mut state = self.state.write().await;
        if state.references.contains_key(&reference.id) {
            return Err(RepoError::integrity(
                "reference",
                format!("reference {} already exists", reference.id),
            ));
        }
        for linked in &reference.identifiers {
            let key = linked.identifier.key();
            if let Some(owner) = state.identifier_owners.get(&key) {
                if *owner != reference.id {
                    return Err(RepoError::integrity(
                        "identifier",
                        format!("identifier {key:?} already belongs to reference {owner}"),
                    ));
                }
            }
        }
        for linked in &reference.identifiers {
            state
                .identifier_owners
                .insert(linked.identifier.key(), reference.id);
        }
        state.references.insert(reference.id, reference);
        Ok(())
    }

    /// Replace a reference after a merge, re-registering its identifier keys.
    pub async fn update_reference(&self, reference: Reference) -> RepoResult<()> {
        reference.validate()?;
        let mut state = self.state.write().await;
        if !state.references.contains_key(&reference.id) {
            return Err(RepoError::not_found("reference", reference.id.to_string()));
        }
        for linked in &reference.identifiers {
            let key = linked.identifier.key();
            if let Some(owner) = state.identifier_owners.get(&key) {
                if *owner != reference.id {
                    return Err(RepoError::integrity(
                        "identifier",
                        format!("identifier {key:?} already belongs to reference {owner}"),
                    ));
                }
            }
        }
        let stale: Vec<IdentifierKey> = state
            .identifier_owners
            .iter()
            .filter(|(_, owner)| **owner == reference.id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            state.identifier_owners.remove(&key);
        }
        for linked in &reference.identifiers {
            state
                .identifier_owners
                .insert(linked.identifier.key(), reference.id);
        }
        state.references.insert(reference.id, reference);
        Ok(())
    }

    /// Fetch one reference.
    pub async fn get_reference(&self, id: Uuid) -> RepoResult<Reference> {
        self.state
            .read()
            .await
            .references
            .get(&id)
            .cloned()
            .ok_or_else(|| RepoError::not_found("reference", id.to_string()))
    }

    /// Fetch several references; missing ids are skipped.
    pub async fn get_references(&self, ids: &[Uuid]) -> Vec<Reference> {
        let state = self.state.read().await;
        ids.iter()
            .filter_map(|id| state.references.get(id).cloned())
            .collect()
    }

    /// All reference ids, for repair walks.
    pub async fn all_reference_ids(&self) -> Vec<Uuid> {
        self.state.read().await.references.keys().copied().collect()
    }

    /// Discard a reference row and release its identifier keys.
    ///
    /// References are never hard-deleted once at rest; the only caller is the
    /// exact-duplicate path, which discards a row that duplicates an existing
    /// canonical byte-for-byte before it ever becomes visible.
    pub async fn remove_reference(&self, id: Uuid) -> RepoResult<()> {
        let mut state = self.state.write().await;
        if state.references.remove(&id).is_none() {
            return Err(RepoError::not_found("reference", id.to_string()));
        }
        state.identifier_owners.retain(|_, owner| *owner != id);
        Ok(())
    }

    /// Find references owning ANY of the given identifier keys.
    ///
    /// This is the ingest resolution step: identifier equality only, never
    /// titles.
    pub async fn find_with_identifiers(&self, keys: &[IdentifierKey]) -> Vec<Reference> {
        let state = self.state.read().await;
        let mut seen = BTreeSet::new();
        let mut found = Vec::new();
        for key in keys {
            if let Some(owner) = state.identifier_owners.get(key) {
                if seen.insert(*owner) {
                    if let Some(reference) = state.references.get(owner) {
                        found.push(reference.clone());
                    }
                }
            }
        }
        found
    }
}

// ---------------------------------------------------------------------------
// Duplicate decisions
// ---------------------------------------------------------------------------

impl RepositoryStore {
    /// Insert a decision row as the active decision for its reference,
    /// deactivating all prior rows in the same critical section.
    pub async fn insert_decision(
        &self,
        mut decision: ReferenceDuplicateDecision,
    ) -> RepoResult<ReferenceDuplicateDecision> {
        let mut state = self.state.write().await;
        decision.active_decision = true;
        for row in state.decisions.values_mut() {
            if row.reference_id == decision.reference_id {
                row.active_decision = false;
            }
        }
        state.decisions.insert(decision.id, decision.clone());
        debug!(
            target: "refbase.store.decisions",
            reference_id = %decision.reference_id,
            determination = ?decision.determination,
            "activated decision"
        );
        Ok(decision)
    }

    /// The active decision for a reference, if any.
    pub async fn active_decision(&self, reference_id: Uuid) -> Option<ReferenceDuplicateDecision> {
        self.state
            .read()
            .await
            .decisions
            .values()
            .find(|d| d.reference_id == reference_id && d.active_decision)
            .cloned()
    }

    /// Every decision row ever recorded for a reference (audit trail).
    pub async fn decisions_for(&self, reference_id: Uuid) -> Vec<ReferenceDuplicateDecision> {
        let mut rows: Vec<_> = self
            .state
            .read()
            .await
            .decisions
            .values()
            .filter(|d| d.reference_id == reference_id)
            .cloned()
            .collect();
        rows.sort_by_key(|d| d.created_at);
        rows
    }

    /// References whose active decision points at this canonical.
    pub async fn duplicates_of(&self, canonical_id: Uuid) -> Vec<Uuid> {
        self.state
            .read()
            .await
            .decisions
            .values()
            .filter(|d| d.active_decision && d.canonical_reference_id == Some(canonical_id))
            .map(|d| d.reference_id)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Imports
// ---------------------------------------------------------------------------

impl RepositoryStore {
    /// Register an import record.
    pub async fn insert_import_record(&self, record: ImportRecord) -> RepoResult<()> {
        let mut state = self.state.write().await;
        state.import_records.insert(record.id, record);
        Ok(())
    }

    /// Fetch an import record.
    pub async fn get_import_record(&self, id: Uuid) -> RepoResult<ImportRecord> {
        self.state
            .read()
            .await
            .import_records
            .get(&id)
            .cloned()
            .ok_or_else(|| RepoError::not_found("import record", id.to_string()))
    }

    /// Finalise a record. Fails if already finalised or if any batch is not
    /// yet terminal.
    pub async fn finalise_import_record(&self, id: Uuid) -> RepoResult<ImportRecord> {
        let mut state = self.state.write().await;
        let open_batches = state
            .import_batches
            .values()
            .filter(|b| b.import_record_id == id && !b.status.is_terminal())
            .count();
        if open_batches > 0 {
            return Err(RepoError::conflict(format!(
                "import record {id} still has {open_batches} unfinished batches"
            )));
        }
        let record = state
            .import_records
            .get_mut(&id)
            .ok_or_else(|| RepoError::not_found("import record", id.to_string()))?;
        if record.status == ImportRecordStatus::Finalised {
            return Err(RepoError::conflict(format!(
                "import record {id} is already finalised"
            )));
        }
        record.status = ImportRecordStatus::Finalised;
        Ok(record.clone())
    }

    /// Register a batch under a record.
    pub async fn insert_import_batch(&self, batch: ImportBatch) -> RepoResult<()> {
        let mut state = self.state.write().await;
        let record = state
            .import_records
            .get(&batch.import_record_id)
            .ok_or_else(|| {
                RepoError::not_found("import record", batch.import_record_id.to_string())
            })?;
        if record.status == ImportRecordStatus::Finalised {
            return Err(RepoError::conflict(format!(
                "import record {} is finalised; no more batches may be enqueued",
                record.id
            )));
        }
        state.import_batches.insert(batch.id, batch);
        Ok(())
    }

    /// Fetch a batch.
    pub async fn get_import_batch(&self, id: Uuid) -> RepoResult<ImportBatch> {
        self.state
            .read()
            .await
            .import_batches
            .get(&id)
            .cloned()
            .ok_or_else(|| RepoError::not_found("import batch", id.to_string()))
    }

    /// Batches belonging to a record.
    pub async fn batches_for_record(&self, record_id: Uuid) -> Vec<ImportBatch> {
        self.state
            .read()
            .await
            .import_batches
            .values()
            .filter(|b| b.import_record_id == record_id)
            .cloned()
            .collect()
    }

    /// Update a batch status.
    pub async fn set_import_batch_status(
        &self,
        id: Uuid,
        status: ImportBatchStatus,
    ) -> RepoResult<()> {
        let mut state = self.state.write().await;
        let batch = state
            .import_batches
            .get_mut(&id)
            .ok_or_else(|| RepoError::not_found("import batch", id.to_string()))?;
        batch.status = status;
        Ok(())
    }

    /// Record (or replace, on retry) the per-line outcome of a batch.
    pub async fn upsert_import_result(&self, result: ImportResult) -> RepoResult<()> {
        let mut state = self.state.write().await;
        state
            .import_results
            .insert((result.import_batch_id, result.line_ordinal), result);
        Ok(())
    }

    /// Line results of a batch, ordered by ordinal, optionally filtered.
    pub async fn results_for_batch(
        &self,
        batch_id: Uuid,
        status: Option<ImportResultStatus>,
    ) -> Vec<ImportResult> {
        self.state
            .read()
            .await
            .import_results
            .range((batch_id, 0)..=(batch_id, usize::MAX))
            .map(|(_, result)| result.clone())
            .filter(|result| status.is_none_or(|s| result.status == s))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Enhancement requests and pending enhancements
// ---------------------------------------------------------------------------

impl RepositoryStore {
    /// Register an enhancement request.
    pub async fn insert_request(&self, request: EnhancementRequest) -> RepoResult<()> {
        let mut state = self.state.write().await;
        state.requests.insert(request.id, request);
        Ok(())
    }

    /// Fetch a request.
    pub async fn get_request(&self, id: Uuid) -> RepoResult<EnhancementRequest> {
        self.state
            .read()
            .await
            .requests
            .get(&id)
            .cloned()
            .ok_or_else(|| RepoError::not_found("enhancement request", id.to_string()))
    }

    /// Record a procedural error on a request.
    pub async fn set_request_error(&self, id: Uuid, error: impl Into<String>) -> RepoResult<()> {
        let mut state = self.state.write().await;
        let request = state
            .requests
            .get_mut(&id)
            .ok_or_else(|| RepoError::not_found("enhancement request", id.to_string()))?;
        request.error = Some(error.into());
        Ok(())
    }

    /// Record a permanent robot rejection on a request. The rejection text
    /// is the robot's response body and overrides the derived status.
    pub async fn set_request_rejection(
        &self,
        id: Uuid,
        rejection: impl Into<String>,
    ) -> RepoResult<()> {
        let mut state = self.state.write().await;
        let request = state
            .requests
            .get_mut(&id)
            .ok_or_else(|| RepoError::not_found("enhancement request", id.to_string()))?;
        request.rejection = Some(rejection.into());
        Ok(())
    }

    /// Derive a request's status from its pending enhancements.
    ///
    /// A recorded permanent rejection wins outright. Otherwise the status is
    /// derived from the rows; a row superseded by a retry sibling (its id
    /// appears as another row's `retry_of`) no longer speaks for the
    /// request, only chain heads count.
    pub async fn request_status(&self, id: Uuid) -> RepoResult<EnhancementRequestStatus> {
        let state = self.state.read().await;
        let request = state
            .requests
            .get(&id)
            .ok_or_else(|| RepoError::not_found("enhancement request", id.to_string()))?;
        if request.rejection.is_some() {
            return Ok(EnhancementRequestStatus::Rejected);
        }
        let rows: Vec<&PendingEnhancement> = state
            .pendings
            .values()
            .filter(|p| p.enhancement_request_id == id)
            .collect();
        let superseded: BTreeSet<Uuid> = rows.iter().filter_map(|p| p.retry_of).collect();
        let statuses: Vec<PendingEnhancementStatus> = rows
            .iter()
            .filter(|p| !superseded.contains(&p.id))
            .map(|p| p.status)
            .collect();
        Ok(EnhancementRequestStatus::derive(&statuses))
    }

    /// Insert a pending enhancement unconditionally.
    pub async fn insert_pending(&self, pending: PendingEnhancement) -> RepoResult<()> {
        let mut state = self.state.write().await;
        state.pendings.insert(pending.id, pending);
        Ok(())
    }

    /// Insert a pending enhancement unless one already exists for the same
    /// (robot, reference) with status pending or processing. Returns whether
    /// the row was inserted.
    pub async fn insert_pending_if_absent(&self, pending: PendingEnhancement) -> RepoResult<bool> {
        let mut state = self.state.write().await;
        let duplicate = state.pendings.values().any(|existing| {
            existing.robot_id == pending.robot_id
                && existing.reference_id == pending.reference_id
                && matches!(
                    existing.status,
                    PendingEnhancementStatus::Pending | PendingEnhancementStatus::Processing
                )
        });
        if duplicate {
            return Ok(false);
        }
        state.pendings.insert(pending.id, pending);
        Ok(true)
    }

    /// Fetch a pending enhancement.
    pub async fn get_pending(&self, id: Uuid) -> RepoResult<PendingEnhancement> {
        self.state
            .read()
            .await
            .pendings
            .get(&id)
            .cloned()
            .ok_or_else(|| RepoError::not_found("pending enhancement", id.to_string()))
    }

    /// Pending enhancements belonging to a request.
    pub async fn pendings_for_request(&self, request_id: Uuid) -> Vec<PendingEnhancement> {
        self.state
            .read()
            .await
            .pendings
            .values()
            .filter(|p| p.enhancement_request_id == request_id)
            .cloned()
            .collect()
    }

    /// Claim up to `limit` pending rows for a robot, transitioning them to
    /// processing with the given lease inside one critical section.
    ///
    /// Selection order is (request priority descending, created_at
    /// ascending). Because claimed rows leave the pending status before the
    /// lock is released, concurrent pollers for the same robot skip them and
    /// the losers see zero rows.
    pub async fn claim_pending(
        &self,
        robot_id: Uuid,
        limit: usize,
        lease_until: DateTime<Utc>,
    ) -> Vec<PendingEnhancement> {
        let mut state = self.state.write().await;
        let mut eligible: Vec<(i32, DateTime<Utc>, Uuid)> = state
            .pendings
            .values()
            .filter(|p| p.robot_id == robot_id && p.status == PendingEnhancementStatus::Pending)
            .map(|p| {
                let priority = state
                    .requests
                    .get(&p.enhancement_request_id)
                    .map_or(0, |r| r.priority);
                (priority, p.created_at, p.id)
            })
            .collect();
        eligible.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        eligible.truncate(limit);

        let mut claimed = Vec::new();
        for (_, _, id) in eligible {
            if let Some(pending) = state.pendings.get_mut(&id) {
                pending.status = PendingEnhancementStatus::Processing;
                pending.expires_at = Some(lease_until);
                claimed.push(pending.clone());
            }
        }
        claimed
    }

    /// Set the status of a set of pending rows, adjusting their lease: leased
    /// statuses keep the given expiry, terminal and pending statuses clear it.
    pub async fn set_pending_status(
        &self,
        ids: &[Uuid],
        status: PendingEnhancementStatus,
        lease_until: Option<DateTime<Utc>>,
    ) -> RepoResult<()> {
        let mut state = self.state.write().await;
        for id in ids {
            let pending = state
                .pendings
                .get_mut(id)
                .ok_or_else(|| RepoError::not_found("pending enhancement", id.to_string()))?;
            pending.status = status;
            pending.expires_at = if status.is_leased() { lease_until } else { None };
        }
        Ok(())
    }

    /// Extend the lease on a set of rows.
    pub async fn extend_pending_lease(
        &self,
        ids: &[Uuid],
        lease_until: DateTime<Utc>,
    ) -> RepoResult<()> {
        let mut state = self.state.write().await;
        for id in ids {
            let pending = state
                .pendings
                .get_mut(id)
                .ok_or_else(|| RepoError::not_found("pending enhancement", id.to_string()))?;
            if pending.status.is_leased() {
                pending.expires_at = Some(lease_until);
            }
        }
        Ok(())
    }

    /// Transition every leased row whose lease lapsed before `now` to
    /// expired, returning the expired rows.
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Vec<PendingEnhancement> {
        let mut state = self.state.write().await;
        let mut expired = Vec::new();
        for pending in state.pendings.values_mut() {
            if pending.status.is_leased() && pending.expires_at.is_some_and(|at| at < now) {
                pending.status = PendingEnhancementStatus::Expired;
                pending.expires_at = None;
                expired.push(pending.clone());
            }
        }
        expired
    }

    /// Length of the retry chain ending at this row: 0 for a first attempt,
    /// 1 for its first retry, and so on. Resolved through the id→row arena.
    pub async fn retry_depth(&self, id: Uuid) -> RepoResult<u32> {
        let state = self.state.read().await;
        let mut depth = 0;
        let mut current = state
            .pendings
            .get(&id)
            .ok_or_else(|| RepoError::not_found("pending enhancement", id.to_string()))?;
        let mut visited = BTreeSet::new();
        visited.insert(current.id);
        while let Some(parent_id) = current.retry_of {
            if !visited.insert(parent_id) {
                return Err(RepoError::UnitOfWork {
                    detail: format!("retry chain of pending enhancement {id} contains a cycle"),
                });
            }
            current = state.pendings.get(&parent_id).ok_or_else(|| {
                RepoError::not_found("pending enhancement", parent_id.to_string())
            })?;
            depth += 1;
        }
        Ok(depth)
    }
}

// ---------------------------------------------------------------------------
// Robot enhancement batches
// ---------------------------------------------------------------------------

impl RepositoryStore {
    /// Register a robot enhancement batch.
    pub async fn insert_robot_batch(&self, batch: RobotEnhancementBatch) -> RepoResult<()> {
        let mut state = self.state.write().await;
        state.robot_batches.insert(batch.id, batch);
        Ok(())
    }

    /// Fetch a robot enhancement batch.
    pub async fn get_robot_batch(&self, id: Uuid) -> RepoResult<RobotEnhancementBatch> {
        self.state
            .read()
            .await
            .robot_batches
            .get(&id)
            .cloned()
            .ok_or_else(|| RepoError::not_found("robot enhancement batch", id.to_string()))
    }

    /// Replace a robot enhancement batch row.
    pub async fn update_robot_batch(&self, batch: RobotEnhancementBatch) -> RepoResult<()> {
        let mut state = self.state.write().await;
        if !state.robot_batches.contains_key(&batch.id) {
            return Err(RepoError::not_found(
                "robot enhancement batch",
                batch.id.to_string(),
            ));
        }
        state.robot_batches.insert(batch.id, batch);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Robots and automations
// ---------------------------------------------------------------------------

impl RepositoryStore {
    /// Register a robot. Names are unique.
    pub async fn insert_robot(&self, robot: Robot) -> RepoResult<()> {
        let mut state = self.state.write().await;
        if state.robot_names.contains_key(&robot.name) {
            return Err(RepoError::integrity(
                "robot",
                format!("robot name {:?} is taken", robot.name),
            ));
        }
        state.robot_names.insert(robot.name.clone(), robot.id);
        state.robots.insert(robot.id, robot);
        Ok(())
    }

    /// Fetch a robot by id.
    pub async fn get_robot(&self, id: Uuid) -> RepoResult<Robot> {
        self.state
            .read()
            .await
            .robots
            .get(&id)
            .cloned()
            .ok_or_else(|| RepoError::not_found("robot", id.to_string()))
    }

    /// Fetch a robot by name.
    pub async fn get_robot_by_name(&self, name: &str) -> RepoResult<Robot> {
        let state = self.state.read().await;
        state
            .robot_names
            .get(name)
            .and_then(|id| state.robots.get(id))
            .cloned()
            .ok_or_else(|| RepoError::not_found("robot", name))
    }

    /// Register (or replace) a robot automation.
    pub async fn upsert_automation(&self, automation: RobotAutomation) -> RepoResult<()> {
        let mut state = self.state.write().await;
        if !state.robots.contains_key(&automation.robot_id) {
            return Err(RepoError::not_found(
                "robot",
                automation.robot_id.to_string(),
            ));
        }
        state.automations.insert(automation.id, automation);
        Ok(())
    }

    /// Remove an automation. Returns whether it existed.
    pub async fn remove_automation(&self, id: Uuid) -> bool {
        self.state.write().await.automations.remove(&id).is_some()
    }

    /// All registered automations.
    pub async fn list_automations(&self) -> Vec<RobotAutomation> {
        self.state.read().await.automations.values().cloned().collect()
    }
}
