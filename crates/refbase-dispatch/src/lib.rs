// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! The enhancement dispatch engine.
//!
//! Work is pulled, never pushed: robots poll for a leased batch of pending
//! enhancements, read the hydrated references from a signed blob URL, write
//! their results to another, and submit. Leases are renewable while work
//! remains; a sweeper reclaims lapsed leases and inserts retry siblings up
//! to a bounded chain depth. Concurrent pollers from the same robot are
//! harmless — one wins the rows, the others see nothing.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use refbase_blob::{BlobClient, BlobFile, SignedUrl, SignedUrlOp, UrlSigner};
use refbase_bus::{MessageBus, Task};
use refbase_config::DispatchConfig;
use refbase_core::tasks::{
    DedupPayload, ImportResultsPayload, DEDUP_REFERENCE, IMPORT_ROBOT_RESULTS,
};
use refbase_core::wire::{BatchRobotRequestWire, ResultSubmissionWire, RobotResultLine};
use refbase_core::{
    EnhancementRequest, EnhancementRequestStatus, PendingEnhancement, PendingEnhancementStatus,
    ReferenceChangeset, RobotEnhancementBatch, RobotEnhancementBatchStatus,
};
use refbase_error::{RepoError, RepoResult};
use refbase_robot::RobotClient;
use refbase_store::RepositoryStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Conflict message returned when renewing a lease on a drained batch.
pub const NO_PENDING_ENHANCEMENTS: &str = "This batch has no pending enhancements.";

/// A leased batch as handed to a polling robot.
#[derive(Debug, Clone)]
pub struct LeasedBatch {
    /// The batch row.
    pub batch: RobotEnhancementBatch,
    /// Signed read grant on the hydrated reference file.
    pub reference_file_url: SignedUrl,
    /// Signed write grant on the result file.
    pub result_file_url: SignedUrl,
}

/// Statistics from one sweeper pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Rows transitioned to expired.
    pub expired: usize,
    /// Retry siblings inserted.
    pub retried: usize,
    /// Rows whose retry budget was exhausted (request left degraded).
    pub exhausted: usize,
}

/// The dispatch engine.
pub struct DispatchEngine {
    store: Arc<RepositoryStore>,
    blob: Arc<dyn BlobClient>,
    signer: UrlSigner,
    bus: Arc<MessageBus>,
    config: DispatchConfig,
    container: String,
}

impl DispatchEngine {
    /// Create the engine. `container` is the blob container batch artifacts
    /// are written into.
    #[must_use]
    pub fn new(
        store: Arc<RepositoryStore>,
        blob: Arc<dyn BlobClient>,
        signer: UrlSigner,
        bus: Arc<MessageBus>,
        config: DispatchConfig,
        container: impl Into<String>,
    ) -> Self {
        Self {
            store,
            blob,
            signer,
            bus,
            config,
            container: container.into(),
        }
    }

    fn lease_until(&self, lease: Option<Duration>, now: DateTime<Utc>) -> DateTime<Utc> {
        let lease = lease.unwrap_or(self.config.default_lease);
        now + ChronoDuration::from_std(lease)
            .unwrap_or_else(|_| ChronoDuration::seconds(600))
    }

    // -----------------------------------------------------------------------
    // Request intake
    // -----------------------------------------------------------------------

    /// Register an enhancement request and materialize one pending
    /// enhancement per reference.
    pub async fn create_request(
        &self,
        request: EnhancementRequest,
    ) -> RepoResult<EnhancementRequest> {
        self.store.get_robot(request.robot_id).await?;
        for reference_id in &request.reference_ids {
            self.store.get_reference(*reference_id).await?;
        }
        self.store.insert_request(request.clone()).await?;
        let source = request
            .source
            .clone()
            .unwrap_or_else(|| "enhancement-request".to_string());
        for reference_id in &request.reference_ids {
            self.store
                .insert_pending(PendingEnhancement::new(
                    *reference_id,
                    request.robot_id,
                    request.id,
                    source.clone(),
                ))
                .await?;
        }
        info!(
            target: "refbase.dispatch.requests",
            enhancement_request_id = %request.id,
            robot_id = %request.robot_id,
            references = request.reference_ids.len(),
            "registered enhancement request"
        );
        Ok(request)
    }

    /// Derived status of a request.
    pub async fn request_status(&self, request_id: Uuid) -> RepoResult<EnhancementRequestStatus> {
        self.store.request_status(request_id).await
    }

    // -----------------------------------------------------------------------
    // Polling
    // -----------------------------------------------------------------------

    /// Lease a batch of work to a polling robot.
    ///
    /// Selects up to `min(limit, max_batch_size)` pending rows (request
    /// priority descending, oldest first), uploads the hydrated reference
    /// JSONL, and returns signed URLs plus the batch id. `None` when the
    /// robot has no work (the HTTP layer answers 204).
    pub async fn poll_batch(
        &self,
        robot_id: Uuid,
        limit: usize,
        lease: Option<Duration>,
    ) -> RepoResult<Option<LeasedBatch>> {
        self.store.get_robot(robot_id).await?;
        let now = Utc::now();
        let expires_at = self.lease_until(lease, now);
        let take = limit.min(self.config.max_batch_size).max(1);

        let claimed = self.store.claim_pending(robot_id, take, expires_at).await;
        if claimed.is_empty() {
            debug!(target: "refbase.dispatch.poll", robot_id = %robot_id, "no work");
            return Ok(None);
        }

        let batch_id = Uuid::new_v4();
        let reference_file = BlobFile::new(
            &self.container,
            "robot-enhancement-batches/reference-data",
            format!("{batch_id}.jsonl"),
        )?;
        let result_file = BlobFile::new(
            &self.container,
            "robot-enhancement-batches/result-data",
            format!("{batch_id}.jsonl"),
        )?;

        let reference_ids: Vec<Uuid> = claimed.iter().map(|p| p.reference_id).collect();
        let references = self.store.get_references(&reference_ids).await;
        let lines: Vec<String> = references
            .iter()
            .map(|reference| {
                serde_json::to_string(reference)
                    .map_err(|e| RepoError::internal(format!("serializing reference: {e}")))
            })
            .collect::<RepoResult<_>>()?;
        self.blob.upload_lines(&reference_file, &lines).await?;

        let batch = RobotEnhancementBatch {
            id: batch_id,
            robot_id,
            status: RobotEnhancementBatchStatus::Pending,
            reference_file: Some(reference_file.uri()),
            result_file: Some(result_file.uri()),
            pending_enhancement_ids: claimed.iter().map(|p| p.id).collect(),
            expires_at,
        };
        self.store.insert_robot_batch(batch.clone()).await?;

        info!(
            target: "refbase.dispatch.poll",
            robot_id = %robot_id,
            robot_enhancement_batch_id = %batch_id,
            rows = claimed.len(),
            expires_at = %expires_at,
            "leased batch"
        );
        Ok(Some(LeasedBatch {
            reference_file_url: self.signer.sign(&reference_file, SignedUrlOp::Download, now),
            result_file_url: self.signer.sign(&result_file, SignedUrlOp::Upload, now),
            batch,
        }))
    }

    /// Extend a batch lease.
    ///
    /// Succeeds only while some member row is still processing; a drained
    /// batch conflicts so the robot stops working on stale data.
    pub async fn renew_lease(
        &self,
        batch_id: Uuid,
        lease: Option<Duration>,
    ) -> RepoResult<RobotEnhancementBatch> {
        let mut batch = self.store.get_robot_batch(batch_id).await?;
        let members: Vec<PendingEnhancement> = {
            let mut rows = Vec::new();
            for id in &batch.pending_enhancement_ids {
                rows.push(self.store.get_pending(*id).await?);
            }
            rows
        };
        let live: Vec<Uuid> = members
            .iter()
            .filter(|p| p.status == PendingEnhancementStatus::Processing)
            .map(|p| p.id)
            .collect();
        if live.is_empty() {
            return Err(RepoError::conflict(NO_PENDING_ENHANCEMENTS));
        }
        let now = Utc::now();
        let expires_at = self.lease_until(lease, now);
        self.store.extend_pending_lease(&live, expires_at).await?;
        batch.expires_at = expires_at;
        self.store.update_robot_batch(batch.clone()).await?;
        debug!(
            target: "refbase.dispatch.lease",
            robot_enhancement_batch_id = %batch_id,
            expires_at = %expires_at,
            "lease renewed"
        );
        Ok(batch)
    }

    // -----------------------------------------------------------------------
    // Results
    // -----------------------------------------------------------------------

    /// Accept a robot's submission for a batch.
    ///
    /// A terminal error fails the batch and all its rows. Success moves the
    /// rows to importing and queues the background import of the result
    /// artifact.
    pub async fn submit_result(
        &self,
        batch_id: Uuid,
        submission: ResultSubmissionWire,
    ) -> RepoResult<()> {
        let mut batch = self.store.get_robot_batch(batch_id).await?;
        if batch.status != RobotEnhancementBatchStatus::Pending {
            return Err(RepoError::conflict(format!(
                "batch {batch_id} is already {:?}",
                batch.status
            )));
        }

        if let Some(error) = submission.error {
            warn!(
                target: "refbase.dispatch.results",
                robot_enhancement_batch_id = %batch_id,
                error = %error,
                "robot reported terminal batch error"
            );
            self.fail_batch_rows(&mut batch).await?;
            for request_id in self.request_ids_of(&batch).await? {
                self.store.set_request_error(request_id, &error).await?;
            }
            return Ok(());
        }

        let now = Utc::now();
        let expires_at = self.lease_until(None, now);
        self.store
            .set_pending_status(
                &batch.pending_enhancement_ids,
                PendingEnhancementStatus::Importing,
                Some(expires_at),
            )
            .await?;
        self.bus
            .publish(Task::new(
                IMPORT_ROBOT_RESULTS,
                serde_json::to_value(ImportResultsPayload {
                    robot_enhancement_batch_id: batch_id,
                })
                .map_err(|e| RepoError::internal(e.to_string()))?,
            ))
            .await;
        Ok(())
    }

    /// Import a submitted result artifact line by line.
    ///
    /// Each line either creates an enhancement (row → completed, and the
    /// reference flows to reprojection/percolation) or records a per-line
    /// robot error (row → failed). References missing from the artifact fail
    /// too. The batch completes once every member is terminal.
    pub async fn import_results(&self, batch_id: Uuid) -> RepoResult<()> {
        let mut batch = self.store.get_robot_batch(batch_id).await?;
        let result_file = batch
            .result_file
            .as_deref()
            .ok_or_else(|| RepoError::UnitOfWork {
                detail: format!("batch {batch_id} has no result file pointer"),
            })?;
        let file = BlobFile::parse_uri(result_file)?;
        let lines = self.blob.read_lines(&file).await?;

        // Member rows by reference: result lines address references.
        let mut members: BTreeMap<Uuid, PendingEnhancement> = BTreeMap::new();
        for id in &batch.pending_enhancement_ids {
            let row = self.store.get_pending(*id).await?;
            members.insert(row.reference_id, row);
        }

        let mut outcomes: BTreeMap<Uuid, PendingEnhancementStatus> = BTreeMap::new();
        for line in &lines {
            let parsed = match RobotResultLine::parse_line(line) {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(
                        target: "refbase.dispatch.results",
                        robot_enhancement_batch_id = %batch_id,
                        error = %err,
                        "unparseable result line"
                    );
                    continue;
                }
            };
            let reference_id = parsed.reference_id();
            let Some(member) = members.get(&reference_id) else {
                warn!(
                    target: "refbase.dispatch.results",
                    robot_enhancement_batch_id = %batch_id,
                    reference_id = %reference_id,
                    "result line for a reference outside the batch"
                );
                continue;
            };

            match parsed {
                RobotResultLine::Error { error, .. } => {
                    debug!(
                        target: "refbase.dispatch.results",
                        reference_id = %reference_id,
                        error = %error,
                        "robot failed reference"
                    );
                    outcomes.insert(member.id, PendingEnhancementStatus::Failed);
                }
                RobotResultLine::Enhancement(entry) => {
                    let mut reference = self.store.get_reference(reference_id).await?;
                    let enhancement = entry.enhancement.into_enhancement(reference_id);
                    let changeset = ReferenceChangeset {
                        added_identifiers: Vec::new(),
                        added_enhancements: vec![enhancement.clone()],
                    };
                    reference.enhancements.push(enhancement);
                    self.store.update_reference(reference).await?;
                    outcomes.insert(member.id, PendingEnhancementStatus::Completed);
                    // Reprojection and percolation ride the normal
                    // continuation chain.
                    self.bus
                        .publish(Task::new(
                            DEDUP_REFERENCE,
                            serde_json::to_value(DedupPayload {
                                reference_id,
                                changeset,
                            })
                            .map_err(|e| RepoError::internal(e.to_string()))?,
                        ))
                        .await;
                }
            }
        }

        // Anything the robot never answered for is failed.
        for member in members.values() {
            outcomes
                .entry(member.id)
                .or_insert(PendingEnhancementStatus::Failed);
        }
        for (id, status) in &outcomes {
            self.store.set_pending_status(&[*id], *status, None).await?;
        }

        batch.status = RobotEnhancementBatchStatus::Completed;
        self.store.update_robot_batch(batch.clone()).await?;
        info!(
            target: "refbase.dispatch.results",
            robot_enhancement_batch_id = %batch_id,
            completed = outcomes
                .values()
                .filter(|s| **s == PendingEnhancementStatus::Completed)
                .count(),
            failed = outcomes
                .values()
                .filter(|s| **s == PendingEnhancementStatus::Failed)
                .count(),
            "result import finished"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Push notification
    // -----------------------------------------------------------------------

    /// Notify a robot of a leased batch over its `POST /batch/` endpoint.
    ///
    /// The normal flow is pull-only; a push is used when an operator wants a
    /// robot to start without waiting for its next poll. Transient failures
    /// (transport errors, 5xx) fail the batch and record the error on the
    /// request — it surfaces as failed and an operator may retry. A 4xx is a
    /// permanent rejection: the request is rejected with the robot's
    /// response text.
    pub async fn push_batch(&self, client: &RobotClient, batch_id: Uuid) -> RepoResult<()> {
        let mut batch = self.store.get_robot_batch(batch_id).await?;
        let robot = self.store.get_robot(batch.robot_id).await?;
        let now = Utc::now();
        let reference_file = BlobFile::parse_uri(
            batch
                .reference_file
                .as_deref()
                .ok_or_else(|| RepoError::UnitOfWork {
                    detail: format!("batch {batch_id} has no reference file pointer"),
                })?,
        )?;
        let result_file = BlobFile::parse_uri(
            batch
                .result_file
                .as_deref()
                .ok_or_else(|| RepoError::UnitOfWork {
                    detail: format!("batch {batch_id} has no result file pointer"),
                })?,
        )?;
        let request = BatchRobotRequestWire {
            id: batch.id,
            reference_storage_url: self
                .signer
                .sign(&reference_file, SignedUrlOp::Download, now)
                .to_url(),
            result_storage_url: self
                .signer
                .sign(&result_file, SignedUrlOp::Upload, now)
                .to_url(),
            extra_fields: None,
        };

        match client.dispatch_batch(&robot, &request).await {
            Ok(()) => Ok(()),
            Err(RepoError::RobotUnreachable { detail }) => {
                self.fail_batch_rows(&mut batch).await?;
                for request_id in self.request_ids_of(&batch).await? {
                    self.store.set_request_error(request_id, detail.clone()).await?;
                }
                Err(RepoError::RobotUnreachable { detail })
            }
            Err(RepoError::RobotEnhancement { detail }) => {
                self.fail_batch_rows(&mut batch).await?;
                for request_id in self.request_ids_of(&batch).await? {
                    self.store
                        .set_request_rejection(request_id, detail.clone())
                        .await?;
                }
                Err(RepoError::RobotEnhancement { detail })
            }
            Err(err) => Err(err),
        }
    }

    /// Fail a batch and every member row in store order: batch first, then
    /// the rows, leases cleared.
    async fn fail_batch_rows(&self, batch: &mut RobotEnhancementBatch) -> RepoResult<()> {
        batch.status = RobotEnhancementBatchStatus::Failed;
        self.store.update_robot_batch(batch.clone()).await?;
        self.store
            .set_pending_status(
                &batch.pending_enhancement_ids,
                PendingEnhancementStatus::Failed,
                None,
            )
            .await
    }

    // -----------------------------------------------------------------------
    // Expiry sweeper
    // -----------------------------------------------------------------------

    /// One sweeper pass: expire lapsed leases and insert retry siblings
    /// while the retry-chain depth allows; otherwise leave the request
    /// degraded.
    pub async fn sweep(&self, now: DateTime<Utc>) -> RepoResult<SweepStats> {
        let mut stats = SweepStats::default();
        let expired = self.store.expire_overdue(now).await;
        stats.expired = expired.len();

        for row in expired {
            let depth = self.store.retry_depth(row.id).await?;
            if depth < self.config.max_retry_depth {
                let sibling = PendingEnhancement::retry_sibling(&row);
                self.store.insert_pending(sibling).await?;
                stats.retried += 1;
            } else {
                warn!(
                    target: "refbase.dispatch.sweeper",
                    pending_enhancement_id = %row.id,
                    enhancement_request_id = %row.enhancement_request_id,
                    depth,
                    "retry budget exhausted"
                );
                self.store
                    .set_request_error(
                        row.enhancement_request_id,
                        format!(
                            "pending enhancement {} exhausted its retry budget",
                            row.id
                        ),
                    )
                    .await?;
                stats.exhausted += 1;
            }
        }
        if stats.expired > 0 {
            info!(
                target: "refbase.dispatch.sweeper",
                expired = stats.expired,
                retried = stats.retried,
                exhausted = stats.exhausted,
                "sweep complete"
            );
        }
        Ok(stats)
    }

    async fn request_ids_of(&self, batch: &RobotEnhancementBatch) -> RepoResult<Vec<Uuid>> {
        let mut ids = Vec::new();
        for pending_id in &batch.pending_enhancement_ids {
            let row = self.store.get_pending(*pending_id).await?;
            if !ids.contains(&row.enhancement_request_id) {
                ids.push(row.enhancement_request_id);
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refbase_blob::MemoryBlobClient;
    use refbase_core::{
        ClientSecret, EnhancementContent, ExternalIdentifier, LinkedIdentifier, Reference, Robot,
        Visibility,
    };

    struct Fixture {
        store: Arc<RepositoryStore>,
        blob: Arc<MemoryBlobClient>,
        bus: Arc<MessageBus>,
        engine: DispatchEngine,
        robot: Robot,
    }

    async fn fixture(config: DispatchConfig) -> Fixture {
        let store = Arc::new(RepositoryStore::new());
        let blob = Arc::new(MemoryBlobClient::new());
        let bus = Arc::new(MessageBus::new(
            Duration::from_secs(30),
            Duration::from_secs(3600),
        ));
        let signer = UrlSigner::new("test-signing-key", Duration::from_secs(3600));
        let engine = DispatchEngine::new(
            Arc::clone(&store),
            Arc::clone(&blob) as Arc<dyn BlobClient>,
            signer,
            Arc::clone(&bus),
            config,
            "refbase",
        );
        let robot = Robot::new(
            "abstract-bot",
            "http://robot.local",
            "makes abstracts",
            "team",
            ClientSecret::new("s"),
        );
        store.insert_robot(robot.clone()).await.unwrap();
        Fixture {
            store,
            blob,
            bus,
            engine,
            robot,
        }
    }

    async fn stored_reference(f: &Fixture, doi: &str) -> Reference {
        let mut r = Reference::new(Visibility::Public);
        r.identifiers.push(LinkedIdentifier::new(
            r.id,
            ExternalIdentifier::Doi {
                identifier: doi.into(),
            },
        ));
        f.store.insert_reference(r.clone()).await.unwrap();
        r
    }

    async fn request_for(f: &Fixture, references: &[Uuid]) -> EnhancementRequest {
        f.engine
            .create_request(
                EnhancementRequest::new(f.robot.id, references.to_vec())
                    .with_source("operator"),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn poll_leases_work_and_uploads_reference_file() {
        let f = fixture(DispatchConfig::default()).await;
        let a = stored_reference(&f, "10.1/a").await;
        let b = stored_reference(&f, "10.1/b").await;
        let request = request_for(&f, &[a.id, b.id]).await;

        let leased = f
            .engine
            .poll_batch(f.robot.id, 10, Some(Duration::from_secs(60)))
            .await
            .unwrap()
            .expect("work available");
        assert_eq!(leased.batch.pending_enhancement_ids.len(), 2);
        assert_eq!(leased.batch.status, RobotEnhancementBatchStatus::Pending);

        // The reference file holds one hydrated reference per line.
        let file = BlobFile::parse_uri(leased.batch.reference_file.as_deref().unwrap()).unwrap();
        let lines = f.blob.read_lines(&file).await.unwrap();
        assert_eq!(lines.len(), 2);
        let parsed: Reference = serde_json::from_str(&lines[0]).unwrap();
        assert!([a.id, b.id].contains(&parsed.id));

        // Grants: read on references, write on results.
        assert_eq!(leased.reference_file_url.op, SignedUrlOp::Download);
        assert_eq!(leased.result_file_url.op, SignedUrlOp::Upload);

        assert_eq!(
            f.engine.request_status(request.id).await.unwrap(),
            EnhancementRequestStatus::Accepted
        );
    }

    #[tokio::test]
    async fn competing_pollers_see_zero_rows() {
        let f = fixture(DispatchConfig::default()).await;
        let a = stored_reference(&f, "10.1/a").await;
        request_for(&f, &[a.id]).await;

        let first = f.engine.poll_batch(f.robot.id, 10, None).await.unwrap();
        assert!(first.is_some());
        let second = f.engine.poll_batch(f.robot.id, 10, None).await.unwrap();
        assert!(second.is_none(), "losing poller gets 204");
    }

    #[tokio::test]
    async fn limit_is_capped_by_max_batch_size() {
        let config = DispatchConfig {
            max_batch_size: 2,
            ..DispatchConfig::default()
        };
        let f = fixture(config).await;
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(stored_reference(&f, &format!("10.1/{i}")).await.id);
        }
        request_for(&f, &ids).await;

        let leased = f
            .engine
            .poll_batch(f.robot.id, 100, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased.batch.pending_enhancement_ids.len(), 2);
    }

    #[tokio::test]
    async fn renew_extends_while_work_remains_then_conflicts() {
        let f = fixture(DispatchConfig::default()).await;
        let a = stored_reference(&f, "10.1/a").await;
        request_for(&f, &[a.id]).await;
        let leased = f
            .engine
            .poll_batch(f.robot.id, 10, Some(Duration::from_secs(60)))
            .await
            .unwrap()
            .unwrap();

        let renewed = f
            .engine
            .renew_lease(leased.batch.id, Some(Duration::from_secs(600)))
            .await
            .unwrap();
        assert!(renewed.expires_at > leased.batch.expires_at);

        // Drain the batch, then renewal must conflict with the exact message.
        f.store
            .set_pending_status(
                &leased.batch.pending_enhancement_ids,
                PendingEnhancementStatus::Completed,
                None,
            )
            .await
            .unwrap();
        let err = f.engine.renew_lease(leased.batch.id, None).await.unwrap_err();
        assert_eq!(err.status(), 409);
        assert_eq!(err.detail(), NO_PENDING_ENHANCEMENTS);
    }

    #[tokio::test]
    async fn submitted_error_fails_batch_and_rows() {
        let f = fixture(DispatchConfig::default()).await;
        let a = stored_reference(&f, "10.1/a").await;
        let request = request_for(&f, &[a.id]).await;
        let leased = f.engine.poll_batch(f.robot.id, 10, None).await.unwrap().unwrap();

        f.engine
            .submit_result(
                leased.batch.id,
                ResultSubmissionWire {
                    error: Some("robot exploded".into()),
                },
            )
            .await
            .unwrap();

        let batch = f.store.get_robot_batch(leased.batch.id).await.unwrap();
        assert_eq!(batch.status, RobotEnhancementBatchStatus::Failed);
        assert_eq!(
            f.engine.request_status(request.id).await.unwrap(),
            EnhancementRequestStatus::Failed
        );
        let stored = f.store.get_request(request.id).await.unwrap();
        assert_eq!(stored.error.as_deref(), Some("robot exploded"));
    }

    #[tokio::test]
    async fn successful_submission_imports_results() {
        let f = fixture(DispatchConfig::default()).await;
        let a = stored_reference(&f, "10.1/a").await;
        let b = stored_reference(&f, "10.1/b").await;
        let request = request_for(&f, &[a.id, b.id]).await;
        let leased = f.engine.poll_batch(f.robot.id, 10, None).await.unwrap().unwrap();

        // The robot writes its result artifact: one enhancement, one error.
        let result_file =
            BlobFile::parse_uri(leased.batch.result_file.as_deref().unwrap()).unwrap();
        let lines = vec![
            format!(
                r#"{{"reference_id":"{}","source":"abstract-bot","visibility":"public","enhancement_type":"abstract","abstract_text":"An abstract."}}"#,
                a.id
            ),
            format!(r#"{{"reference_id":"{}","error":"nothing found"}}"#, b.id),
        ];
        f.blob.upload_lines(&result_file, &lines).await.unwrap();

        f.engine
            .submit_result(leased.batch.id, ResultSubmissionWire::default())
            .await
            .unwrap();
        assert_eq!(
            f.engine.request_status(request.id).await.unwrap(),
            EnhancementRequestStatus::Importing
        );

        // Run the background import the way a worker would.
        let delivery = f.bus.receive().await.unwrap();
        assert_eq!(delivery.task.kind, IMPORT_ROBOT_RESULTS);
        f.engine.import_results(leased.batch.id).await.unwrap();
        f.bus.ack(delivery.task.id).await.unwrap();

        let enhanced = f.store.get_reference(a.id).await.unwrap();
        assert_eq!(enhanced.enhancements.len(), 1);
        assert!(matches!(
            enhanced.enhancements[0].content,
            EnhancementContent::Abstract { .. }
        ));

        let batch = f.store.get_robot_batch(leased.batch.id).await.unwrap();
        assert_eq!(batch.status, RobotEnhancementBatchStatus::Completed);
        assert_eq!(
            f.engine.request_status(request.id).await.unwrap(),
            EnhancementRequestStatus::PartialFailed
        );

        // The completed reference rides the continuation chain.
        let mut dedup_tasks = 0;
        while let Some(delivery) = f.bus.receive().await {
            if delivery.task.kind == DEDUP_REFERENCE {
                dedup_tasks += 1;
            }
            f.bus.ack(delivery.task.id).await.unwrap();
        }
        assert_eq!(dedup_tasks, 1);
    }

    #[tokio::test]
    async fn missing_references_fail_when_artifact_is_short() {
        let f = fixture(DispatchConfig::default()).await;
        let a = stored_reference(&f, "10.1/a").await;
        let request = request_for(&f, &[a.id]).await;
        let leased = f.engine.poll_batch(f.robot.id, 10, None).await.unwrap().unwrap();

        let result_file =
            BlobFile::parse_uri(leased.batch.result_file.as_deref().unwrap()).unwrap();
        f.blob.upload_lines(&result_file, &[]).await.unwrap();
        f.engine
            .submit_result(leased.batch.id, ResultSubmissionWire::default())
            .await
            .unwrap();
        f.engine.import_results(leased.batch.id).await.unwrap();

        assert_eq!(
            f.engine.request_status(request.id).await.unwrap(),
            EnhancementRequestStatus::Failed
        );
    }

    #[tokio::test]
    async fn expiry_retries_until_the_budget_runs_out() {
        let config = DispatchConfig {
            max_retry_depth: 3,
            ..DispatchConfig::default()
        };
        let f = fixture(config).await;
        let a = stored_reference(&f, "10.1/a").await;
        let request = request_for(&f, &[a.id]).await;

        for round in 0..3 {
            let leased = f
                .engine
                .poll_batch(f.robot.id, 10, Some(Duration::from_secs(60)))
                .await
                .unwrap()
                .unwrap_or_else(|| panic!("round {round}: work expected"));
            assert_eq!(leased.batch.pending_enhancement_ids.len(), 1);

            // The lease lapses without a submission.
            let past_lease = Utc::now() + ChronoDuration::seconds(120);
            let stats = f.engine.sweep(past_lease).await.unwrap();
            assert_eq!(stats.expired, 1);
            assert_eq!(stats.retried, 1, "round {round} should retry");
        }

        // Fourth expiry exhausts the chain (depth 3 == max).
        let leased = f.engine.poll_batch(f.robot.id, 10, None).await.unwrap().unwrap();
        assert_eq!(leased.batch.pending_enhancement_ids.len(), 1);
        let past_lease = Utc::now() + ChronoDuration::days(1);
        let stats = f.engine.sweep(past_lease).await.unwrap();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.retried, 0);
        assert_eq!(stats.exhausted, 1);

        assert_eq!(
            f.engine.request_status(request.id).await.unwrap(),
            EnhancementRequestStatus::Failed
        );
        let degraded = f.store.get_request(request.id).await.unwrap();
        assert!(degraded.error.is_some());

        // Nothing left to poll.
        assert!(f.engine.poll_batch(f.robot.id, 10, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn push_notifies_the_robot_with_signed_urls() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/batch/"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let f = fixture(DispatchConfig::default()).await;
        let mut robot = f.robot.clone();
        robot.name = "pushable-bot".into();
        robot.base_url = server.uri();
        robot.id = Uuid::new_v4();
        f.store.insert_robot(robot.clone()).await.unwrap();

        let a = stored_reference(&f, "10.1/a").await;
        f.engine
            .create_request(EnhancementRequest::new(robot.id, vec![a.id]))
            .await
            .unwrap();
        let leased = f.engine.poll_batch(robot.id, 10, None).await.unwrap().unwrap();

        let client = RobotClient::new(Duration::from_secs(5)).unwrap();
        f.engine.push_batch(&client, leased.batch.id).await.unwrap();

        let received = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
        assert_eq!(body["id"], serde_json::json!(leased.batch.id));
        assert!(body["reference_storage_url"]
            .as_str()
            .unwrap()
            .contains("sig="));
    }

    #[tokio::test]
    async fn push_rejection_marks_the_request_rejected() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/batch/"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad shape"))
            .mount(&server)
            .await;

        let f = fixture(DispatchConfig::default()).await;
        let mut robot = f.robot.clone();
        robot.name = "rejecting-bot".into();
        robot.base_url = server.uri();
        robot.id = Uuid::new_v4();
        f.store.insert_robot(robot.clone()).await.unwrap();

        let a = stored_reference(&f, "10.1/a").await;
        let request = f
            .engine
            .create_request(EnhancementRequest::new(robot.id, vec![a.id]))
            .await
            .unwrap();
        let leased = f.engine.poll_batch(robot.id, 10, None).await.unwrap().unwrap();

        let client = RobotClient::new(Duration::from_secs(5)).unwrap();
        let err = f
            .engine
            .push_batch(&client, leased.batch.id)
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::RobotEnhancement { .. }));

        let batch = f.store.get_robot_batch(leased.batch.id).await.unwrap();
        assert_eq!(batch.status, RobotEnhancementBatchStatus::Failed);
        // A permanent rejection is distinct from a transient failure: the
        // request is rejected, with the robot's response text recorded.
        assert_eq!(
            f.engine.request_status(request.id).await.unwrap(),
            EnhancementRequestStatus::Rejected
        );
        let stored = f.store.get_request(request.id).await.unwrap();
        assert_eq!(stored.rejection.as_deref(), Some("bad shape"));
    }

    #[tokio::test]
    async fn push_transport_failure_marks_the_request_failed() {
        let f = fixture(DispatchConfig::default()).await;
        let mut robot = f.robot.clone();
        robot.name = "unreachable-bot".into();
        robot.base_url = "http://127.0.0.1:9".into();
        robot.id = Uuid::new_v4();
        f.store.insert_robot(robot.clone()).await.unwrap();

        let a = stored_reference(&f, "10.1/a").await;
        let request = f
            .engine
            .create_request(EnhancementRequest::new(robot.id, vec![a.id]))
            .await
            .unwrap();
        let leased = f.engine.poll_batch(robot.id, 10, None).await.unwrap().unwrap();

        let client = RobotClient::new(Duration::from_millis(200)).unwrap();
        let err = f
            .engine
            .push_batch(&client, leased.batch.id)
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::RobotUnreachable { .. }));

        let batch = f.store.get_robot_batch(leased.batch.id).await.unwrap();
        assert_eq!(batch.status, RobotEnhancementBatchStatus::Failed);
        assert_eq!(
            f.engine.request_status(request.id).await.unwrap(),
            EnhancementRequestStatus::Failed
        );
        let stored = f.store.get_request(request.id).await.unwrap();
        assert!(stored.error.is_some());
        assert!(stored.rejection.is_none());
    }

    #[tokio::test]
    async fn sweep_ignores_live_leases() {
        let f = fixture(DispatchConfig::default()).await;
        let a = stored_reference(&f, "10.1/a").await;
        request_for(&f, &[a.id]).await;
        f.engine
            .poll_batch(f.robot.id, 10, Some(Duration::from_secs(600)))
            .await
            .unwrap()
            .unwrap();
        let stats = f.engine.sweep(Utc::now()).await.unwrap();
        assert_eq!(stats, SweepStats::default());
    }
}
