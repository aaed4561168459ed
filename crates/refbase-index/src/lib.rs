// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Versioned index management behind a stable alias.
//!
//! Clients always talk to the alias (e.g. `reference`); the alias points at
//! exactly one concrete versioned index (e.g. `reference_v7`). Migration is
//! zero-downtime: a new version is populated by a background reindex, the old
//! index is write-blocked, a second pass tops up anything written in between,
//! and the alias swap is atomic. Repair walks the authoritative store and
//! reprojects every reference into the aliased index; it is emitted as a
//! background task so migrate/rebuild do not block on it.

use refbase_bus::{MessageBus, Task};
use refbase_core::tasks::{RepairPayload, REPAIR_INDEX};
use refbase_core::DuplicateDetermination;
use refbase_dedup::project_cluster;
use refbase_error::{RepoError, RepoResult};
use refbase_search::SearchEngine;
use refbase_store::RepositoryStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Statistics from one repair walk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairStats {
    /// Documents upserted.
    pub projected: usize,
    /// Shadow (duplicate) documents removed.
    pub removed: usize,
}

/// Manages one aliased index family.
pub struct IndexManager {
    engine: Arc<SearchEngine>,
    store: Arc<RepositoryStore>,
    bus: Arc<MessageBus>,
    alias: String,
    version_prefix: String,
    poll_interval: Duration,
}

impl IndexManager {
    /// Create a manager for `alias`.
    #[must_use]
    pub fn new(
        engine: Arc<SearchEngine>,
        store: Arc<RepositoryStore>,
        bus: Arc<MessageBus>,
        alias: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            store,
            bus,
            alias: alias.into(),
            version_prefix: "v".into(),
            poll_interval: Duration::from_millis(50),
        }
    }

    /// The alias this manager owns.
    #[must_use]
    pub fn alias(&self) -> &str {
        &self.alias
    }

    fn versioned_name(&self, version: u32) -> String {
        format!("{}_{}{}", self.alias, self.version_prefix, version)
    }

    /// Parse the version number out of a physical index name.
    fn parse_version(&self, index_name: &str) -> Option<u32> {
        let marker = format!("_{}", self.version_prefix);
        index_name
            .rsplit_once(&marker)
            .and_then(|(_, version)| version.parse().ok())
    }

    /// The physical index the alias currently points at.
    pub async fn current_index(&self) -> Option<String> {
        self.engine.alias_target(&self.alias).await
    }

    /// The current version number, when the alias exists and is versioned.
    pub async fn current_version(&self) -> Option<u32> {
        let current = self.current_index().await?;
        self.parse_version(&current)
    }

    /// Create `<alias>_v1` and attach the alias when the family is absent.
    ///
    /// Returns the name of the active index either way.
    pub async fn ensure_initialized(&self) -> RepoResult<String> {
        if let Some(current) = self.current_index().await {
            return Ok(current);
        }
        let name = self.versioned_name(1);
        self.engine.create_index(&name).await?;
        self.engine.put_alias(&name, &self.alias).await?;
        info!(
            target: "refbase.index.manager",
            alias = %self.alias,
            index = %name,
            "initialized index family"
        );
        Ok(name)
    }

    /// Migrate to a new index version with zero downtime.
    ///
    /// Steps: create `v(N+1)` → background reindex with polling →
    /// write-block the current index → second reindex pass to catch writes
    /// that landed during the first → atomic alias swap. The old index stays
    /// behind for later explicit [`IndexManager::delete_index`].
    pub async fn migrate(&self) -> RepoResult<String> {
        let Some(source) = self.current_index().await else {
            info!(
                target: "refbase.index.manager",
                alias = %self.alias,
                "no existing index, initialising instead of migrating"
            );
            return self.ensure_initialized().await;
        };
        let current_version = self.parse_version(&source).unwrap_or(0);
        let destination = self.versioned_name(current_version + 1);

        info!(
            target: "refbase.index.manager",
            alias = %self.alias,
            source = %source,
            destination = %destination,
            "starting migration"
        );
        self.engine.create_index(&destination).await?;

        let task = self.engine.start_reindex(&source, &destination).await?;
        task.wait(self.poll_interval).await;

        self.engine.add_write_block(&source).await?;

        // Anything written between the first pass and the block.
        let task = self.engine.start_reindex(&source, &destination).await?;
        let status = task.wait(self.poll_interval).await;
        info!(
            target: "refbase.index.manager",
            transferred = status.transferred,
            skipped = status.skipped,
            "top-up reindex complete"
        );

        self.engine
            .swap_alias(&self.alias, &source, &destination)
            .await?;
        Ok(destination)
    }

    /// Roll the alias back to a previous version (default: current − 1) or a
    /// named index. Refuses version zero or below and absent targets.
    pub async fn rollback(
        &self,
        target_version: Option<u32>,
        target_index: Option<String>,
    ) -> RepoResult<String> {
        let current = self
            .current_index()
            .await
            .ok_or_else(|| RepoError::not_found("alias", self.alias.clone()))?;

        let target = match target_index {
            Some(name) => name,
            None => {
                let current_version =
                    self.parse_version(&current)
                        .ok_or_else(|| RepoError::Conflict {
                            detail: format!(
                                "current index {current} is unversioned; name a target index"
                            ),
                        })?;
                let target_version = match target_version {
                    Some(v) => v,
                    None => current_version.checked_sub(1).unwrap_or(0),
                };
                if target_version < 1 {
                    return Err(RepoError::conflict(
                        "cannot roll back to version zero or below",
                    ));
                }
                self.versioned_name(target_version)
            }
        };

        if !self.engine.index_exists(&target).await {
            return Err(RepoError::not_found("index", target));
        }
        self.engine.swap_alias(&self.alias, &current, &target).await?;
        info!(
            target: "refbase.index.manager",
            alias = %self.alias,
            from = %current,
            to = %target,
            "rolled back"
        );
        Ok(target)
    }

    /// Explicitly delete a retired index. Refused while aliases remain.
    pub async fn delete_index(&self, index_name: &str) -> RepoResult<()> {
        self.engine.delete_index(index_name).await
    }

    /// DESTRUCTIVE: drop the alias, delete the current index, recreate it
    /// empty, reattach the alias, and enqueue a repair to repopulate.
    pub async fn rebuild(&self) -> RepoResult<()> {
        let current = self
            .current_index()
            .await
            .ok_or_else(|| RepoError::not_found("alias", self.alias.clone()))?;
        warn!(
            target: "refbase.index.manager",
            alias = %self.alias,
            index = %current,
            "rebuilding index destructively"
        );
        self.engine.remove_alias(&self.alias).await?;
        self.engine.delete_index(&current).await?;
        self.engine.create_index(&current).await?;
        self.engine.put_alias(&current, &self.alias).await?;
        self.enqueue_repair().await;
        Ok(())
    }

    /// Emit the repair task onto the bus.
    pub async fn enqueue_repair(&self) {
        let payload = serde_json::to_value(RepairPayload {
            alias: self.alias.clone(),
        })
        .unwrap_or_default();
        self.bus.publish(Task::new(REPAIR_INDEX, payload)).await;
    }

    /// Walk the authoritative store and reproject everything into the
    /// aliased index.
    ///
    /// Canonical and unsearchable references are upserted as their cluster's
    /// union projection; references whose active decision marks them
    /// duplicates have any lingering shadow document removed. References
    /// with no decision yet are projected as unresolved.
    pub async fn repair(&self) -> RepoResult<RepairStats> {
        let mut stats = RepairStats::default();
        for reference_id in self.store.all_reference_ids().await {
            let determination = self
                .store
                .active_decision(reference_id)
                .await
                .map_or(DuplicateDetermination::Unresolved, |d| d.determination);
            match determination {
                DuplicateDetermination::Duplicate | DuplicateDetermination::ExactDuplicate => {
                    if self.engine.delete_doc(&self.alias, reference_id).await? {
                        stats.removed += 1;
                    }
                }
                DuplicateDetermination::Canonical
                | DuplicateDetermination::Unsearchable
                | DuplicateDetermination::Unresolved => {
                    let reference = self.store.get_reference(reference_id).await?;
                    let duplicate_ids = self.store.duplicates_of(reference_id).await;
                    let duplicates = self.store.get_references(&duplicate_ids).await;
                    let doc = project_cluster(&reference, &duplicates, determination);
                    self.engine.upsert(&self.alias, doc).await?;
                    stats.projected += 1;
                }
            }
        }
        info!(
            target: "refbase.index.manager",
            alias = %self.alias,
            projected = stats.projected,
            removed = stats.removed,
            "repair complete"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refbase_core::{
        Enhancement, EnhancementContent, ExternalIdentifier, LinkedIdentifier, Reference,
        ReferenceDuplicateDecision, Visibility,
    };
    use refbase_search::ReferenceDoc;
    use uuid::Uuid;

    fn manager() -> IndexManager {
        IndexManager::new(
            Arc::new(SearchEngine::new()),
            Arc::new(RepositoryStore::new()),
            Arc::new(MessageBus::new(
                Duration::from_secs(30),
                Duration::from_secs(3600),
            )),
            "reference",
        )
    }

    fn doc(title: &str) -> ReferenceDoc {
        let mut d = ReferenceDoc::minimal(Uuid::new_v4());
        d.title = Some(title.to_string());
        d
    }

    #[tokio::test]
    async fn initialize_creates_v1() {
        let m = manager();
        let name = m.ensure_initialized().await.unwrap();
        assert_eq!(name, "reference_v1");
        assert_eq!(m.current_version().await, Some(1));
        // Idempotent.
        assert_eq!(m.ensure_initialized().await.unwrap(), "reference_v1");
    }

    #[tokio::test]
    async fn migrate_preserves_documents_and_bumps_version() {
        let m = manager();
        m.ensure_initialized().await.unwrap();
        for i in 0..5 {
            m.engine
                .upsert("reference", doc(&format!("doc {i}")))
                .await
                .unwrap();
        }
        let destination = m.migrate().await.unwrap();
        assert_eq!(destination, "reference_v2");
        assert_eq!(m.current_version().await, Some(2));
        assert_eq!(m.engine.count("reference").await.unwrap(), 5);
        // The old index still exists for rollback, now write-blocked.
        assert!(m.engine.index_exists("reference_v1").await);
        assert!(m.engine.upsert("reference_v1", doc("late")).await.is_err());
    }

    #[tokio::test]
    async fn migrate_then_rollback_restores_alias_and_count() {
        let m = manager();
        m.ensure_initialized().await.unwrap();
        for i in 0..3 {
            m.engine
                .upsert("reference", doc(&format!("doc {i}")))
                .await
                .unwrap();
        }
        m.migrate().await.unwrap();
        let restored = m.rollback(None, None).await.unwrap();
        assert_eq!(restored, "reference_v1");
        assert_eq!(m.current_index().await.as_deref(), Some("reference_v1"));
        assert_eq!(m.engine.count("reference").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn rollback_refuses_version_zero() {
        let m = manager();
        m.ensure_initialized().await.unwrap();
        let err = m.rollback(None, None).await.unwrap_err();
        assert_eq!(err.status(), 409);
        let err = m.rollback(Some(0), None).await.unwrap_err();
        assert_eq!(err.status(), 409);
    }

    #[tokio::test]
    async fn delete_refused_while_aliased_then_allowed() {
        let m = manager();
        m.ensure_initialized().await.unwrap();
        m.migrate().await.unwrap();
        assert!(m.delete_index("reference_v2").await.is_err());
        assert!(m.delete_index("reference_v1").await.is_ok());
    }

    fn stored_reference(doi: &str, title: &str) -> Reference {
        let mut r = Reference::new(Visibility::Public);
        r.identifiers.push(LinkedIdentifier::new(
            r.id,
            ExternalIdentifier::Doi {
                identifier: doi.into(),
            },
        ));
        r.enhancements.push(Enhancement::new(
            r.id,
            "openalex",
            Visibility::Public,
            EnhancementContent::Bibliographic {
                title: Some(title.into()),
                authorship: vec![],
                publication_year: Some(2024),
                publication_date: None,
                cited_by_count: None,
            },
        ));
        r
    }

    #[tokio::test]
    async fn rebuild_drops_and_repairs_via_bus_task() {
        let m = manager();
        m.ensure_initialized().await.unwrap();

        let reference = stored_reference("10.1/x", "kept through rebuild");
        m.store.insert_reference(reference.clone()).await.unwrap();
        m.store
            .insert_decision(ReferenceDuplicateDecision::active(
                reference.id,
                DuplicateDetermination::Canonical,
            ))
            .await
            .unwrap();
        m.engine
            .upsert("reference", doc("stale document"))
            .await
            .unwrap();

        m.rebuild().await.unwrap();
        assert_eq!(m.engine.count("reference").await.unwrap(), 0);

        // The repair task is on the bus; run it the way a worker would.
        let delivery = m.bus.receive().await.unwrap();
        assert_eq!(delivery.task.kind, REPAIR_INDEX);
        let stats = m.repair().await.unwrap();
        m.bus.ack(delivery.task.id).await.unwrap();

        assert_eq!(stats.projected, 1);
        assert_eq!(m.engine.count("reference").await.unwrap(), 1);
        let projected = m
            .engine
            .get_doc("reference", reference.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(projected.title.as_deref(), Some("Kept Through Rebuild"));
    }

    #[tokio::test]
    async fn repair_removes_shadow_documents_and_merges_clusters() {
        let m = manager();
        m.ensure_initialized().await.unwrap();

        let canonical = stored_reference("10.1/x", "canonical work");
        let duplicate = stored_reference("10.2/y", "canonical work");
        m.store.insert_reference(canonical.clone()).await.unwrap();
        m.store.insert_reference(duplicate.clone()).await.unwrap();
        m.store
            .insert_decision(ReferenceDuplicateDecision::active(
                canonical.id,
                DuplicateDetermination::Canonical,
            ))
            .await
            .unwrap();
        m.store
            .insert_decision(
                ReferenceDuplicateDecision::active(
                    duplicate.id,
                    DuplicateDetermination::Duplicate,
                )
                .with_canonical(canonical.id),
            )
            .await
            .unwrap();

        // Drift: the duplicate still has a document in the index.
        m.engine
            .upsert("reference", ReferenceDoc::minimal(duplicate.id))
            .await
            .unwrap();

        let stats = m.repair().await.unwrap();
        assert_eq!(stats.projected, 1);
        assert_eq!(stats.removed, 1);
        assert_eq!(m.engine.count("reference").await.unwrap(), 1);
        let merged = m
            .engine
            .get_doc("reference", canonical.id)
            .await
            .unwrap()
            .unwrap();
        assert!(merged.identifiers.iter().any(|i| i.identifier == "10.2/y"));
    }
}
