// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! The robot-automation percolation engine.
//!
//! Operators register an automation as a stored query: "if some reference
//! matches this shape, enqueue work for robot X". On every reference change
//! the engine assembles a `{reference, changeset}` document, percolates the
//! whole batch of changes in one request, maps matched slots back to
//! reference ids, and emits pending enhancements — unless live work for the
//! same (robot, reference) already exists.

use refbase_core::{
    EnhancementRequest, PendingEnhancement, ReferenceWithChangeset, RobotAutomation,
};
use refbase_error::RepoResult;
use refbase_search::PercolationIndex;
use refbase_store::RepositoryStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Source string recorded on automation-emitted work.
pub const AUTOMATION_SOURCE: &str = "robot-automation";

/// Work emitted by one percolation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AutomationFirings {
    /// Pending-enhancement rows inserted, per robot.
    pub enqueued: BTreeMap<Uuid, Vec<Uuid>>,
    /// (robot, reference) pairs suppressed because live work already exists.
    pub suppressed: usize,
}

/// The percolation engine.
pub struct AutomationEngine {
    store: Arc<RepositoryStore>,
    percolator: Arc<PercolationIndex>,
}

impl AutomationEngine {
    /// Create the engine.
    #[must_use]
    pub fn new(store: Arc<RepositoryStore>, percolator: Arc<PercolationIndex>) -> Self {
        Self { store, percolator }
    }

    /// Register (or replace) an automation in both the authoritative store
    /// and the percolation index. The query is validated by the index.
    pub async fn register(&self, automation: RobotAutomation) -> RepoResult<()> {
        self.percolator
            .register(
                automation.id,
                automation.robot_id,
                automation.query.clone(),
            )
            .await?;
        self.store.upsert_automation(automation).await
    }

    /// Remove an automation from both sides.
    pub async fn remove(&self, automation_id: Uuid) -> bool {
        let in_index = self.percolator.remove(automation_id).await;
        let in_store = self.store.remove_automation(automation_id).await;
        in_index || in_store
    }

    /// Percolate a batch of reference changes and emit pending work.
    ///
    /// All N documents go to the percolation index in a single request; the
    /// per-query matched slots come back and are mapped to reference ids.
    /// For each (robot, reference) produced, a pending enhancement is
    /// inserted unless one already exists with status pending or processing.
    /// Each robot's firings in a pass are grouped under one enhancement
    /// request sourced `robot-automation`.
    pub async fn on_changes(
        &self,
        changes: &[ReferenceWithChangeset],
    ) -> RepoResult<AutomationFirings> {
        let mut firings = AutomationFirings::default();
        if changes.is_empty() {
            return Ok(firings);
        }

        let documents: Vec<serde_json::Value> =
            changes.iter().map(ReferenceWithChangeset::to_document).collect();
        let matches = self.percolator.percolate(&documents).await;
        debug!(
            target: "refbase.automate.percolate",
            documents = documents.len(),
            matched_queries = matches.len(),
            "percolated change batch"
        );

        // robot → matched reference ids, deduplicated across automations.
        let mut per_robot: BTreeMap<Uuid, Vec<Uuid>> = BTreeMap::new();
        for matched in matches {
            let robot_refs = per_robot.entry(matched.robot_id).or_default();
            for slot in matched.slots {
                let reference_id = changes[slot].reference.id;
                if !robot_refs.contains(&reference_id) {
                    robot_refs.push(reference_id);
                }
            }
        }

        for (robot_id, reference_ids) in per_robot {
            let request = EnhancementRequest::new(robot_id, reference_ids.clone())
                .with_source(AUTOMATION_SOURCE);
            self.store.insert_request(request.clone()).await?;

            let mut inserted = Vec::new();
            for reference_id in reference_ids {
                let pending = PendingEnhancement::new(
                    reference_id,
                    robot_id,
                    request.id,
                    AUTOMATION_SOURCE,
                );
                if self.store.insert_pending_if_absent(pending.clone()).await? {
                    inserted.push(pending.id);
                } else {
                    firings.suppressed += 1;
                }
            }
            if !inserted.is_empty() {
                info!(
                    target: "refbase.automate.percolate",
                    robot_id = %robot_id,
                    enqueued = inserted.len(),
                    "automation fired"
                );
                firings.enqueued.insert(robot_id, inserted);
            }
        }
        Ok(firings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refbase_core::{
        ClientSecret, Enhancement, EnhancementContent, ExternalIdentifier, LinkedIdentifier,
        Reference, ReferenceChangeset, Robot, Visibility,
    };
    use serde_json::json;

    struct Fixture {
        store: Arc<RepositoryStore>,
        engine: AutomationEngine,
        robot: Robot,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(RepositoryStore::new());
        let engine = AutomationEngine::new(Arc::clone(&store), Arc::new(PercolationIndex::new()));
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
            engine,
            robot,
        }
    }

    /// "The change added a DOI and the reference has no abstract."
    fn doi_no_abstract_query() -> serde_json::Value {
        json!({
            "bool": {
                "must": [
                    {"term": {"changeset.added_identifiers.identifier_type": "doi"}},
                ],
                "must_not": [
                    {"term": {"reference.enhancements.content.enhancement_type": "abstract"}},
                ],
            }
        })
    }

    fn reference_without_doi() -> Reference {
        let mut r = Reference::new(Visibility::Public);
        r.identifiers.push(LinkedIdentifier::new(
            r.id,
            ExternalIdentifier::PmId {
                identifier: "123".into(),
            },
        ));
        r
    }

    async fn register_automation(f: &Fixture) -> RobotAutomation {
        let automation = RobotAutomation::new(f.robot.id, doi_no_abstract_query());
        f.engine.register(automation.clone()).await.unwrap();
        automation
    }

    fn change_adding_doi(reference: &mut Reference) -> ReferenceWithChangeset {
        let added = ExternalIdentifier::Doi {
            identifier: "10.1/new".into(),
        };
        reference
            .identifiers
            .push(LinkedIdentifier::new(reference.id, added.clone()));
        ReferenceWithChangeset {
            reference: reference.clone(),
            changeset: ReferenceChangeset {
                added_identifiers: vec![added],
                added_enhancements: vec![],
            },
        }
    }

    #[tokio::test]
    async fn firing_emits_pending_work() {
        let f = fixture().await;
        register_automation(&f).await;

        let mut reference = reference_without_doi();
        f.store.insert_reference(reference.clone()).await.unwrap();

        // Ingest without a DOI does not fire.
        let no_doi_change = ReferenceWithChangeset {
            changeset: ReferenceChangeset::full(&reference),
            reference: reference.clone(),
        };
        let firings = f.engine.on_changes(&[no_doi_change]).await.unwrap();
        assert!(firings.enqueued.is_empty());

        // A merge that adds a DOI fires.
        let change = change_adding_doi(&mut reference);
        f.store.update_reference(reference.clone()).await.unwrap();
        let firings = f.engine.on_changes(&[change]).await.unwrap();
        assert_eq!(firings.enqueued[&f.robot.id].len(), 1);

        // The emitted row is pollable work for the robot.
        let claimed = f
            .store
            .claim_pending(
                f.robot.id,
                10,
                chrono::Utc::now() + chrono::Duration::seconds(60),
            )
            .await;
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].reference_id, reference.id);
        assert_eq!(claimed[0].source, AUTOMATION_SOURCE);
    }

    #[tokio::test]
    async fn live_work_suppresses_duplicates() {
        let f = fixture().await;
        register_automation(&f).await;

        let mut reference = reference_without_doi();
        f.store.insert_reference(reference.clone()).await.unwrap();
        let change = change_adding_doi(&mut reference);
        f.store.update_reference(reference.clone()).await.unwrap();

        let first = f.engine.on_changes(&[change.clone()]).await.unwrap();
        assert_eq!(first.enqueued.len(), 1);

        // The same change percolated again: work is already pending.
        let second = f.engine.on_changes(&[change]).await.unwrap();
        assert!(second.enqueued.is_empty());
        assert_eq!(second.suppressed, 1);
    }

    #[tokio::test]
    async fn current_state_blocks_matching() {
        let f = fixture().await;
        register_automation(&f).await;

        // The reference already carries an abstract, so even a DOI-adding
        // change must not fire.
        let mut reference = reference_without_doi();
        reference.enhancements.push(Enhancement::new(
            reference.id,
            "abstract-bot",
            Visibility::Public,
            EnhancementContent::Abstract {
                process: None,
                abstract_text: "present".into(),
            },
        ));
        f.store.insert_reference(reference.clone()).await.unwrap();
        let change = change_adding_doi(&mut reference);
        let firings = f.engine.on_changes(&[change]).await.unwrap();
        assert!(firings.enqueued.is_empty());
    }

    #[tokio::test]
    async fn batch_percolation_maps_slots_to_references() {
        let f = fixture().await;
        register_automation(&f).await;

        let mut with_doi = reference_without_doi();
        f.store.insert_reference(with_doi.clone()).await.unwrap();
        let firing_change = change_adding_doi(&mut with_doi);
        f.store.update_reference(with_doi.clone()).await.unwrap();

        let quiet = reference_without_doi();
        f.store.insert_reference(quiet.clone()).await.unwrap();
        let quiet_change = ReferenceWithChangeset {
            changeset: ReferenceChangeset::default(),
            reference: quiet,
        };

        let firings = f
            .engine
            .on_changes(&[quiet_change, firing_change])
            .await
            .unwrap();
        let enqueued = &firings.enqueued[&f.robot.id];
        assert_eq!(enqueued.len(), 1);
        let row = f.store.get_pending(enqueued[0]).await.unwrap();
        assert_eq!(row.reference_id, with_doi.id);
    }

    #[tokio::test]
    async fn removed_automation_stops_firing() {
        let f = fixture().await;
        let automation = register_automation(&f).await;
        assert!(f.engine.remove(automation.id).await);

        let mut reference = reference_without_doi();
        f.store.insert_reference(reference.clone()).await.unwrap();
        let change = change_adding_doi(&mut reference);
        let firings = f.engine.on_changes(&[change]).await.unwrap();
        assert!(firings.enqueued.is_empty());
    }
}
