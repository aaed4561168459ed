// SPDX-License-Identifier: MIT OR Apache-2.0
//! The canonical reference unit and its merge semantics.

use crate::changeset::ReferenceChangeset;
use crate::enhancement::{Enhancement, EnhancementKind};
use crate::identifier::{IdentifierKey, LinkedIdentifier};
use crate::imports::CollisionStrategy;
use chrono::{DateTime, Utc};
use refbase_error::{RepoError, RepoResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Visibility of a data element in the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Visible to the general public without authentication.
    #[default]
    Public,
    /// Requires authentication to be visible.
    Restricted,
    /// Not visible, but may be passed to data-mining processes.
    Hidden,
}

/// The canonical unit: a work known to the repository.
///
/// Invariant: every reference has at least one identifier after any
/// successful ingest. References are never hard-deleted; one that becomes a
/// duplicate is retained as a shadow behind its canonical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Reference {
    /// Time-ordered 128-bit id.
    pub id: Uuid,
    /// Visibility of the reference.
    pub visibility: Visibility,
    /// Identifier rows owned by this reference.
    pub identifiers: Vec<LinkedIdentifier>,
    /// Enhancement rows owned by this reference.
    pub enhancements: Vec<Enhancement>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Reference {
    /// Create an empty reference with a fresh time-ordered id.
    #[must_use]
    pub fn new(visibility: Visibility) -> Self {
        Self {
            id: Uuid::now_v7(),
            visibility,
            identifiers: Vec::new(),
            enhancements: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// The uniqueness keys of all owned identifiers.
    #[must_use]
    pub fn identifier_keys(&self) -> BTreeSet<IdentifierKey> {
        self.identifiers.iter().map(|l| l.identifier.key()).collect()
    }

    /// The most recently created enhancement of the given kind, if any.
    #[must_use]
    pub fn latest_enhancement(&self, kind: EnhancementKind) -> Option<&Enhancement> {
        self.enhancements
            .iter()
            .filter(|e| e.content.kind() == kind)
            .max_by_key(|e| e.created_at)
    }

    /// Check the ≥1-identifier invariant.
    pub fn validate(&self) -> RepoResult<()> {
        if self.identifiers.is_empty() {
            return Err(RepoError::invalid_payload(
                "reference must carry at least one identifier",
            ));
        }
        Ok(())
    }

    /// Merge an incoming reference into this one under a collision strategy.
    ///
    /// Identifier and enhancement rows already present on `self` are grafted
    /// onto matching incoming rows (same uniqueness key), so pre-existing row
    /// ids are reused across merges rather than duplicated.
    ///
    /// Returns the changeset actually applied: identifiers and enhancements
    /// that were added to (or replaced on) this reference.
    pub fn merge(
        &mut self,
        mut incoming: Reference,
        strategy: CollisionStrategy,
    ) -> RepoResult<ReferenceChangeset> {
        if self.identifiers.is_empty() || incoming.identifiers.is_empty() {
            return Err(RepoError::UnitOfWork {
                detail: "merge requires identifiers on both sides".into(),
            });
        }

        let existing_id_keys = self.identifier_keys();
        let existing_enh_keys: BTreeSet<(EnhancementKind, String)> = self
            .enhancements
            .iter()
            .map(|e| (e.content.kind(), e.source.clone()))
            .collect();

        // Graft matching row ids from self onto incoming.
        for incoming_identifier in &mut incoming.identifiers {
            incoming_identifier.reference_id = self.id;
            if let Some(existing) = self
                .identifiers
                .iter()
                .find(|l| l.identifier.key() == incoming_identifier.identifier.key())
            {
                incoming_identifier.id = existing.id;
            }
        }
        for incoming_enhancement in &mut incoming.enhancements {
            incoming_enhancement.reference_id = self.id;
            if let Some(existing) = self
                .enhancements
                .iter()
                .find(|e| e.dedupe_key() == incoming_enhancement.dedupe_key())
            {
                incoming_enhancement.id = existing.id;
            }
        }

        let added_identifiers: Vec<_> = incoming
            .identifiers
            .iter()
            .filter(|l| !existing_id_keys.contains(&l.identifier.key()))
            .map(|l| l.identifier.clone())
            .collect();

        // Merge identifiers. A defensive merge keeps existing rows on key
        // collisions; every other strategy prefers the incoming row.
        match strategy {
            CollisionStrategy::MergeDefensive => {
                self.identifiers.extend(
                    incoming
                        .identifiers
                        .iter()
                        .filter(|l| !existing_id_keys.contains(&l.identifier.key()))
                        .cloned(),
                );
            }
            CollisionStrategy::MergeAggressive
            | CollisionStrategy::Overwrite
            | CollisionStrategy::Append => {
                let incoming_keys: BTreeSet<_> = incoming
                    .identifiers
                    .iter()
                    .map(|l| l.identifier.key())
                    .collect();
                self.identifiers
                    .retain(|l| !incoming_keys.contains(&l.identifier.key()));
                self.identifiers.append(&mut incoming.identifiers);
            }
        }

        let added_enhancements: Vec<Enhancement> = match strategy {
            CollisionStrategy::MergeDefensive => incoming
                .enhancements
                .iter()
                .filter(|e| {
                    !existing_enh_keys.contains(&(e.content.kind(), e.source.clone()))
                })
                .cloned()
                .collect(),
            _ => incoming.enhancements.clone(),
        };

        match strategy {
            // An overwrite does not preserve existing enhancements, only the
            // merged identifier set.
            CollisionStrategy::Overwrite => {
                self.enhancements = incoming.enhancements;
            }
            CollisionStrategy::Append => {
                self.enhancements.append(&mut incoming.enhancements);
            }
            CollisionStrategy::MergeDefensive => {
                self.enhancements.extend(
                    incoming
                        .enhancements
                        .into_iter()
                        .filter(|e| {
                            !existing_enh_keys.contains(&(e.content.kind(), e.source.clone()))
                        }),
                );
            }
            CollisionStrategy::MergeAggressive => {
                let incoming_keys: BTreeSet<(EnhancementKind, String)> = incoming
                    .enhancements
                    .iter()
                    .map(|e| (e.content.kind(), e.source.clone()))
                    .collect();
                self.enhancements
                    .retain(|e| !incoming_keys.contains(&(e.content.kind(), e.source.clone())));
                self.enhancements.append(&mut incoming.enhancements);
            }
        }

        Ok(ReferenceChangeset {
            added_identifiers,
            added_enhancements,
        })
    }
}
