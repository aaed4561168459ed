// SPDX-License-Identifier: MIT OR Apache-2.0
//! Changesets: the delta just applied to a reference.
//!
//! Percolation queries can match either "current state has property P" or
//! "this change added property Q", so every reference mutation is paired with
//! the changeset it applied before being handed to the automation engine.

use crate::enhancement::Enhancement;
use crate::identifier::ExternalIdentifier;
use crate::reference::Reference;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The delta applied to a reference by one ingest or enhancement write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ReferenceChangeset {
    /// Identifiers added by this change.
    pub added_identifiers: Vec<ExternalIdentifier>,
    /// Enhancements added or replaced by this change.
    pub added_enhancements: Vec<Enhancement>,
}

impl ReferenceChangeset {
    /// A changeset covering the entire reference, used when the reference was
    /// just created.
    #[must_use]
    pub fn full(reference: &Reference) -> Self {
        Self {
            added_identifiers: reference
                .identifiers
                .iter()
                .map(|l| l.identifier.clone())
                .collect(),
            added_enhancements: reference.enhancements.clone(),
        }
    }

    /// Whether the change touched anything at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added_identifiers.is_empty() && self.added_enhancements.is_empty()
    }
}

/// Percolation input: the current reference state plus the delta just applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ReferenceWithChangeset {
    /// Current reference state.
    pub reference: Reference,
    /// The delta just applied.
    pub changeset: ReferenceChangeset,
}

impl ReferenceWithChangeset {
    /// Render the percolation document: `{reference: ..., changeset: ...}`.
    #[must_use]
    pub fn to_document(&self) -> serde_json::Value {
        serde_json::json!({
            "reference": self.reference,
            "changeset": self.changeset,
        })
    }
}
