// SPDX-License-Identifier: MIT OR Apache-2.0
//! The indexed reference projection.

use refbase_core::{DuplicateDetermination, EnhancementKind, Visibility};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An identifier as indexed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierEntry {
    /// Identifier type tag.
    pub identifier_type: String,
    /// Identifier value.
    pub identifier: String,
    /// Scheme name for `other` identifiers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other_identifier_name: Option<String>,
}

/// An annotation as indexed, flattened for filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationEntry {
    /// Annotation scheme.
    pub scheme: String,
    /// Label within the scheme.
    pub label: String,
    /// Boolean judgement, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<bool>,
    /// Score, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// An enhancement as indexed: provenance plus the filterable annotation set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancementEntry {
    /// Enhancement kind.
    pub kind: EnhancementKind,
    /// Provenance string.
    pub source: String,
    /// Flattened annotations for the annotation filter.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<AnnotationEntry>,
}

/// The search-store projection of a reference.
///
/// For a canonical reference this is the deduplicated union of itself and
/// all duplicates pointing at it: union of identifiers, union of
/// enhancements de-duplicated by `(kind, source)`, normalized author union,
/// title from the latest bibliographic enhancement. This is the
/// single-source fact for search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceDoc {
    /// Reference id (document id).
    pub id: Uuid,
    /// Reference visibility.
    pub visibility: Visibility,
    /// Active duplicate determination.
    pub determination: DuplicateDetermination,
    /// Normalized title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Normalized author names, first and last pinned.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    /// Publication year.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publication_year: Option<i32>,
    /// Abstract text, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abstract_text: Option<String>,
    /// Indexed identifiers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identifiers: Vec<IdentifierEntry>,
    /// Indexed enhancements.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enhancements: Vec<EnhancementEntry>,
    /// Engine-assigned write version; newer versions win during reindex
    /// top-up passes.
    #[serde(default)]
    pub version: u64,
}

impl ReferenceDoc {
    /// A minimal canonical document, useful in tests.
    #[must_use]
    pub fn minimal(id: Uuid) -> Self {
        Self {
            id,
            visibility: Visibility::Public,
            determination: DuplicateDetermination::Canonical,
            title: None,
            authors: Vec::new(),
            publication_year: None,
            abstract_text: None,
            identifiers: Vec::new(),
            enhancements: Vec::new(),
            version: 0,
        }
    }
}
