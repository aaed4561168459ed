// SPDX-License-Identifier: MIT OR Apache-2.0
//! Enhancements: tagged content payloads attached to references.

use crate::reference::Visibility;
use chrono::{DateTime, NaiveDate, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Position of an author in the author list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthorPosition {
    /// First author.
    First,
    /// Any middle author.
    #[default]
    Middle,
    /// Last author.
    Last,
}

/// One entry in a bibliographic author list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Authorship {
    /// Display name as given by the source.
    pub display_name: String,
    /// Position in the author list.
    #[serde(default)]
    pub position: AuthorPosition,
    /// ORCID, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orcid: Option<String>,
}

/// A single annotation: a labelled judgement within a scheme.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Annotation {
    /// The annotation scheme (e.g. a taxonomy name).
    pub scheme: String,
    /// The label within the scheme.
    pub label: String,
    /// Boolean judgement, when the scheme is binary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<bool>,
    /// Confidence score in `[0, 1]`, when the scheme is scored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// A location where the work can be accessed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Location {
    /// Whether this location is open access.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_oa: Option<bool>,
    /// Version of the work at this location (e.g. `publishedVersion`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Landing page URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub landing_page_url: Option<String>,
    /// Direct PDF URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_url: Option<String>,
}

/// The tagged content of an enhancement.
///
/// Discrimination is on the `enhancement_type` serde tag; downstream code
/// matches on the enum variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "enhancement_type", rename_all = "snake_case")]
pub enum EnhancementContent {
    /// Core bibliographic metadata.
    Bibliographic {
        /// Work title.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        /// Author list.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        authorship: Vec<Authorship>,
        /// Explicit publication year.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        publication_year: Option<i32>,
        /// Full publication date, when known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        publication_date: Option<NaiveDate>,
        /// Citation count reported by the source.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cited_by_count: Option<u64>,
    },
    /// An abstract.
    Abstract {
        /// How the abstract text was produced (e.g. `uninverted`).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        process: Option<String>,
        /// The abstract text.
        abstract_text: String,
    },
    /// A list of annotations.
    Annotation {
        /// The annotations.
        annotations: Vec<Annotation>,
    },
    /// Access locations.
    Location {
        /// The locations.
        locations: Vec<Location>,
    },
}

impl EnhancementContent {
    /// The variant kind, used in `(kind, source)` uniqueness keys.
    #[must_use]
    pub fn kind(&self) -> EnhancementKind {
        match self {
            Self::Bibliographic { .. } => EnhancementKind::Bibliographic,
            Self::Abstract { .. } => EnhancementKind::Abstract,
            Self::Annotation { .. } => EnhancementKind::Annotation,
            Self::Location { .. } => EnhancementKind::Location,
        }
    }
}

/// Discriminant of [`EnhancementContent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EnhancementKind {
    /// Bibliographic metadata.
    Bibliographic,
    /// Abstract text.
    Abstract,
    /// Annotations.
    Annotation,
    /// Access locations.
    Location,
}

/// An enhancement row: provenance plus tagged content, owned by a reference.
///
/// Uniqueness within a reference is by `(content kind, source)`; collisions
/// during ingest merges follow the batch's collision strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Enhancement {
    /// Row id.
    pub id: Uuid,
    /// The owning reference.
    pub reference_id: Uuid,
    /// Provenance string (processor or robot name).
    pub source: String,
    /// Visibility of this enhancement.
    pub visibility: Visibility,
    /// Version of the robot that generated the content, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub robot_version: Option<String>,
    /// Enhancement ids this one was derived from, for lineage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_from: Option<Vec<Uuid>>,
    /// The tagged content payload.
    pub content: EnhancementContent,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Enhancement {
    /// Create an enhancement row against a reference.
    #[must_use]
    pub fn new(
        reference_id: Uuid,
        source: impl Into<String>,
        visibility: Visibility,
        content: EnhancementContent,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            reference_id,
            source: source.into(),
            visibility,
            robot_version: None,
            derived_from: None,
            content,
            created_at: Utc::now(),
        }
    }

    /// The `(kind, source)` uniqueness key within a reference.
    #[must_use]
    pub fn dedupe_key(&self) -> (EnhancementKind, &str) {
        (self.content.kind(), self.source.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_serde_round_trips_with_tag() {
        let content = EnhancementContent::Bibliographic {
            title: Some("On Things".into()),
            authorship: vec![Authorship {
                display_name: "Ada Lovelace".into(),
                position: AuthorPosition::First,
                orcid: None,
            }],
            publication_year: Some(2024),
            publication_date: None,
            cited_by_count: None,
        };
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json["enhancement_type"], "bibliographic");
        let back: EnhancementContent = serde_json::from_value(json).unwrap();
        assert_eq!(back, content);
    }

    #[test]
    fn dedupe_key_distinguishes_source() {
        let reference_id = Uuid::new_v4();
        let content = EnhancementContent::Abstract {
            process: None,
            abstract_text: "text".into(),
        };
        let a = Enhancement::new(reference_id, "openalex", Visibility::Public, content.clone());
        let b = Enhancement::new(reference_id, "pubmed", Visibility::Public, content);
        assert_ne!(a.dedupe_key(), b.dedupe_key());
    }
}
