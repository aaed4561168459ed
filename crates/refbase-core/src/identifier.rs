// SPDX-License-Identifier: MIT OR Apache-2.0
//! External identifiers and their linkage to references.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A tagged external identifier for a scholarly work.
///
/// The serde tag is `identifier_type`, matching the wire schema. Uniqueness
/// is on [`IdentifierKey`]: `(identifier_type, identifier, other_name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "identifier_type", rename_all = "snake_case")]
pub enum ExternalIdentifier {
    /// A DOI, e.g. `10.1000/xyz123`.
    Doi {
        /// The DOI value, without a resolver prefix.
        identifier: String,
    },
    /// A PubMed identifier.
    PmId {
        /// The numeric PubMed id as a string.
        identifier: String,
    },
    /// An OpenAlex work identifier (`W...`).
    OpenAlex {
        /// The OpenAlex work id.
        identifier: String,
    },
    /// Any other identifier scheme, qualified by its name.
    Other {
        /// The identifier value.
        identifier: String,
        /// The name of the identifier scheme.
        other_identifier_name: String,
    },
}

impl ExternalIdentifier {
    /// The raw identifier value.
    #[must_use]
    pub fn value(&self) -> &str {
        match self {
            Self::Doi { identifier }
            | Self::PmId { identifier }
            | Self::OpenAlex { identifier }
            | Self::Other { identifier, .. } => identifier,
        }
    }

    /// The tag string used on the wire and in uniqueness keys.
    #[must_use]
    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::Doi { .. } => "doi",
            Self::PmId { .. } => "pm_id",
            Self::OpenAlex { .. } => "open_alex",
            Self::Other { .. } => "other",
        }
    }

    /// The uniqueness key for this identifier.
    #[must_use]
    pub fn key(&self) -> IdentifierKey {
        IdentifierKey {
            identifier_type: self.type_tag(),
            identifier: self.value().to_string(),
            other_name: match self {
                Self::Other {
                    other_identifier_name,
                    ..
                } => Some(other_identifier_name.clone()),
                _ => None,
            },
        }
    }
}

/// Uniqueness key for an external identifier: `(type, value, other_name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentifierKey {
    /// The identifier type tag.
    pub identifier_type: &'static str,
    /// The identifier value.
    pub identifier: String,
    /// The scheme name for `other` identifiers.
    pub other_name: Option<String>,
}

/// An external identifier row owned by a reference.
///
/// An identifier belongs to exactly one reference at any time; merges graft
/// pre-existing row ids onto incoming identifiers so rows are reused rather
/// than duplicated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LinkedIdentifier {
    /// Row id.
    pub id: Uuid,
    /// The owning reference.
    pub reference_id: Uuid,
    /// The identifier itself.
    pub identifier: ExternalIdentifier,
}

impl LinkedIdentifier {
    /// Link an identifier to a reference under a fresh row id.
    #[must_use]
    pub fn new(reference_id: Uuid, identifier: ExternalIdentifier) -> Self {
        Self {
            id: Uuid::new_v4(),
            reference_id,
            identifier,
        }
    }
}
