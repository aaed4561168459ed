// SPDX-License-Identifier: MIT OR Apache-2.0
//! Wire schemas and the anti-corruption layer.
//!
//! Everything that crosses a process boundary — import artifact lines, robot
//! result lines, robot request bodies — is parsed into the types here and
//! validated before it is allowed to become domain state. Parse failures are
//! [`RepoError::Parse`]; structural failures are [`RepoError::InvalidPayload`]
//! with field-level detail.

use crate::enhancement::{Enhancement, EnhancementContent};
use crate::identifier::{ExternalIdentifier, LinkedIdentifier};
use crate::reference::{Reference, Visibility};
use refbase_error::{RepoError, RepoResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Import artifact lines
// ---------------------------------------------------------------------------

/// One enhancement as it appears on an import line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EnhancementWire {
    /// Provenance string.
    pub source: String,
    /// Enhancement visibility.
    pub visibility: Visibility,
    /// Robot version, when robot-produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub robot_version: Option<String>,
    /// Lineage enhancement ids.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_from: Option<Vec<Uuid>>,
    /// Tagged content.
    #[serde(flatten)]
    pub content: EnhancementContent,
}

impl EnhancementWire {
    /// Materialize a domain enhancement row against a reference.
    #[must_use]
    pub fn into_enhancement(self, reference_id: Uuid) -> Enhancement {
        let mut enhancement =
            Enhancement::new(reference_id, self.source, self.visibility, self.content);
        enhancement.robot_version = self.robot_version;
        enhancement.derived_from = self.derived_from;
        enhancement
    }
}

/// One reference as it appears on an import artifact line.
///
/// Required per line: `visibility`, a non-empty `identifiers` array, and a
/// possibly-empty `enhancements` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ReferenceWire {
    /// Reference visibility.
    pub visibility: Visibility,
    /// Tagged identifiers; must be non-empty.
    pub identifiers: Vec<ExternalIdentifier>,
    /// Tagged enhancements; may be empty.
    #[serde(default)]
    pub enhancements: Vec<EnhancementWire>,
}

impl ReferenceWire {
    /// Parse one artifact line.
    pub fn parse_line(line: &str) -> RepoResult<Self> {
        let wire: Self = serde_json::from_str(line).map_err(|e| RepoError::Parse {
            detail: format!("invalid reference line: {e}"),
        })?;
        wire.validate()?;
        Ok(wire)
    }

    /// Validate the wire invariants.
    pub fn validate(&self) -> RepoResult<()> {
        if self.identifiers.is_empty() {
            return Err(RepoError::invalid_payload(
                "identifiers: must contain at least one identifier",
            ));
        }
        for (ordinal, enhancement) in self.enhancements.iter().enumerate() {
            if enhancement.source.trim().is_empty() {
                return Err(RepoError::invalid_payload(format!(
                    "enhancements[{ordinal}].source: must be non-empty"
                )));
            }
        }
        Ok(())
    }

    /// Materialize a fresh domain reference from this line.
    #[must_use]
    pub fn into_reference(self) -> Reference {
        let mut reference = Reference::new(self.visibility);
        reference.identifiers = self
            .identifiers
            .into_iter()
            .map(|identifier| LinkedIdentifier::new(reference.id, identifier))
            .collect();
        reference.enhancements = self
            .enhancements
            .into_iter()
            .map(|wire| wire.into_enhancement(reference.id))
            .collect();
        reference
    }
}

// ---------------------------------------------------------------------------
// Robot result artifact lines
// ---------------------------------------------------------------------------

/// A produced enhancement on a robot result line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotEnhancementEntry {
    /// The reference the enhancement is for.
    pub reference_id: Uuid,
    /// The enhancement payload.
    #[serde(flatten)]
    pub enhancement: EnhancementWire,
}

/// One line of a robot result artifact: an enhancement for a reference, or a
/// per-reference error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RobotResultLine {
    /// The robot could not enhance this reference.
    Error {
        /// The reference the error is about.
        reference_id: Uuid,
        /// The robot's error message.
        error: String,
    },
    /// A produced enhancement.
    Enhancement(RobotEnhancementEntry),
}

impl RobotResultLine {
    /// Parse one result line.
    pub fn parse_line(line: &str) -> RepoResult<Self> {
        serde_json::from_str(line).map_err(|e| RepoError::Parse {
            detail: format!("invalid robot result line: {e}"),
        })
    }

    /// The reference this line is about.
    #[must_use]
    pub fn reference_id(&self) -> Uuid {
        match self {
            Self::Error { reference_id, .. } => *reference_id,
            Self::Enhancement(entry) => entry.reference_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Robot request bodies
// ---------------------------------------------------------------------------

/// Request body for a robot's `POST /batch/` endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BatchRobotRequestWire {
    /// The robot enhancement batch id.
    pub id: Uuid,
    /// Signed URL the robot reads hydrated references from.
    pub reference_storage_url: String,
    /// Signed URL the robot writes its result artifact to.
    pub result_storage_url: String,
    /// Opaque pass-through parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_fields: Option<serde_json::Value>,
}

/// Request body for a robot's `POST /single/` endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SingleRobotRequestWire {
    /// The enhancement request id.
    pub id: Uuid,
    /// The hydrated reference.
    pub reference: Reference,
    /// Opaque pass-through parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_fields: Option<serde_json::Value>,
}

/// Body a robot submits to finish a batch: either a terminal error, or
/// nothing (the result artifact is at the pre-agreed location).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ResultSubmissionWire {
    /// Terminal error affecting the whole batch, if the robot failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_line_round_trip() {
        let line = r#"{"visibility":"public","identifiers":[{"identifier_type":"doi","identifier":"10.1/x"}],"enhancements":[{"source":"openalex","visibility":"public","enhancement_type":"bibliographic","title":"T","publication_year":2025}]}"#;
        let wire = ReferenceWire::parse_line(line).unwrap();
        assert_eq!(wire.identifiers.len(), 1);
        let reference = wire.into_reference();
        assert_eq!(reference.enhancements.len(), 1);
        assert_eq!(
            reference.enhancements[0].reference_id, reference.id,
            "enhancements must be owned by the new reference"
        );
    }

    #[test]
    fn zero_identifiers_is_invalid() {
        let line = r#"{"visibility":"public","identifiers":[],"enhancements":[]}"#;
        let err = ReferenceWire::parse_line(line).unwrap_err();
        assert_eq!(err.status(), 422);
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let err = ReferenceWire::parse_line("not json").unwrap_err();
        assert!(matches!(err, RepoError::Parse { .. }));
    }

    #[test]
    fn robot_result_line_discriminates_error_and_enhancement() {
        let reference_id = Uuid::new_v4();
        let error_line =
            format!(r#"{{"reference_id":"{reference_id}","error":"no abstract found"}}"#);
        match RobotResultLine::parse_line(&error_line).unwrap() {
            RobotResultLine::Error { error, .. } => assert_eq!(error, "no abstract found"),
            RobotResultLine::Enhancement { .. } => panic!("expected error line"),
        }

        let enhancement_line = format!(
            r#"{{"reference_id":"{reference_id}","source":"abstract-bot","visibility":"public","enhancement_type":"abstract","abstract_text":"An abstract."}}"#
        );
        match RobotResultLine::parse_line(&enhancement_line).unwrap() {
            RobotResultLine::Enhancement(entry) => {
                assert_eq!(entry.enhancement.source, "abstract-bot");
                assert_eq!(entry.reference_id, reference_id);
            }
            RobotResultLine::Error { .. } => panic!("expected enhancement line"),
        }
    }
}
