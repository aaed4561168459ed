// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Domain model for the refbase reference repository.
//!
//! The canonical unit is the [`Reference`]: a set of tagged external
//! identifiers plus a set of tagged enhancements, owned by exactly one
//! reference at a time. References are created on ingest, mutated by ingest
//! merges, deduplication and enhancement creation, and never hard-deleted —
//! a reference that becomes a duplicate is retained as a shadow behind its
//! canonical.
//!
//! Wire-facing validation lives in [`wire`]; everything else here is the
//! internal domain vocabulary shared by the store, the deduplication engine,
//! the import pipeline and the dispatch engine.

mod changeset;
mod decision;
mod enhancement;
mod identifier;
mod imports;
mod pending;
mod reference;
mod requests;
mod robot;
pub mod tasks;
pub mod wire;

pub use changeset::{ReferenceChangeset, ReferenceWithChangeset};
pub use decision::{DuplicateDetermination, ReferenceDuplicateDecision};
pub use enhancement::{
    Annotation, AuthorPosition, Authorship, Enhancement, EnhancementContent, EnhancementKind,
    Location,
};
pub use identifier::{ExternalIdentifier, IdentifierKey, LinkedIdentifier};
pub use imports::{
    rollup_batch_status, CollisionStrategy, ImportBatch, ImportBatchStatus, ImportRecord,
    ImportRecordStatus, ImportResult, ImportResultStatus,
};
pub use pending::{
    PendingEnhancement, PendingEnhancementStatus, RobotEnhancementBatch,
    RobotEnhancementBatchStatus,
};
pub use reference::{Reference, Visibility};
pub use requests::{EnhancementRequest, EnhancementRequestStatus};
pub use robot::{ClientSecret, Robot, RobotAutomation};
