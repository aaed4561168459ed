// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Embedded full-text and percolation store.
//!
//! Plays the role of the external search store in the reference lifecycle:
//! a BM25 inverted index over reference projections, a candidate query shaped
//! for deduplication retrieval, a reverse-matching (percolation) index for
//! robot automations, and a catalog of versioned physical indices behind
//! stable aliases with atomic swaps, write blocks and pollable reindex tasks.

mod analysis;
mod catalog;
mod doc;
mod index;
mod percolate;
mod query;

pub use analysis::analyze;
pub use catalog::{ReindexStatus, ReindexTask, SearchEngine};
pub use doc::{AnnotationEntry, EnhancementEntry, IdentifierEntry, ReferenceDoc};
pub use index::{InvertedIndex, SearchHit};
pub use percolate::{PercolationIndex, PercolationMatch};
pub use query::{AnnotationFilter, CandidateQuery, QueryStringQuery, SortField};
