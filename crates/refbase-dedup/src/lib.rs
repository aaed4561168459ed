// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! The deduplication engine.
//!
//! Given a freshly ingested reference, decide whether it is canonical, a
//! duplicate of some canonical, an exact duplicate (discarded), or
//! unsearchable. Correctness budget: precision over recall — false merges
//! cost more than misses.
//!
//! The pipeline is: searchability gate → candidate retrieval against the
//! search store → pair scoring with confidence tiers → decision with an
//! audit trail → projection updates (the canonical's indexed document is the
//! deduplicated union of its cluster).

mod candidates;
mod engine;
mod projection;
mod scoring;

pub use candidates::{build_author_clauses, build_candidate_query, is_collaboration_paper};
pub use engine::{DedupOutcome, DeduplicationEngine};
pub use projection::project_cluster;
pub use scoring::{
    tokenize, title_token_jaccard, ConfidenceLevel, DedupView, IdMatchType, PairScorer,
    ScoringResult,
};
