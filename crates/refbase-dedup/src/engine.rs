// SPDX-License-Identifier: MIT OR Apache-2.0
//! The decision engine: gate, retrieve, score, decide, reproject.

use crate::candidates::build_candidate_query;
use crate::projection::project_cluster;
use crate::scoring::{ConfidenceLevel, DedupView, PairScorer};
use refbase_config::DedupConfig;
use refbase_core::{
    DuplicateDetermination, Reference, ReferenceDuplicateDecision,
};
use refbase_error::{RepoError, RepoResult};
use refbase_search::SearchEngine;
use refbase_store::RepositoryStore;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Outcome of deduplicating one reference.
#[derive(Debug, Clone)]
pub struct DedupOutcome {
    /// The active decision recorded for the reference.
    pub decision: ReferenceDuplicateDecision,
    /// Whether the reference row was discarded (exact duplicate).
    pub discarded: bool,
}

/// The deduplication engine.
///
/// Owns the decision lifecycle for a reference: searchability gate,
/// candidate retrieval, pair scoring, active-decision transition, and the
/// search-store writes those transitions imply. Store writes always precede
/// search writes; a failed search write surfaces as a projection error for
/// the caller to repair, never as a store rollback.
pub struct DeduplicationEngine {
    store: Arc<RepositoryStore>,
    search: Arc<SearchEngine>,
    scorer: PairScorer,
    config: DedupConfig,
    alias: String,
}

impl DeduplicationEngine {
    /// Create an engine writing reference documents through `alias`.
    #[must_use]
    pub fn new(
        store: Arc<RepositoryStore>,
        search: Arc<SearchEngine>,
        config: DedupConfig,
        alias: impl Into<String>,
    ) -> Self {
        Self {
            store,
            search,
            scorer: PairScorer::new(config.clone()),
            config,
            alias: alias.into(),
        }
    }

    /// Evaluate a reference and record its active decision.
    ///
    /// The reference may already be persisted (the normal ingest flow) or
    /// not (a dry evaluation); an exact duplicate is discarded from the
    /// store either way.
    pub async fn evaluate(&self, reference: &Reference) -> RepoResult<DedupOutcome> {
        let view = DedupView::from_reference(reference);

        if !view.is_searchable() {
            debug!(
                target: "refbase.dedup.engine",
                reference_id = %reference.id,
                "not searchable, recording unsearchable decision"
            );
            let decision = self
                .store
                .insert_decision(ReferenceDuplicateDecision::active(
                    reference.id,
                    DuplicateDetermination::Unsearchable,
                ))
                .await?;
            self.project_solo(reference, DuplicateDetermination::Unsearchable)
                .await?;
            return Ok(DedupOutcome {
                decision,
                discarded: false,
            });
        }

        let query = build_candidate_query(&view, &self.config);
        let hits = self.search.search_candidates(&self.alias, &query).await?;
        let es_scores: HashMap<Uuid, f64> = hits.iter().map(|h| (h.id, h.score)).collect();
        let candidate_ids: Vec<Uuid> = hits.iter().map(|h| h.id).collect();
        let candidates = self.store.get_references(&candidate_ids).await;
        let candidate_views: Vec<DedupView> =
            candidates.iter().map(DedupView::from_reference).collect();

        let ranked = self.scorer.score_source(&view, &candidate_views, &es_scores);

        // An exact duplicate of any ranked canonical is discarded outright:
        // identifier set contained in the canonical's, no new enhancement
        // content after normalized projection.
        for (candidate_view, _) in &ranked {
            let Some(candidate_id) = candidate_view.id else {
                continue;
            };
            let Some(candidate) = candidates.iter().find(|c| c.id == candidate_id) else {
                continue;
            };
            if is_exact_duplicate(reference, candidate) {
                info!(
                    target: "refbase.dedup.engine",
                    reference_id = %reference.id,
                    canonical_id = %candidate_id,
                    "exact duplicate, discarding row"
                );
                let decision = self
                    .store
                    .insert_decision(
                        ReferenceDuplicateDecision::active(
                            reference.id,
                            DuplicateDetermination::ExactDuplicate,
                        )
                        .with_canonical(candidate_id),
                    )
                    .await?;
                if self.store.get_reference(reference.id).await.is_ok() {
                    self.store.remove_reference(reference.id).await?;
                }
                return Ok(DedupOutcome {
                    decision,
                    discarded: true,
                });
            }
        }

        match ranked.first() {
            Some((top, result))
                if matches!(
                    result.confidence,
                    ConfidenceLevel::High | ConfidenceLevel::Medium
                ) =>
            {
                let canonical_id = top.id.ok_or_else(|| RepoError::Deduplication {
                    detail: "ranked candidate carries no id".into(),
                })?;
                let losing: Vec<Uuid> = ranked
                    .iter()
                    .skip(1)
                    .filter_map(|(candidate, _)| candidate.id)
                    .collect();
                info!(
                    target: "refbase.dedup.engine",
                    reference_id = %reference.id,
                    canonical_id = %canonical_id,
                    confidence = ?result.confidence,
                    id_match = ?result.id_match_type,
                    combined = result.combined_score,
                    "duplicate"
                );
                let decision = self
                    .store
                    .insert_decision(
                        ReferenceDuplicateDecision::active(
                            reference.id,
                            DuplicateDetermination::Duplicate,
                        )
                        .with_canonical(canonical_id)
                        .with_candidates(losing),
                    )
                    .await?;
                // The canonical's document gains the duplicate's contribution
                // before the duplicate's own document disappears, so readers
                // racing the transition never lose data.
                self.reproject_canonical(canonical_id).await?;
                self.search.delete_doc(&self.alias, reference.id).await?;
                Ok(DedupOutcome {
                    decision,
                    discarded: false,
                })
            }
            _ => {
                let decision = self
                    .store
                    .insert_decision(ReferenceDuplicateDecision::active(
                        reference.id,
                        DuplicateDetermination::Canonical,
                    ))
                    .await?;
                self.project_solo(reference, DuplicateDetermination::Canonical)
                    .await?;
                Ok(DedupOutcome {
                    decision,
                    discarded: false,
                })
            }
        }
    }

    /// Rebuild the merged projection of a canonical and its duplicates.
    pub async fn reproject_canonical(&self, canonical_id: Uuid) -> RepoResult<()> {
        let canonical = self.store.get_reference(canonical_id).await?;
        let duplicate_ids = self.store.duplicates_of(canonical_id).await;
        let duplicates = self.store.get_references(&duplicate_ids).await;
        let determination = self
            .store
            .active_decision(canonical_id)
            .await
            .map_or(DuplicateDetermination::Canonical, |d| d.determination);
        let doc = project_cluster(&canonical, &duplicates, determination);
        self.search
            .upsert(&self.alias, doc)
            .await
            .map_err(|e| RepoError::Projection {
                detail: format!("projecting canonical {canonical_id}: {e}"),
            })
    }

    async fn project_solo(
        &self,
        reference: &Reference,
        determination: DuplicateDetermination,
    ) -> RepoResult<()> {
        let doc = project_cluster(reference, &[], determination);
        self.search
            .upsert(&self.alias, doc)
            .await
            .map_err(|e| RepoError::Projection {
                detail: format!("projecting reference {}: {e}", reference.id),
            })
    }
}

/// Whether `candidate` already contains everything `reference` carries:
/// identifier subset plus no novel enhancement content by `(kind, source)`.
fn is_exact_duplicate(reference: &Reference, candidate: &Reference) -> bool {
    let candidate_keys = candidate.identifier_keys();
    if !reference
        .identifier_keys()
        .iter()
        .all(|key| candidate_keys.contains(key))
    {
        return false;
    }
    reference.enhancements.iter().all(|enhancement| {
        candidate.enhancements.iter().any(|existing| {
            existing.dedupe_key() == enhancement.dedupe_key()
                && existing.content == enhancement.content
        })
    })
}
