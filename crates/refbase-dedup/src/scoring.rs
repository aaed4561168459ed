// SPDX-License-Identifier: MIT OR Apache-2.0
//! Pair scoring: search score + title-token Jaccard with identifier
//! short-circuits.

use refbase_config::DedupConfig;
use refbase_core::{EnhancementContent, EnhancementKind, ExternalIdentifier, Reference};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

/// Extract lowercase alphanumeric tokens from text.
///
/// XML/HTML tags (including MathML) are stripped first so common tag tokens
/// like `mml`, `math` or `xmlns` cannot produce false matches.
#[must_use]
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    for ch in text.chars() {
        match ch {
            '<' => {
                depth += 1;
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            '>' => depth = depth.saturating_sub(1),
            c if depth > 0 => {
                // Inside a tag; drop everything.
                let _ = c;
            }
            c if c.is_alphanumeric() => current.extend(c.to_lowercase()),
            _ => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Jaccard similarity over title token sets. Empty sets yield 0.
#[must_use]
pub fn title_token_jaccard(t1: Option<&str>, t2: Option<&str>) -> f64 {
    let (Some(t1), Some(t2)) = (t1, t2) else {
        return 0.0;
    };
    let tokens1: BTreeSet<String> = tokenize(t1).into_iter().collect();
    let tokens2: BTreeSet<String> = tokenize(t2).into_iter().collect();
    if tokens1.is_empty() || tokens2.is_empty() {
        return 0.0;
    }
    let intersection = tokens1.intersection(&tokens2).count();
    let union = tokens1.union(&tokens2).count();
    intersection as f64 / union as f64
}

/// Confidence tier of a scored pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    /// Identifier match or very strong search agreement. Accept.
    High,
    /// Search score with Jaccard verification. Accept.
    Medium,
    /// Not a duplicate.
    Low,
}

/// The identifier short-circuit that produced a high-confidence match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdMatchType {
    /// OpenAlex work ids are globally unique; always safe.
    OpenAlex,
    /// DOI match passing the corroboration gate.
    DoiSafe,
}

/// Result of scoring one candidate against a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringResult {
    /// Combined score in `[0, 1]` used for ranking.
    pub combined_score: f64,
    /// Confidence tier.
    pub confidence: ConfidenceLevel,
    /// The search store's score for this candidate.
    pub es_score: f64,
    /// Title-token Jaccard between source and candidate.
    pub jaccard_score: f64,
    /// Which identifier short-circuit fired, if any.
    pub id_match_type: Option<IdMatchType>,
}

/// Lightweight view of a reference carrying only the fields scoring needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DedupView {
    /// Reference id; absent for not-yet-persisted references.
    pub id: Option<Uuid>,
    /// Work title from the latest bibliographic enhancement.
    pub title: Option<String>,
    /// Author display names, first and last pinned, middles sorted by name.
    pub authors: Vec<String>,
    /// Publication year (explicit, or the publication date's year).
    pub publication_year: Option<i32>,
    /// DOI, lowercase comparison.
    pub doi: Option<String>,
    /// OpenAlex work id.
    pub openalex_id: Option<String>,
    /// PubMed id.
    pub pmid: Option<String>,
}

impl DedupView {
    /// Extract the scoring view from a reference.
    ///
    /// Bibliographic enhancements are processed in `created_at` order, so the
    /// latest value of each field wins while earlier enhancements hydrate
    /// missing fields.
    #[must_use]
    pub fn from_reference(reference: &Reference) -> Self {
        let mut view = Self {
            id: Some(reference.id),
            ..Self::default()
        };

        let mut bibliographic: Vec<_> = reference
            .enhancements
            .iter()
            .filter(|e| e.content.kind() == EnhancementKind::Bibliographic)
            .collect();
        bibliographic.sort_by_key(|e| e.created_at);
        for enhancement in bibliographic {
            if let EnhancementContent::Bibliographic {
                title,
                authorship,
                publication_year,
                publication_date,
                ..
            } = &enhancement.content
            {
                view.title = title.clone().or(view.title);
                view.publication_year = publication_year
                    .or_else(|| publication_date.as_ref().map(date_year))
                    .or(view.publication_year);
                if !authorship.is_empty() {
                    view.authors = ordered_author_names(authorship);
                }
            }
        }

        for linked in &reference.identifiers {
            match &linked.identifier {
                ExternalIdentifier::Doi { identifier } => view.doi = Some(identifier.clone()),
                ExternalIdentifier::OpenAlex { identifier } => {
                    view.openalex_id = Some(identifier.clone());
                }
                ExternalIdentifier::PmId { identifier } => view.pmid = Some(identifier.clone()),
                ExternalIdentifier::Other { .. } => {}
            }
        }

        view
    }

    /// Whether this reference can be evaluated for duplicates at all: a
    /// non-empty normalized title and a publication year.
    #[must_use]
    pub fn is_searchable(&self) -> bool {
        self.title
            .as_deref()
            .is_some_and(|t| !tokenize(t).is_empty())
            && self.publication_year.is_some()
    }
}

fn date_year(date: &chrono::NaiveDate) -> i32 {
    use chrono::Datelike;
    date.year()
}

/// Author display names ordered: first author, middles sorted by name, last
/// author.
#[must_use]
pub(crate) fn ordered_author_names(authorship: &[refbase_core::Authorship]) -> Vec<String> {
    use refbase_core::AuthorPosition;
    let mut sorted: Vec<_> = authorship.iter().collect();
    sorted.sort_by(|a, b| {
        let rank = |position: AuthorPosition| match position {
            AuthorPosition::First => -1,
            AuthorPosition::Middle => 0,
            AuthorPosition::Last => 1,
        };
        rank(a.position)
            .cmp(&rank(b.position))
            .then_with(|| a.display_name.cmp(&b.display_name))
    });
    sorted.into_iter().map(|a| a.display_name.clone()).collect()
}

/// Scorer implementing the two-stage search + Jaccard algorithm.
///
/// Stage one short-circuits on identifier agreement (OpenAlex, then DOI with
/// a corroboration gate); stage two verifies search-store scores against
/// title-token Jaccard. First match wins.
pub struct PairScorer {
    config: DedupConfig,
}

impl PairScorer {
    /// Create a scorer over the given thresholds.
    #[must_use]
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    /// Score candidates against a source and rank them.
    ///
    /// Candidates are evaluated in descending search-score order, capped at
    /// `top_k`, and returned sorted by combined score descending.
    #[must_use]
    pub fn score_source(
        &self,
        source: &DedupView,
        candidates: &[DedupView],
        es_scores: &HashMap<Uuid, f64>,
    ) -> Vec<(DedupView, ScoringResult)> {
        let mut ordered: Vec<&DedupView> = candidates.iter().collect();
        ordered.sort_by(|a, b| {
            let score = |v: &DedupView| v.id.and_then(|id| es_scores.get(&id)).copied().unwrap_or(0.0);
            score(b).total_cmp(&score(a))
        });
        ordered.truncate(self.config.top_k);

        let mut results: Vec<(DedupView, ScoringResult)> = ordered
            .into_iter()
            .map(|candidate| {
                let es_score = candidate
                    .id
                    .and_then(|id| es_scores.get(&id))
                    .copied()
                    .unwrap_or(0.0);
                let result = self.score_pair(source, candidate, es_score);
                (candidate.clone(), result)
            })
            .collect();
        results.sort_by(|a, b| b.1.combined_score.total_cmp(&a.1.combined_score));
        results
    }

    /// Score a single source-candidate pair.
    #[must_use]
    pub fn score_pair(
        &self,
        source: &DedupView,
        candidate: &DedupView,
        es_score: f64,
    ) -> ScoringResult {
        let jaccard = title_token_jaccard(source.title.as_deref(), candidate.title.as_deref());
        let source_tokens = source.title.as_deref().map_or(0, |t| tokenize(t).len());

        if let Some(result) = self.identifier_match(source, candidate, source_tokens, es_score, jaccard)
        {
            return result;
        }

        // Strong search agreement still needs a minimum Jaccard: huge author
        // lists (collaboration papers) inflate scores through single-letter
        // initials without any title signal.
        if es_score >= self.config.es_high_score_threshold
            && jaccard >= self.config.high_score_min_jaccard
        {
            return ScoringResult {
                combined_score: 0.95,
                confidence: ConfidenceLevel::High,
                es_score,
                jaccard_score: jaccard,
                id_match_type: None,
            };
        }

        if es_score >= self.config.es_min_score_threshold
            && jaccard >= self.config.jaccard_threshold
        {
            let combined = 0.5 + jaccard * 0.3 + (es_score.min(100.0) / 100.0) * 0.2;
            return ScoringResult {
                combined_score: combined,
                confidence: ConfidenceLevel::Medium,
                es_score,
                jaccard_score: jaccard,
                id_match_type: None,
            };
        }

        // Short titles cannot accumulate score mass; near-identity on the
        // token set plus a modest search score is accepted instead.
        if source_tokens <= self.config.short_title_max_tokens
            && es_score >= self.config.short_title_min_es_score
            && jaccard >= self.config.short_title_min_jaccard
        {
            return ScoringResult {
                combined_score: 0.7,
                confidence: ConfidenceLevel::Medium,
                es_score,
                jaccard_score: jaccard,
                id_match_type: None,
            };
        }

        ScoringResult {
            combined_score: jaccard * 0.5 + (es_score.min(100.0) / 100.0) * 0.3,
            confidence: ConfidenceLevel::Low,
            es_score,
            jaccard_score: jaccard,
            id_match_type: None,
        }
    }

    fn identifier_match(
        &self,
        source: &DedupView,
        candidate: &DedupView,
        source_tokens: usize,
        es_score: f64,
        jaccard: f64,
    ) -> Option<ScoringResult> {
        if let (Some(a), Some(b)) = (&source.openalex_id, &candidate.openalex_id) {
            if a == b {
                return Some(ScoringResult {
                    combined_score: 1.0,
                    confidence: ConfidenceLevel::High,
                    es_score,
                    jaccard_score: jaccard,
                    id_match_type: Some(IdMatchType::OpenAlex),
                });
            }
        }

        if let (Some(a), Some(b)) = (&source.doi, &candidate.doi) {
            if a.eq_ignore_ascii_case(b) {
                // DOI collisions happen; require corroborating evidence.
                let has_year = source.publication_year.is_some();
                let has_authors = !source.authors.is_empty();
                if has_year
                    && (has_authors || source_tokens >= self.config.doi_safety_min_title_tokens)
                {
                    return Some(ScoringResult {
                        combined_score: 1.0,
                        confidence: ConfidenceLevel::High,
                        es_score,
                        jaccard_score: jaccard,
                        id_match_type: Some(IdMatchType::DoiSafe),
                    });
                }
            }
        }

        None
    }
}
