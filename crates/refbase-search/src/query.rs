// SPDX-License-Identifier: MIT OR Apache-2.0
//! Query shapes accepted by the index.

use refbase_error::{RepoError, RepoResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The deduplication candidate-retrieval query.
///
/// MUST: fuzzy match on the normalized title (minimum-should-match 50%).
/// SHOULD: dis-max over author clauses. FILTER: publication year within ±1,
/// candidate at rest (active decision canonical), id ≠ source.
#[derive(Debug, Clone)]
pub struct CandidateQuery {
    /// Normalized source title.
    pub title: String,
    /// Author clauses; tokens are pre-filtered by the caller (initials
    /// dropped, clause count capped, skipped entirely for collaborations).
    pub author_clauses: Vec<String>,
    /// Source publication year; the filter covers `[year-1, year+1]`.
    pub publication_year: Option<i32>,
    /// The source reference, excluded from candidates.
    pub exclude: Uuid,
    /// How many candidates to return.
    pub top_k: usize,
    /// Dis-max tie breaker over author clauses.
    pub tie_breaker: f64,
}

impl CandidateQuery {
    /// Build a candidate query with the standard tie breaker.
    #[must_use]
    pub fn new(title: impl Into<String>, exclude: Uuid, top_k: usize) -> Self {
        Self {
            title: title.into(),
            author_clauses: Vec::new(),
            publication_year: None,
            exclude,
            top_k,
            tie_breaker: 0.1,
        }
    }
}

// ---------------------------------------------------------------------------
// Query-string search
// ---------------------------------------------------------------------------

/// Sortable fields: keyword/numeric only, never analyzed text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    /// Publication year, descending.
    PublicationYear,
    /// Reference id (time-ordered), descending.
    Id,
}

impl SortField {
    /// Parse a sort field name, rejecting analyzed-text fields.
    pub fn parse(name: &str) -> RepoResult<Self> {
        match name {
            "publication_year" => Ok(Self::PublicationYear),
            "id" => Ok(Self::Id),
            other => Err(RepoError::SearchQuery {
                detail: format!(
                    "sort field {other:?} is not sortable; sortable fields are keyword or numeric"
                ),
            }),
        }
    }
}

/// An annotation filter of the form `scheme[/label][@score]`.
///
/// Without a score, matches references carrying an annotation with the scheme
/// (and label, when given) whose value is true. With a score, matches when
/// the annotation's score is at least the threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationFilter {
    /// Required annotation scheme.
    pub scheme: String,
    /// Required label within the scheme, when given.
    pub label: Option<String>,
    /// Minimum score, when given.
    pub min_score: Option<f64>,
}

impl AnnotationFilter {
    /// Parse the `scheme[/label][@score]` query-parameter form.
    pub fn parse(raw: &str) -> RepoResult<Self> {
        let (body, min_score) = match raw.split_once('@') {
            Some((body, score)) => {
                let score: f64 = score.parse().map_err(|_| RepoError::SearchQuery {
                    detail: format!("invalid annotation score in {raw:?}"),
                })?;
                (body, Some(score))
            }
            None => (raw, None),
        };
        let (scheme, label) = match body.split_once('/') {
            Some((scheme, label)) => (scheme, Some(label.to_string())),
            None => (body, None),
        };
        if scheme.is_empty() {
            return Err(RepoError::SearchQuery {
                detail: format!("invalid annotation filter {raw:?}: empty scheme"),
            });
        }
        Ok(Self {
            scheme: scheme.to_string(),
            label,
            min_score,
        })
    }

    /// Whether a document's flattened annotations satisfy this filter.
    #[must_use]
    pub fn matches(&self, doc: &crate::doc::ReferenceDoc) -> bool {
        doc.enhancements.iter().any(|enhancement| {
            enhancement.annotations.iter().any(|annotation| {
                if annotation.scheme != self.scheme {
                    return false;
                }
                if let Some(label) = &self.label {
                    if &annotation.label != label {
                        return false;
                    }
                }
                match self.min_score {
                    Some(threshold) => annotation.score.is_some_and(|s| s >= threshold),
                    None => annotation.value == Some(true),
                }
            })
        })
    }
}

/// A parsed Lucene-style query string plus its filters.
///
/// Bare terms expand against the configured default fields; `field:term`
/// targets one field; quoted phrases require all their tokens in one field.
/// Clauses combine with AND.
#[derive(Debug, Clone)]
pub struct QueryStringQuery {
    /// Raw query string.
    pub q: String,
    /// Fields bare terms expand against.
    pub default_fields: Vec<String>,
    /// Annotation filters, combined with AND.
    pub annotation_filters: Vec<AnnotationFilter>,
    /// Inclusive lower bound on publication year.
    pub start_year: Option<i32>,
    /// Inclusive upper bound on publication year.
    pub end_year: Option<i32>,
    /// Sort order; relevance when absent.
    pub sort: Option<SortField>,
}

impl QueryStringQuery {
    /// Build a query over the given default fields.
    #[must_use]
    pub fn new(q: impl Into<String>, default_fields: Vec<String>) -> Self {
        Self {
            q: q.into(),
            default_fields,
            annotation_filters: Vec::new(),
            start_year: None,
            end_year: None,
            sort: None,
        }
    }

    /// Validate the year window.
    pub fn validate(&self) -> RepoResult<()> {
        if let (Some(start), Some(end)) = (self.start_year, self.end_year) {
            if start > end {
                return Err(RepoError::invalid_payload(
                    "start_year must not be greater than end_year",
                ));
            }
        }
        Ok(())
    }
}
