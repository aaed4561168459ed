// SPDX-License-Identifier: MIT OR Apache-2.0
//! BM25 inverted index over reference projections.

use crate::analysis::{analyze, auto_fuzziness, bounded_edit_distance};
use crate::doc::ReferenceDoc;
use crate::query::{CandidateQuery, QueryStringQuery, SortField};
use refbase_error::{RepoError, RepoResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;
/// Title boost in the candidate query.
const TITLE_BOOST: f64 = 2.0;

/// One scored hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    /// Document id.
    pub id: Uuid,
    /// Relevance score.
    pub score: f64,
}

/// Analyzed fields of the reference document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TextField {
    Title,
    Authors,
    Abstract,
}

impl TextField {
    fn parse(name: &str) -> RepoResult<Self> {
        match name {
            "title" => Ok(Self::Title),
            "authors" => Ok(Self::Authors),
            "abstract" => Ok(Self::Abstract),
            other => Err(RepoError::SearchQuery {
                detail: format!("unknown query field {other:?}"),
            }),
        }
    }

    fn text(self, doc: &ReferenceDoc) -> String {
        match self {
            Self::Title => doc.title.clone().unwrap_or_default(),
            Self::Authors => doc.authors.join("\n"),
            Self::Abstract => doc.abstract_text.clone().unwrap_or_default(),
        }
    }

    const ALL: [Self; 3] = [Self::Title, Self::Authors, Self::Abstract];
}

#[derive(Default)]
struct FieldPostings {
    /// term → doc id → term frequency.
    terms: HashMap<String, HashMap<Uuid, u32>>,
    /// doc id → field token count.
    lengths: HashMap<Uuid, u32>,
}

impl FieldPostings {
    fn add(&mut self, id: Uuid, tokens: &[String]) {
        if tokens.is_empty() {
            return;
        }
        self.lengths.insert(id, tokens.len() as u32);
        for token in tokens {
            *self
                .terms
                .entry(token.clone())
                .or_default()
                .entry(id)
                .or_insert(0) += 1;
        }
    }

    fn remove(&mut self, id: Uuid) {
        self.lengths.remove(&id);
        self.terms.retain(|_, docs| {
            docs.remove(&id);
            !docs.is_empty()
        });
    }

    fn avg_length(&self) -> f64 {
        if self.lengths.is_empty() {
            return 0.0;
        }
        f64::from(self.lengths.values().sum::<u32>()) / self.lengths.len() as f64
    }
}

/// An in-memory inverted index with BM25 scoring.
#[derive(Default)]
pub struct InvertedIndex {
    docs: HashMap<Uuid, ReferenceDoc>,
    fields: HashMap<TextField, FieldPostings>,
}

impl InvertedIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a document.
    pub fn upsert(&mut self, doc: ReferenceDoc) {
        self.delete(doc.id);
        for field in TextField::ALL {
            let tokens = analyze(&field.text(&doc));
            self.fields.entry(field).or_default().add(doc.id, &tokens);
        }
        self.docs.insert(doc.id, doc);
    }

    /// Delete a document. Returns whether it existed.
    pub fn delete(&mut self, id: Uuid) -> bool {
        if self.docs.remove(&id).is_none() {
            return false;
        }
        for postings in self.fields.values_mut() {
            postings.remove(id);
        }
        true
    }

    /// Fetch a document by id.
    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<&ReferenceDoc> {
        self.docs.get(&id)
    }

    /// Number of documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// Whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Iterate all documents (used by reindex and repair verification).
    pub fn docs(&self) -> impl Iterator<Item = &ReferenceDoc> {
        self.docs.values()
    }

    fn idf(&self, df: usize) -> f64 {
        let n = self.docs.len() as f64;
        (((n - df as f64 + 0.5) / (df as f64 + 0.5)) + 1.0).ln()
    }

    /// BM25 contribution of one dictionary term for one document.
    fn term_score(&self, postings: &FieldPostings, term: &str, id: Uuid) -> Option<f64> {
        let docs = postings.terms.get(term)?;
        let tf = f64::from(*docs.get(&id)?);
        let df = docs.len();
        let len = f64::from(*postings.lengths.get(&id)?);
        let avg = postings.avg_length().max(1.0);
        let norm = tf * (BM25_K1 + 1.0) / (tf + BM25_K1 * (1.0 - BM25_B + BM25_B * len / avg));
        Some(self.idf(df) * norm)
    }

    /// Score query tokens against one document field.
    ///
    /// Each query token contributes its best-matching dictionary term (exact,
    /// or within the AUTO fuzziness ladder when `fuzzy`). Returns the number
    /// of matched tokens and the summed contribution.
    fn score_tokens(
        &self,
        field: TextField,
        tokens: &[String],
        id: Uuid,
        fuzzy: bool,
    ) -> (usize, f64) {
        let Some(postings) = self.fields.get(&field) else {
            return (0, 0.0);
        };
        let mut matched = 0;
        let mut score = 0.0;
        for token in tokens {
            let mut best: Option<f64> = None;
            if let Some(exact) = self.term_score(postings, token, id) {
                best = Some(exact);
            }
            if fuzzy {
                let max_edits = auto_fuzziness(token);
                if max_edits > 0 {
                    for term in postings.terms.keys() {
                        if term == token {
                            continue;
                        }
                        if bounded_edit_distance(token, term, max_edits).is_some() {
                            if let Some(s) = self.term_score(postings, term, id) {
                                if best.is_none_or(|b| s > b) {
                                    best = Some(s);
                                }
                            }
                        }
                    }
                }
            }
            if let Some(s) = best {
                matched += 1;
                score += s;
            }
        }
        (matched, score)
    }

    // -----------------------------------------------------------------------
    // Candidate retrieval
    // -----------------------------------------------------------------------

    /// Execute the deduplication candidate query.
    pub fn search_candidates(&self, query: &CandidateQuery) -> Vec<SearchHit> {
        let title_tokens = analyze(&query.title);
        if title_tokens.is_empty() {
            return Vec::new();
        }
        // minimum_should_match 50%: percentages round down, at least one.
        let required = (title_tokens.len() / 2).max(1);

        let clause_tokens: Vec<Vec<String>> = query
            .author_clauses
            .iter()
            .map(|clause| analyze(clause))
            .collect();

        let mut hits = Vec::new();
        for doc in self.docs.values() {
            if doc.id == query.exclude {
                continue;
            }
            // Only match against references at rest: anything else may be
            // mid-transition and would let duplicate chains form.
            if !doc.determination.is_at_rest_canonical() {
                continue;
            }
            if let Some(year) = query.publication_year {
                match doc.publication_year {
                    Some(candidate_year) if (year - 1..=year + 1).contains(&candidate_year) => {}
                    _ => continue,
                }
            }
            let (matched, title_score) =
                self.score_tokens(TextField::Title, &title_tokens, doc.id, true);
            if matched < required {
                continue;
            }
            let mut clause_scores: Vec<f64> = Vec::new();
            for tokens in &clause_tokens {
                let (clause_matched, clause_score) =
                    self.score_tokens(TextField::Authors, tokens, doc.id, false);
                if clause_matched > 0 {
                    clause_scores.push(clause_score);
                }
            }
            let dis_max = clause_scores
                .iter()
                .fold(0.0_f64, |max, &s| max.max(s))
                + query.tie_breaker
                    * (clause_scores.iter().sum::<f64>()
                        - clause_scores.iter().fold(0.0_f64, |max, &s| max.max(s)));
            hits.push(SearchHit {
                id: doc.id,
                score: TITLE_BOOST * title_score + dis_max,
            });
        }
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(query.top_k);
        hits
    }

    // -----------------------------------------------------------------------
    // Query-string search
    // -----------------------------------------------------------------------

    /// Execute a query-string search, returning all hits ordered.
    pub fn search_query_string(&self, query: &QueryStringQuery) -> RepoResult<Vec<SearchHit>> {
        query.validate()?;
        let clauses = parse_query_string(&query.q)?;
        let default_fields: Vec<TextField> = query
            .default_fields
            .iter()
            .map(|name| TextField::parse(name))
            .collect::<RepoResult<_>>()?;

        let mut hits = Vec::new();
        'docs: for doc in self.docs.values() {
            if let Some(start) = query.start_year {
                if doc.publication_year.is_none_or(|y| y < start) {
                    continue;
                }
            }
            if let Some(end) = query.end_year {
                if doc.publication_year.is_none_or(|y| y > end) {
                    continue;
                }
            }
            for filter in &query.annotation_filters {
                if !filter.matches(doc) {
                    continue 'docs;
                }
            }

            let mut score = 0.0;
            for clause in &clauses {
                let fields: Vec<TextField> = match &clause.field {
                    Some(name) => vec![TextField::parse(name)?],
                    None => default_fields.clone(),
                };
                // The clause must fully match in at least one field; the best
                // field's score carries.
                let mut best: Option<f64> = None;
                for field in fields {
                    let (matched, field_score) =
                        self.score_tokens(field, &clause.terms, doc.id, false);
                    if matched == clause.terms.len() && best.is_none_or(|b| field_score > b) {
                        best = Some(field_score);
                    }
                }
                match best {
                    Some(s) => score += s,
                    None => continue 'docs,
                }
            }
            hits.push(SearchHit { id: doc.id, score });
        }

        match query.sort {
            None => hits.sort_by(|a, b| b.score.total_cmp(&a.score)),
            Some(SortField::PublicationYear) => hits.sort_by_key(|hit| {
                std::cmp::Reverse(
                    self.docs
                        .get(&hit.id)
                        .and_then(|d| d.publication_year)
                        .unwrap_or(i32::MIN),
                )
            }),
            Some(SortField::Id) => hits.sort_by_key(|hit| std::cmp::Reverse(hit.id)),
        }
        Ok(hits)
    }
}

/// One parsed query clause: an optional field plus analyzed terms.
#[derive(Debug, Clone, PartialEq)]
struct Clause {
    field: Option<String>,
    terms: Vec<String>,
}

/// Parse a Lucene-style query string into clauses.
///
/// Supports bare terms, `field:term`, and quoted phrases (optionally
/// field-prefixed). Clauses combine with AND.
fn parse_query_string(q: &str) -> RepoResult<Vec<Clause>> {
    let mut clauses = Vec::new();
    let mut rest = q.trim();
    while !rest.is_empty() {
        let (raw, remainder) = next_raw_clause(rest)?;
        rest = remainder.trim_start();
        let (field, body) = match raw.split_once(':') {
            Some((field, body)) if !field.is_empty() && !field.contains('"') => {
                (Some(field.to_string()), body)
            }
            _ => (None, raw),
        };
        let body = body.trim_matches('"');
        let terms = analyze(body);
        if !terms.is_empty() {
            clauses.push(Clause { field, terms });
        }
    }
    Ok(clauses)
}

/// Split off the next whitespace-delimited clause, keeping quoted spans
/// together.
fn next_raw_clause(input: &str) -> RepoResult<(&str, &str)> {
    let mut in_quotes = false;
    for (offset, ch) in input.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                return Ok((&input[..offset], &input[offset..]));
            }
            _ => {}
        }
    }
    if in_quotes {
        return Err(RepoError::SearchQuery {
            detail: "unterminated quote in query string".into(),
        });
    }
    Ok((input, ""))
}
