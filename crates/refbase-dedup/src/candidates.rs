// SPDX-License-Identifier: MIT OR Apache-2.0
//! Candidate retrieval: building the search query for a source reference.

use crate::scoring::{tokenize, DedupView};
use refbase_config::DedupConfig;
use refbase_search::CandidateQuery;
use uuid::Uuid;

/// Author-list keywords that mark big-collaboration papers.
const COLLABORATION_KEYWORDS: [&str; 4] = ["collaboration", "cern", "atlas", "cms"];
/// How many leading author slots are checked for collaboration keywords.
const COLLABORATION_KEYWORD_SLOTS: usize = 5;

/// Whether a paper's author list marks it as a big-collaboration paper.
///
/// Such lists inflate search scores through sheer clause mass without any
/// per-author signal, so the candidate query skips author clauses entirely.
#[must_use]
pub fn is_collaboration_paper(authors: &[String], threshold: usize) -> bool {
    if authors.len() > threshold {
        return true;
    }
    authors
        .iter()
        .take(COLLABORATION_KEYWORD_SLOTS)
        .any(|author| {
            let lowered = author.to_lowercase();
            COLLABORATION_KEYWORDS
                .iter()
                .any(|keyword| lowered.contains(keyword))
        })
}

/// Build bounded author clauses for the dis-max part of the candidate query.
///
/// Single-letter initials (tokens shorter than `min_token_length`) are
/// dropped from each name; a name reduced to nothing contributes no clause;
/// at most `max_clauses` clauses are kept. Returns an empty list for
/// collaboration papers.
#[must_use]
pub fn build_author_clauses(authors: &[String], config: &DedupConfig) -> Vec<String> {
    if is_collaboration_paper(authors, config.collaboration_author_threshold) {
        return Vec::new();
    }
    authors
        .iter()
        .filter_map(|author| {
            let tokens: Vec<String> = tokenize(author)
                .into_iter()
                .filter(|token| token.chars().count() >= config.min_author_token_length)
                .collect();
            (!tokens.is_empty()).then(|| tokens.join(" "))
        })
        .take(config.max_author_clauses)
        .collect()
}

/// Build the candidate query for a searchable source view.
///
/// The caller has already passed the searchability gate, so `title` is
/// non-empty after normalization and a publication year is present.
#[must_use]
pub fn build_candidate_query(view: &DedupView, config: &DedupConfig) -> CandidateQuery {
    let mut query = CandidateQuery::new(
        view.title.clone().unwrap_or_default(),
        view.id.unwrap_or_else(Uuid::nil),
        config.top_k,
    );
    query.publication_year = view.publication_year;
    query.author_clauses = build_author_clauses(&view.authors, config);
    query
}

#[cfg(test)]
mod tests {
    use super::*;
    use refbase_config::DedupConfig;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn small_author_list_is_not_a_collaboration() {
        let authors = names(&["John Smith", "Jane Doe", "Bob Wilson"]);
        assert!(!is_collaboration_paper(&authors, 50));
    }

    #[test]
    fn threshold_is_strictly_greater() {
        let authors: Vec<String> = (0..50).map(|i| format!("Author {i}")).collect();
        assert!(!is_collaboration_paper(&authors, 50));
        let authors: Vec<String> = (0..51).map(|i| format!("Author {i}")).collect();
        assert!(is_collaboration_paper(&authors, 50));
    }

    #[test]
    fn keywords_only_count_in_first_five_slots() {
        let authors = names(&["ATLAS Collaboration", "John Smith"]);
        assert!(is_collaboration_paper(&authors, 50));
        let authors = names(&["atlas collaboration", "John Smith"]);
        assert!(is_collaboration_paper(&authors, 50));
        let authors = names(&["J. Doe", "CMS Collaboration", "A. Smith"]);
        assert!(is_collaboration_paper(&authors, 50));
        let authors = names(&["CERN Group", "John Smith"]);
        assert!(is_collaboration_paper(&authors, 50));

        let mut authors: Vec<String> = (0..5).map(|i| format!("Author {i}")).collect();
        authors.push("ATLAS Collaboration".into());
        assert!(!is_collaboration_paper(&authors, 50));
    }

    #[test]
    fn empty_author_list_is_not_a_collaboration() {
        assert!(!is_collaboration_paper(&[], 50));
    }

    #[test]
    fn initials_are_filtered_from_clauses() {
        let config = DedupConfig::default();
        let clauses = build_author_clauses(&names(&["J Smith"]), &config);
        assert_eq!(clauses, vec!["smith".to_string()]);

        // A name consisting only of initials contributes no clause.
        let clauses = build_author_clauses(&names(&["J S"]), &config);
        assert!(clauses.is_empty());

        let clauses = build_author_clauses(&names(&["J S", "John Smith", "A B"]), &config);
        assert_eq!(clauses, vec!["john smith".to_string()]);
    }

    #[test]
    fn clause_count_is_capped() {
        let config = DedupConfig {
            max_author_clauses: 10,
            ..DedupConfig::default()
        };
        let authors: Vec<String> = (0..30).map(|i| format!("Author Name{i}")).collect();
        let clauses = build_author_clauses(&authors, &config);
        assert_eq!(clauses.len(), 10);
    }

    #[test]
    fn collaboration_paper_yields_no_clauses() {
        let config = DedupConfig::default();
        let authors: Vec<String> = (0..60).map(|i| format!("Author Name{i}")).collect();
        assert!(build_author_clauses(&authors, &config).is_empty());
        let authors = names(&["ATLAS Collaboration", "John Smith"]);
        assert!(build_author_clauses(&authors, &config).is_empty());
    }

    #[test]
    fn query_carries_year_window_inputs_and_tie_breaker() {
        let config = DedupConfig::default();
        let view = DedupView {
            id: Some(Uuid::new_v4()),
            title: Some("A title".into()),
            authors: names(&["Jane Doe"]),
            publication_year: Some(2023),
            ..DedupView::default()
        };
        let query = build_candidate_query(&view, &config);
        assert_eq!(query.publication_year, Some(2023));
        assert_eq!(query.author_clauses, vec!["jane doe".to_string()]);
        assert_eq!(query.top_k, config.top_k);
        assert!((query.tie_breaker - 0.1).abs() < 1e-12);
    }
}
