// SPDX-License-Identifier: MIT OR Apache-2.0
//! The merged search-store projection of a reference cluster.

use crate::scoring::ordered_author_names;
use refbase_core::{
    DuplicateDetermination, Enhancement, EnhancementContent, EnhancementKind, Reference,
};
use refbase_search::{AnnotationEntry, EnhancementEntry, IdentifierEntry, ReferenceDoc};
use std::collections::BTreeSet;
use unicode_normalization::UnicodeNormalization;

/// Build the indexed document for a reference and the duplicates behind it.
///
/// The projection is the deduplicated union of the cluster: union of
/// identifiers, union of enhancements de-duplicated by `(kind, source)`
/// (the canonical's own rows win), union of normalized authors, title from
/// the latest bibliographic enhancement by `created_at`. This document is
/// the single-source fact for search.
#[must_use]
pub fn project_cluster(
    canonical: &Reference,
    duplicates: &[Reference],
    determination: DuplicateDetermination,
) -> ReferenceDoc {
    let mut doc = ReferenceDoc::minimal(canonical.id);
    doc.visibility = canonical.visibility;
    doc.determination = determination;

    // Identifier union over the cluster.
    let mut seen_identifiers = BTreeSet::new();
    for reference in std::iter::once(canonical).chain(duplicates) {
        for linked in &reference.identifiers {
            if seen_identifiers.insert(linked.identifier.key()) {
                let key = linked.identifier.key();
                doc.identifiers.push(IdentifierEntry {
                    identifier_type: key.identifier_type.to_string(),
                    identifier: key.identifier,
                    other_identifier_name: key.other_name,
                });
            }
        }
    }

    // Enhancement union, de-duplicated by (kind, source); the canonical's
    // own enhancements take precedence because it is iterated first.
    let mut merged: Vec<&Enhancement> = Vec::new();
    let mut seen_enhancements: BTreeSet<(EnhancementKind, String)> = BTreeSet::new();
    for reference in std::iter::once(canonical).chain(duplicates) {
        for enhancement in &reference.enhancements {
            let key = (enhancement.content.kind(), enhancement.source.clone());
            if seen_enhancements.insert(key) {
                merged.push(enhancement);
            }
        }
    }

    for enhancement in &merged {
        let annotations = match &enhancement.content {
            EnhancementContent::Annotation { annotations } => annotations
                .iter()
                .map(|a| AnnotationEntry {
                    scheme: a.scheme.clone(),
                    label: a.label.clone(),
                    value: a.value,
                    score: a.score,
                })
                .collect(),
            _ => Vec::new(),
        };
        doc.enhancements.push(EnhancementEntry {
            kind: enhancement.content.kind(),
            source: enhancement.source.clone(),
            annotations,
        });
    }

    // Bibliographic fields: latest created_at wins, earlier rows hydrate
    // holes; authors union over every bibliographic row, normalized.
    let mut bibliographic: Vec<&&Enhancement> = merged
        .iter()
        .filter(|e| e.content.kind() == EnhancementKind::Bibliographic)
        .collect();
    bibliographic.sort_by_key(|e| e.created_at);

    let mut authors: Vec<String> = Vec::new();
    let mut seen_authors = BTreeSet::new();
    for enhancement in &bibliographic {
        if let EnhancementContent::Bibliographic {
            title,
            authorship,
            publication_year,
            publication_date,
            ..
        } = &enhancement.content
        {
            if let Some(title) = title {
                doc.title = Some(normalize_title(title));
            }
            doc.publication_year = publication_year
                .or_else(|| {
                    use chrono::Datelike;
                    publication_date.as_ref().map(chrono::NaiveDate::year)
                })
                .or(doc.publication_year);
            for name in ordered_author_names(authorship) {
                let normalized = normalize_author(&name);
                if seen_authors.insert(normalized.clone()) {
                    authors.push(normalized);
                }
            }
        }
    }
    doc.authors = authors;

    // Abstracts feed the default search fields.
    for enhancement in &merged {
        if let EnhancementContent::Abstract { abstract_text, .. } = &enhancement.content {
            doc.abstract_text = Some(abstract_text.clone());
            break;
        }
    }

    doc
}

/// NFC-normalize, trim and title-case a title for the index.
fn normalize_title(title: &str) -> String {
    title_case(&title.trim().nfc().collect::<String>())
}

/// NFC-normalize, trim and title-case an author display name.
fn normalize_author(name: &str) -> String {
    title_case(&name.trim().nfc().collect::<String>())
}

/// Uppercase the first letter of each whitespace-separated word.
fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut at_word_start = true;
    for ch in text.chars() {
        if ch.is_whitespace() {
            at_word_start = true;
            out.push(ch);
        } else if at_word_start {
            out.extend(ch.to_uppercase());
            at_word_start = false;
        } else {
            out.extend(ch.to_lowercase());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use refbase_core::{
        Authorship, ExternalIdentifier, LinkedIdentifier, Visibility,
    };

    fn bibliographic(
        reference: &Reference,
        source: &str,
        title: &str,
        year: i32,
        authors: &[&str],
    ) -> Enhancement {
        Enhancement::new(
            reference.id,
            source,
            Visibility::Public,
            EnhancementContent::Bibliographic {
                title: Some(title.into()),
                authorship: authors
                    .iter()
                    .map(|name| Authorship {
                        display_name: (*name).to_string(),
                        position: Default::default(),
                        orcid: None,
                    })
                    .collect(),
                publication_year: Some(year),
                publication_date: None,
                cited_by_count: None,
            },
        )
    }

    fn reference_with_doi(doi: &str) -> Reference {
        let mut r = Reference::new(Visibility::Public);
        r.identifiers.push(LinkedIdentifier::new(
            r.id,
            ExternalIdentifier::Doi {
                identifier: doi.into(),
            },
        ));
        r
    }

    #[test]
    fn union_projection_merges_cluster() {
        let mut canonical = reference_with_doi("10.1/a");
        let e = bibliographic(&canonical, "openalex", "the work", 2024, &["jane doe"]);
        canonical.enhancements.push(e);

        let mut duplicate = reference_with_doi("10.1/b");
        let e = bibliographic(&duplicate, "crossref", "The Work", 2024, &["john smith"]);
        duplicate.enhancements.push(e);

        let doc = project_cluster(
            &canonical,
            &[duplicate],
            DuplicateDetermination::Canonical,
        );
        assert_eq!(doc.identifiers.len(), 2);
        assert_eq!(doc.enhancements.len(), 2);
        assert_eq!(doc.authors, vec!["Jane Doe", "John Smith"]);
        assert_eq!(doc.publication_year, Some(2024));
    }

    #[test]
    fn canonical_wins_enhancement_key_collisions() {
        let mut canonical = reference_with_doi("10.1/a");
        let e = bibliographic(&canonical, "openalex", "Canonical Title", 2024, &[]);
        canonical.enhancements.push(e);

        let mut duplicate = reference_with_doi("10.1/b");
        let e = bibliographic(&duplicate, "openalex", "Shadow Title", 2024, &[]);
        duplicate.enhancements.push(e);

        let doc = project_cluster(
            &canonical,
            &[duplicate],
            DuplicateDetermination::Canonical,
        );
        assert_eq!(doc.enhancements.len(), 1);
        assert_eq!(doc.title.as_deref(), Some("Canonical Title"));
    }

    #[test]
    fn title_comes_from_latest_bibliographic() {
        let mut canonical = reference_with_doi("10.1/a");
        let mut early = bibliographic(&canonical, "openalex", "early title", 2020, &[]);
        early.created_at = chrono::Utc::now() - chrono::Duration::days(2);
        let late = bibliographic(&canonical, "crossref", "late title", 2021, &[]);
        canonical.enhancements.push(early);
        canonical.enhancements.push(late);

        let doc = project_cluster(&canonical, &[], DuplicateDetermination::Canonical);
        assert_eq!(doc.title.as_deref(), Some("Late Title"));
        assert_eq!(doc.publication_year, Some(2021));
    }

    #[test]
    fn annotations_are_flattened_for_filtering() {
        let mut canonical = reference_with_doi("10.1/a");
        canonical.enhancements.push(Enhancement::new(
            canonical.id,
            "classifier",
            Visibility::Public,
            EnhancementContent::Annotation {
                annotations: vec![refbase_core::Annotation {
                    scheme: "topic".into(),
                    label: "climate".into(),
                    value: Some(true),
                    score: Some(0.9),
                }],
            },
        ));
        let doc = project_cluster(&canonical, &[], DuplicateDetermination::Canonical);
        assert_eq!(doc.enhancements[0].annotations.len(), 1);
        assert_eq!(doc.enhancements[0].annotations[0].scheme, "topic");
    }
}
