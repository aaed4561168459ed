// SPDX-License-Identifier: MIT OR Apache-2.0
//! The percolation index: reverse matching of stored queries against
//! incoming documents.
//!
//! Robot automations are stored as structured queries; on every reference
//! change a `{reference, changeset}` document is built and every stored query
//! is evaluated against it. The query DSL is a small JSON subset:
//!
//! - `{"term": {"<path>": <value>}}` — exact value at a dotted path
//! - `{"exists": {"field": "<path>"}}` — non-empty value at a path
//! - `{"match": {"<path>": "<text>"}}` — all analyzed tokens present
//! - `{"range": {"<path>": {"gte": x, "lte": y}}}` — numeric window
//! - `{"bool": {"must": [...], "should": [...], "must_not": [...],
//!    "filter": [...], "minimum_should_match": n}}`
//!
//! Paths descend through objects by key and through arrays by matching any
//! element, so `changeset.added_identifiers.identifier_type` addresses every
//! identifier added by the change.

use crate::analysis::analyze;
use refbase_error::{RepoError, RepoResult};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// The set of document slots each stored query matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PercolationMatch {
    /// The stored query (automation) id.
    pub query_id: Uuid,
    /// The robot the automation triggers.
    pub robot_id: Uuid,
    /// Indices into the submitted document batch.
    pub slots: Vec<usize>,
}

#[derive(Debug, Clone)]
struct StoredQuery {
    robot_id: Uuid,
    query: Value,
}

/// Registry of stored percolation queries.
#[derive(Default)]
pub struct PercolationIndex {
    queries: RwLock<HashMap<Uuid, StoredQuery>>,
}

impl PercolationIndex {
    /// Create an empty percolation index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a stored query. The query is validated eagerly
    /// so malformed automations are rejected at registration time.
    pub async fn register(&self, query_id: Uuid, robot_id: Uuid, query: Value) -> RepoResult<()> {
        validate_query(&query)?;
        self.queries
            .write()
            .await
            .insert(query_id, StoredQuery { robot_id, query });
        Ok(())
    }

    /// Remove a stored query. Returns whether it existed.
    pub async fn remove(&self, query_id: Uuid) -> bool {
        self.queries.write().await.remove(&query_id).is_some()
    }

    /// Number of stored queries.
    pub async fn len(&self) -> usize {
        self.queries.read().await.len()
    }

    /// Whether no queries are stored.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Evaluate every stored query against a batch of documents in one pass.
    ///
    /// Returns, per matching query, the slot indices of the documents it
    /// matched; queries with no matches are omitted.
    pub async fn percolate(&self, documents: &[Value]) -> Vec<PercolationMatch> {
        let queries = self.queries.read().await;
        let mut matches: Vec<PercolationMatch> = Vec::new();
        for (query_id, stored) in queries.iter() {
            let slots: Vec<usize> = documents
                .iter()
                .enumerate()
                .filter(|(_, doc)| evaluate(&stored.query, doc))
                .map(|(slot, _)| slot)
                .collect();
            if !slots.is_empty() {
                matches.push(PercolationMatch {
                    query_id: *query_id,
                    robot_id: stored.robot_id,
                    slots,
                });
            }
        }
        matches.sort_by_key(|m| m.query_id);
        matches
    }
}

/// Validate that a stored query only uses known constructs.
fn validate_query(query: &Value) -> RepoResult<()> {
    let Some(object) = query.as_object() else {
        return Err(RepoError::SearchQuery {
            detail: "percolation query must be a JSON object".into(),
        });
    };
    let Some((kind, body)) = object.iter().next() else {
        return Err(RepoError::SearchQuery {
            detail: "percolation query must not be empty".into(),
        });
    };
    if object.len() != 1 {
        return Err(RepoError::SearchQuery {
            detail: "percolation query must have exactly one top-level clause".into(),
        });
    }
    match kind.as_str() {
        "term" | "match" | "range" => body
            .as_object()
            .filter(|m| m.len() == 1)
            .map(|_| ())
            .ok_or_else(|| RepoError::SearchQuery {
                detail: format!("{kind} clause must map exactly one path"),
            }),
        "exists" => body
            .get("field")
            .and_then(Value::as_str)
            .map(|_| ())
            .ok_or_else(|| RepoError::SearchQuery {
                detail: "exists clause requires a string `field`".into(),
            }),
        "bool" => {
            let Some(parts) = body.as_object() else {
                return Err(RepoError::SearchQuery {
                    detail: "bool clause must be an object".into(),
                });
            };
            for (key, clauses) in parts {
                match key.as_str() {
                    "must" | "should" | "must_not" | "filter" => {
                        let Some(list) = clauses.as_array() else {
                            return Err(RepoError::SearchQuery {
                                detail: format!("bool.{key} must be an array"),
                            });
                        };
                        for clause in list {
                            validate_query(clause)?;
                        }
                    }
                    "minimum_should_match" => {
                        if !clauses.is_u64() {
                            return Err(RepoError::SearchQuery {
                                detail: "bool.minimum_should_match must be an integer".into(),
                            });
                        }
                    }
                    other => {
                        return Err(RepoError::SearchQuery {
                            detail: format!("unknown bool part {other:?}"),
                        });
                    }
                }
            }
            Ok(())
        }
        other => Err(RepoError::SearchQuery {
            detail: format!("unknown percolation clause {other:?}"),
        }),
    }
}

/// Resolve a dotted path, fanning out over arrays.
fn resolve_path<'a>(doc: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut current = vec![doc];
    for segment in path.split('.') {
        let mut next = Vec::new();
        for value in current {
            match value {
                Value::Object(map) => {
                    if let Some(v) = map.get(segment) {
                        next.push(v);
                    }
                }
                Value::Array(items) => {
                    for item in items {
                        if let Some(v) = item.get(segment) {
                            next.push(v);
                        }
                    }
                }
                _ => {}
            }
        }
        current = next;
    }
    // A trailing array fans out to its elements for value comparisons.
    current
        .into_iter()
        .flat_map(|v| match v {
            Value::Array(items) => items.iter().collect::<Vec<_>>(),
            other => vec![other],
        })
        .collect()
}

/// Evaluate a validated query against one document.
fn evaluate(query: &Value, doc: &Value) -> bool {
    let Some((kind, body)) = query.as_object().and_then(|o| o.iter().next()) else {
        return false;
    };
    match kind.as_str() {
        "term" => {
            let Some((path, expected)) = body.as_object().and_then(|m| m.iter().next()) else {
                return false;
            };
            resolve_path(doc, path).iter().any(|v| *v == expected)
        }
        "exists" => {
            let Some(path) = body.get("field").and_then(Value::as_str) else {
                return false;
            };
            resolve_path(doc, path).iter().any(|v| match v {
                Value::Null => false,
                Value::String(s) => !s.is_empty(),
                Value::Array(items) => !items.is_empty(),
                _ => true,
            })
        }
        "match" => {
            let Some((path, text)) = body.as_object().and_then(|m| m.iter().next()) else {
                return false;
            };
            let Some(text) = text.as_str() else {
                return false;
            };
            let needle = analyze(text);
            if needle.is_empty() {
                return false;
            }
            resolve_path(doc, path).iter().any(|v| {
                let Some(haystack) = v.as_str() else {
                    return false;
                };
                let tokens = analyze(haystack);
                needle.iter().all(|t| tokens.contains(t))
            })
        }
        "range" => {
            let Some((path, bounds)) = body.as_object().and_then(|m| m.iter().next()) else {
                return false;
            };
            let gte = bounds.get("gte").and_then(Value::as_f64);
            let lte = bounds.get("lte").and_then(Value::as_f64);
            resolve_path(doc, path).iter().any(|v| {
                let Some(n) = v.as_f64() else {
                    return false;
                };
                gte.is_none_or(|g| n >= g) && lte.is_none_or(|l| n <= l)
            })
        }
        "bool" => {
            let Some(parts) = body.as_object() else {
                return false;
            };
            let clause_list = |key: &str| -> Vec<&Value> {
                parts
                    .get(key)
                    .and_then(Value::as_array)
                    .map(|l| l.iter().collect())
                    .unwrap_or_default()
            };
            if !clause_list("must").iter().all(|c| evaluate(c, doc)) {
                return false;
            }
            if !clause_list("filter").iter().all(|c| evaluate(c, doc)) {
                return false;
            }
            if clause_list("must_not").iter().any(|c| evaluate(c, doc)) {
                return false;
            }
            let should = clause_list("should");
            if !should.is_empty() {
                let minimum = parts
                    .get("minimum_should_match")
                    .and_then(Value::as_u64)
                    .unwrap_or(1) as usize;
                let matched = should.iter().filter(|c| evaluate(c, doc)).count();
                if matched < minimum {
                    return false;
                }
            }
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Value {
        json!({
            "reference": {
                "visibility": "public",
                "identifiers": [
                    {"identifier_type": "doi", "identifier": "10.1/x"},
                ],
                "enhancements": [
                    {"source": "openalex", "content": {"enhancement_type": "bibliographic", "title": "Glacier melt"}},
                ],
            },
            "changeset": {
                "added_identifiers": [
                    {"identifier_type": "doi", "identifier": "10.1/x"},
                ],
                "added_enhancements": [],
            },
        })
    }

    #[test]
    fn term_descends_arrays() {
        let query = json!({"term": {"reference.identifiers.identifier_type": "doi"}});
        assert!(evaluate(&query, &doc()));
        let query = json!({"term": {"reference.identifiers.identifier_type": "pm_id"}});
        assert!(!evaluate(&query, &doc()));
    }

    #[test]
    fn exists_ignores_empty_arrays() {
        let query = json!({"exists": {"field": "changeset.added_identifiers"}});
        assert!(evaluate(&query, &doc()));
        let query = json!({"exists": {"field": "changeset.added_enhancements"}});
        assert!(!evaluate(&query, &doc()));
    }

    #[test]
    fn match_analyzes_text() {
        let query =
            json!({"match": {"reference.enhancements.content.title": "MELT glacier"}});
        assert!(evaluate(&query, &doc()));
        let query = json!({"match": {"reference.enhancements.content.title": "ocean"}});
        assert!(!evaluate(&query, &doc()));
    }

    #[test]
    fn bool_combines_clauses() {
        // "this change added a DOI AND the reference has no abstract"
        let query = json!({
            "bool": {
                "must": [
                    {"term": {"changeset.added_identifiers.identifier_type": "doi"}},
                ],
                "must_not": [
                    {"term": {"reference.enhancements.content.enhancement_type": "abstract"}},
                ],
            }
        });
        assert!(evaluate(&query, &doc()));
    }

    #[test]
    fn range_matches_numbers() {
        let doc = json!({"reference": {"enhancements": [
            {"content": {"publication_year": 2023}}
        ]}});
        let query =
            json!({"range": {"reference.enhancements.content.publication_year": {"gte": 2022, "lte": 2024}}});
        assert!(evaluate(&query, &doc));
        let query =
            json!({"range": {"reference.enhancements.content.publication_year": {"gte": 2024}}});
        assert!(!evaluate(&query, &doc));
    }

    #[tokio::test]
    async fn percolate_maps_slots() {
        let index = PercolationIndex::new();
        let robot_id = Uuid::new_v4();
        index
            .register(
                Uuid::new_v4(),
                robot_id,
                json!({"term": {"changeset.added_identifiers.identifier_type": "doi"}}),
            )
            .await
            .unwrap();

        let with_doi = doc();
        let without = json!({"reference": {}, "changeset": {"added_identifiers": []}});
        let matches = index.percolate(&[without, with_doi]).await;
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].robot_id, robot_id);
        assert_eq!(matches[0].slots, vec![1]);
    }

    #[tokio::test]
    async fn malformed_queries_are_rejected_at_registration() {
        let index = PercolationIndex::new();
        let err = index
            .register(Uuid::new_v4(), Uuid::new_v4(), json!({"frob": {}}))
            .await
            .unwrap_err();
        assert_eq!(err.status(), 400);
        assert!(index.is_empty().await);
    }
}
