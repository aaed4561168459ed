// SPDX-License-Identifier: MIT OR Apache-2.0
//! The search endpoint service.

use refbase_config::SearchConfig;
use refbase_error::{RepoError, RepoResult};
use refbase_search::{
    AnnotationFilter, QueryStringQuery, ReferenceDoc, SearchEngine, SortField,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Query parameters accepted by `GET /references/search/`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchParams {
    /// Lucene-style query string. Bare terms expand against the configured
    /// default fields.
    #[serde(default)]
    pub q: String,
    /// Page number, 1-indexed.
    #[serde(default)]
    pub page: Option<usize>,
    /// Sort field; relevance when absent. Keyword/numeric fields only.
    #[serde(default)]
    pub sort: Option<String>,
    /// Annotation filters `scheme[/label][@score]`, ANDed together.
    #[serde(default)]
    pub annotation: Option<String>,
    /// Inclusive lower publication-year bound.
    #[serde(default)]
    pub start_year: Option<i32>,
    /// Inclusive upper publication-year bound.
    #[serde(default)]
    pub end_year: Option<i32>,
}

/// One page of hydrated search results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResultPage {
    /// Documents on this page, most relevant first.
    pub hits: Vec<ReferenceDoc>,
    /// Total matching documents, bounded by the result window.
    pub total: usize,
    /// Page number, 1-indexed.
    pub page: usize,
    /// Page size.
    pub page_size: usize,
}

/// Executes search requests against the aliased reference index.
pub struct SearchService {
    engine: Arc<SearchEngine>,
    config: SearchConfig,
    alias: String,
}

impl SearchService {
    /// Create the service.
    #[must_use]
    pub fn new(engine: Arc<SearchEngine>, config: SearchConfig, alias: impl Into<String>) -> Self {
        Self {
            engine,
            config,
            alias: alias.into(),
        }
    }

    /// Run a search. Pages beyond the natural result window are rejected.
    pub async fn search(&self, params: &SearchParams) -> RepoResult<SearchResultPage> {
        let page = params.page.unwrap_or(1);
        if page == 0 {
            return Err(RepoError::invalid_payload("page is 1-indexed"));
        }
        if page.saturating_mul(self.config.page_size) > self.config.max_result_window {
            return Err(RepoError::invalid_payload(format!(
                "page {page} exceeds the natural limit of {} results",
                self.config.max_result_window
            )));
        }

        let mut query = QueryStringQuery::new(params.q.clone(), self.config.default_fields.clone());
        query.start_year = params.start_year;
        query.end_year = params.end_year;
        if let Some(sort) = &params.sort {
            query.sort = Some(SortField::parse(sort)?);
        }
        if let Some(annotation) = &params.annotation {
            for raw in annotation.split(',').filter(|s| !s.is_empty()) {
                query.annotation_filters.push(AnnotationFilter::parse(raw)?);
            }
        }
        query.validate()?;

        let hits = self.engine.search_query_string(&self.alias, &query).await?;
        let total = hits.len().min(self.config.max_result_window);
        let offset = (page - 1) * self.config.page_size;
        let mut documents = Vec::new();
        for hit in hits.iter().skip(offset).take(self.config.page_size) {
            if let Some(doc) = self.engine.get_doc(&self.alias, hit.id).await? {
                documents.push(doc);
            }
        }
        Ok(SearchResultPage {
            hits: documents,
            total,
            page,
            page_size: self.config.page_size,
        })
    }
}
