// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! HTTP surface and background workers for the refbase repository.
//!
//! The ingest and enhancement flows are fire-and-poll: mutating endpoints
//! accept work and return immediately; per-line and per-enhancement failures
//! surface through summary endpoints, never through individual responses.
//! Robot-facing endpoints verify the HMAC signature contract.

mod duration;
mod handlers;
mod search;
mod worker;

pub use duration::parse_iso8601_duration;
pub use search::{SearchResultPage, SearchService};
pub use worker::{handle_task, run_sweeper, run_worker};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use refbase_automate::AutomationEngine;
use refbase_blob::{BlobClient, UrlSigner};
use refbase_bus::MessageBus;
use refbase_config::RepoConfig;
use refbase_dedup::DeduplicationEngine;
use refbase_dispatch::DispatchEngine;
use refbase_error::{ErrorBody, RepoError};
use refbase_import::{BatchProcessor, ImportService};
use refbase_index::IndexManager;
use refbase_search::{PercolationIndex, SearchEngine};
use refbase_store::RepositoryStore;
use std::sync::Arc;

/// The stable alias the reference index family lives behind.
pub const REFERENCE_ALIAS: &str = "reference";

/// Shared application state.
pub struct AppState {
    /// Authoritative store.
    pub store: Arc<RepositoryStore>,
    /// Search store.
    pub search_engine: Arc<SearchEngine>,
    /// Percolation index.
    pub percolator: Arc<PercolationIndex>,
    /// Blob gateway.
    pub blob: Arc<dyn BlobClient>,
    /// Task bus.
    pub bus: Arc<MessageBus>,
    /// Import front service.
    pub imports: ImportService,
    /// Import batch processor (driven by the worker).
    pub batch_processor: BatchProcessor,
    /// Dispatch engine.
    pub dispatch: DispatchEngine,
    /// Deduplication engine.
    pub dedup: DeduplicationEngine,
    /// Automation percolation engine.
    pub automations: AutomationEngine,
    /// Index manager for the reference alias.
    pub index_manager: IndexManager,
    /// Search endpoint service.
    pub search: SearchService,
    /// Loaded configuration.
    pub config: RepoConfig,
}

impl AppState {
    /// Wire the full component graph from a configuration and a blob client.
    pub fn build(config: RepoConfig, blob: Arc<dyn BlobClient>) -> Arc<Self> {
        let store = Arc::new(RepositoryStore::new());
        let search_engine = Arc::new(SearchEngine::new());
        let percolator = Arc::new(PercolationIndex::new());
        let bus = Arc::new(MessageBus::new(
            std::time::Duration::from_secs(60),
            config.bus.lock_renewal_window,
        ));
        let signer = UrlSigner::new(&config.blob.signing_key, config.blob.signed_url_expiry);

        let imports = ImportService::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            config.import.clone(),
        );
        let batch_processor = BatchProcessor::new(
            Arc::clone(&store),
            Arc::clone(&blob),
            Arc::clone(&bus),
        );
        let dispatch = DispatchEngine::new(
            Arc::clone(&store),
            Arc::clone(&blob),
            signer,
            Arc::clone(&bus),
            config.dispatch.clone(),
            config.blob.container.clone(),
        );
        let dedup = DeduplicationEngine::new(
            Arc::clone(&store),
            Arc::clone(&search_engine),
            config.dedup.clone(),
            REFERENCE_ALIAS,
        );
        let automations =
            AutomationEngine::new(Arc::clone(&store), Arc::clone(&percolator));
        let index_manager = IndexManager::new(
            Arc::clone(&search_engine),
            Arc::clone(&store),
            Arc::clone(&bus),
            REFERENCE_ALIAS,
        );
        let search = SearchService::new(
            Arc::clone(&search_engine),
            config.search.clone(),
            REFERENCE_ALIAS,
        );

        Arc::new(Self {
            store,
            search_engine,
            percolator,
            blob,
            bus,
            imports,
            batch_processor,
            dispatch,
            dedup,
            automations,
            index_manager,
            search,
            config,
        })
    }
}

/// Structured API error: the taxonomy's status mapping plus its wire body.
#[derive(Debug)]
pub struct ApiError(pub RepoError);

impl From<RepoError> for ApiError {
    fn from(err: RepoError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(ErrorBody::from(&self.0))).into_response()
    }
}

/// Build the router over shared state.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthcheck", get(handlers::healthcheck))
        .route("/imports/records/", post(handlers::create_import_record))
        .route(
            "/imports/records/{record_id}/",
            get(handlers::get_import_record),
        )
        .route(
            "/imports/records/{record_id}/finalise/",
            patch(handlers::finalise_import_record),
        )
        .route(
            "/imports/records/{record_id}/batches/",
            post(handlers::enqueue_import_batch),
        )
        .route(
            "/imports/records/{record_id}/batches/{batch_id}/summary/",
            get(handlers::get_import_batch_summary),
        )
        .route(
            "/imports/records/{record_id}/batches/{batch_id}/results/",
            get(handlers::get_import_batch_results),
        )
        .route("/robots/", post(handlers::register_robot))
        .route(
            "/robots/{robot_id}/automations/",
            post(handlers::register_automation),
        )
        .route(
            "/robot-enhancement-batches/",
            post(handlers::poll_robot_batch),
        )
        .route(
            "/robot-enhancement-batches/{batch_id}/renew-lease/",
            patch(handlers::renew_lease),
        )
        .route(
            "/robot-enhancement-batches/{batch_id}/results/",
            post(handlers::submit_results),
        )
        .route(
            "/enhancement-requests/",
            post(handlers::create_enhancement_request),
        )
        .route(
            "/enhancement-requests/{request_id}/",
            get(handlers::get_enhancement_request),
        )
        .route("/references/{reference_id}/", get(handlers::get_reference))
        .route("/references/search/", get(handlers::search_references))
        .with_state(state)
}
