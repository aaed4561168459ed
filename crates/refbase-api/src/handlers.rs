// SPDX-License-Identifier: MIT OR Apache-2.0
//! Request handlers.

use crate::duration::parse_iso8601_duration;
use crate::search::SearchParams;
use crate::{ApiError, AppState};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use refbase_core::wire::ResultSubmissionWire;
use refbase_core::{
    ClientSecret, CollisionStrategy, EnhancementRequest, EnhancementRequestStatus, ImportRecord,
    ImportRecordStatus, ImportResultStatus, Robot, RobotAutomation,
};
use refbase_error::RepoError;
use refbase_robot::verify_request;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// `GET /healthcheck`.
pub async fn healthcheck() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "time": Utc::now().to_rfc3339(),
    }))
}

// ---------------------------------------------------------------------------
// Imports
// ---------------------------------------------------------------------------

/// Body of `POST /imports/records/`.
#[derive(Debug, Deserialize)]
pub struct ImportRecordIn {
    /// Processor name.
    pub processor_name: String,
    /// Processor version.
    pub processor_version: String,
    /// Upstream source name.
    pub source_name: String,
    /// Expected reference count, if known.
    #[serde(default)]
    pub expected_reference_count: Option<usize>,
    /// When the upstream search ran.
    pub searched_at: DateTime<Utc>,
}

/// `POST /imports/records/` — create a record for an import process.
pub async fn create_import_record(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ImportRecordIn>,
) -> ApiResult<(StatusCode, Json<ImportRecord>)> {
    let record = ImportRecord {
        id: Uuid::new_v4(),
        processor_name: body.processor_name,
        processor_version: body.processor_version,
        source_name: body.source_name,
        expected_reference_count: body.expected_reference_count,
        searched_at: body.searched_at,
        status: ImportRecordStatus::Created,
    };
    let record = state.imports.create_import_record(record).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// `GET /imports/records/{record_id}/`.
pub async fn get_import_record(
    State(state): State<Arc<AppState>>,
    Path(record_id): Path<Uuid>,
) -> ApiResult<Json<ImportRecord>> {
    Ok(Json(state.imports.get_record(record_id).await?))
}

/// `PATCH /imports/records/{record_id}/finalise/`.
pub async fn finalise_import_record(
    State(state): State<Arc<AppState>>,
    Path(record_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.imports.finalise_record(record_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Body of `POST /imports/records/{record_id}/batches/`.
#[derive(Debug, Deserialize)]
pub struct ImportBatchIn {
    /// Pointer to the newline-delimited JSON artifact.
    pub storage_url: String,
    /// Collision strategy for every line; defensive by default.
    #[serde(default)]
    pub collision_strategy: CollisionStrategy,
}

/// `POST /imports/records/{record_id}/batches/` — register and enqueue.
pub async fn enqueue_import_batch(
    State(state): State<Arc<AppState>>,
    Path(record_id): Path<Uuid>,
    Json(body): Json<ImportBatchIn>,
) -> ApiResult<(StatusCode, Json<refbase_core::ImportBatch>)> {
    let batch = state
        .imports
        .enqueue_batch(record_id, &body.storage_url, body.collision_strategy)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(batch)))
}

/// `GET .../batches/{batch_id}/summary/`.
pub async fn get_import_batch_summary(
    State(state): State<Arc<AppState>>,
    Path((_record_id, batch_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<refbase_import::ImportBatchSummary>> {
    Ok(Json(state.imports.get_batch_summary(batch_id).await?))
}

/// Query of `GET .../batches/{batch_id}/results/`.
#[derive(Debug, Default, Deserialize)]
pub struct ResultsQuery {
    /// Restrict to one outcome.
    #[serde(default)]
    pub status: Option<ImportResultStatus>,
}

/// `GET .../batches/{batch_id}/results/`.
pub async fn get_import_batch_results(
    State(state): State<Arc<AppState>>,
    Path((_record_id, batch_id)): Path<(Uuid, Uuid)>,
    Query(query): Query<ResultsQuery>,
) -> ApiResult<Json<Vec<refbase_core::ImportResult>>> {
    Ok(Json(state.imports.get_results(batch_id, query.status).await?))
}

// ---------------------------------------------------------------------------
// Robots and automations
// ---------------------------------------------------------------------------

/// Body of `POST /robots/`.
#[derive(Debug, Deserialize)]
pub struct RobotIn {
    /// Unique robot name.
    pub name: String,
    /// Base URL the robot serves its endpoints on.
    pub base_url: String,
    /// Description.
    pub description: String,
    /// Owner.
    pub owner: String,
}

/// `POST /robots/` — provision a robot.
///
/// The generated client secret appears in this response exactly once; it is
/// redacted everywhere else.
pub async fn register_robot(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RobotIn>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let secret: String = {
        // 32 random bytes, hex-encoded.
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        a.as_bytes()
            .iter()
            .chain(b.as_bytes())
            .map(|byte| format!("{byte:02x}"))
            .collect()
    };
    let robot = Robot::new(
        body.name,
        body.base_url,
        body.description,
        body.owner,
        ClientSecret::new(secret.clone()),
    );
    state.store.insert_robot(robot.clone()).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": robot.id,
            "name": robot.name,
            "base_url": robot.base_url,
            "description": robot.description,
            "owner": robot.owner,
            "client_secret": secret,
        })),
    ))
}

/// Body of `POST /robots/{robot_id}/automations/`.
#[derive(Debug, Deserialize)]
pub struct AutomationIn {
    /// The percolation query.
    pub query: serde_json::Value,
}

/// `POST /robots/{robot_id}/automations/` — register an automation.
pub async fn register_automation(
    State(state): State<Arc<AppState>>,
    Path(robot_id): Path<Uuid>,
    Json(body): Json<AutomationIn>,
) -> ApiResult<(StatusCode, Json<RobotAutomation>)> {
    state.store.get_robot(robot_id).await?;
    let automation = RobotAutomation::new(robot_id, body.query);
    state.automations.register(automation.clone()).await?;
    Ok((StatusCode::CREATED, Json(automation)))
}

// ---------------------------------------------------------------------------
// Enhancement requests
// ---------------------------------------------------------------------------

/// Body of `POST /enhancement-requests/`.
#[derive(Debug, Deserialize)]
pub struct EnhancementRequestIn {
    /// The robot to request enhancements from.
    pub robot_id: Uuid,
    /// The references to enhance.
    pub reference_ids: Vec<Uuid>,
    /// Request source.
    #[serde(default)]
    pub source: Option<String>,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: i32,
    /// Opaque pass-through parameters.
    #[serde(default)]
    pub enhancement_parameters: Option<serde_json::Value>,
}

/// Response shape for enhancement requests: the row plus derived status.
#[derive(Debug, Serialize)]
pub struct EnhancementRequestOut {
    /// The request row.
    #[serde(flatten)]
    pub request: EnhancementRequest,
    /// Derived status.
    pub status: EnhancementRequestStatus,
}

/// `POST /enhancement-requests/`.
pub async fn create_enhancement_request(
    State(state): State<Arc<AppState>>,
    Json(body): Json<EnhancementRequestIn>,
) -> ApiResult<(StatusCode, Json<EnhancementRequestOut>)> {
    if body.reference_ids.is_empty() {
        return Err(RepoError::invalid_payload("reference_ids must be non-empty").into());
    }
    let mut request = EnhancementRequest::new(body.robot_id, body.reference_ids)
        .with_priority(body.priority);
    request.source = body.source;
    request.enhancement_parameters = body.enhancement_parameters;
    let request = state.dispatch.create_request(request).await?;
    let status = state.dispatch.request_status(request.id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(EnhancementRequestOut { request, status }),
    ))
}

/// `GET /enhancement-requests/{request_id}/`.
pub async fn get_enhancement_request(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<Uuid>,
) -> ApiResult<Json<EnhancementRequestOut>> {
    let request = state.store.get_request(request_id).await?;
    let status = state.dispatch.request_status(request_id).await?;
    Ok(Json(EnhancementRequestOut { request, status }))
}

// ---------------------------------------------------------------------------
// Robot enhancement batches (the pull model)
// ---------------------------------------------------------------------------

/// Verify the HMAC signature contract on a robot-facing request.
async fn verify_robot(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Robot, ApiError> {
    let header = |name: &str| -> Result<String, ApiError> {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| RepoError::invalid_payload(format!("missing {name} header")).into())
    };
    let client_id: Uuid = header("X-Client-Id")?
        .parse()
        .map_err(|_| ApiError(RepoError::invalid_payload("X-Client-Id must be a UUID")))?;
    let timestamp: i64 = header("X-Request-Timestamp")?.parse().map_err(|_| {
        ApiError(RepoError::invalid_payload(
            "X-Request-Timestamp must be unix seconds",
        ))
    })?;
    let authorization = header("Authorization")?;
    let signature = authorization.strip_prefix("Signature ").ok_or_else(|| {
        ApiError(RepoError::invalid_payload(
            "Authorization header must be `Signature <hex>`",
        ))
    })?;

    let robot = state.store.get_robot(client_id).await?;
    verify_request(
        robot.client_secret.expose(),
        timestamp,
        body,
        signature,
        Utc::now().timestamp(),
    )?;
    Ok(robot)
}

/// Query of `POST /robot-enhancement-batches/`.
#[derive(Debug, Deserialize)]
pub struct PollQuery {
    /// The polling robot.
    pub robot_id: Uuid,
    /// Maximum rows to lease.
    #[serde(default)]
    pub limit: Option<usize>,
    /// Requested lease as an ISO-8601 duration.
    #[serde(default)]
    pub lease: Option<String>,
}

/// Wire shape of a leased batch.
#[derive(Debug, Serialize)]
pub struct RobotBatchOut {
    /// Batch id.
    pub id: Uuid,
    /// The robot the batch is leased to.
    pub robot_id: Uuid,
    /// Signed read URL for the hydrated reference file.
    pub reference_storage_url: String,
    /// Signed write URL for the result file.
    pub result_storage_url: String,
    /// Lease expiry.
    pub expires_at: DateTime<Utc>,
}

fn parse_lease(lease: Option<&str>) -> Result<Option<Duration>, ApiError> {
    lease
        .map(parse_iso8601_duration)
        .transpose()
        .map_err(ApiError)
}

/// `POST /robot-enhancement-batches/?robot_id=&limit=&lease=` — poll for
/// work. 200 with a batch, or 204 when none is available.
pub async fn poll_robot_batch(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PollQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let robot = verify_robot(&state, &headers, &body).await?;
    if robot.id != query.robot_id {
        return Err(RepoError::conflict("robot_id does not match the signing client").into());
    }
    let lease = parse_lease(query.lease.as_deref())?;
    let limit = query.limit.unwrap_or(state.config.dispatch.max_batch_size);

    match state.dispatch.poll_batch(robot.id, limit, lease).await? {
        Some(leased) => {
            let out = RobotBatchOut {
                id: leased.batch.id,
                robot_id: leased.batch.robot_id,
                reference_storage_url: leased.reference_file_url.to_url(),
                result_storage_url: leased.result_file_url.to_url(),
                expires_at: leased.batch.expires_at,
            };
            Ok((StatusCode::OK, Json(out)).into_response())
        }
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

/// Query of `PATCH /robot-enhancement-batches/{batch_id}/renew-lease/`.
#[derive(Debug, Default, Deserialize)]
pub struct LeaseQuery {
    /// Requested lease as an ISO-8601 duration.
    #[serde(default)]
    pub lease: Option<String>,
}

/// `PATCH /robot-enhancement-batches/{batch_id}/renew-lease/`.
pub async fn renew_lease(
    State(state): State<Arc<AppState>>,
    Path(batch_id): Path<Uuid>,
    Query(query): Query<LeaseQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<refbase_core::RobotEnhancementBatch>> {
    let robot = verify_robot(&state, &headers, &body).await?;
    let batch = state.store.get_robot_batch(batch_id).await?;
    if batch.robot_id != robot.id {
        return Err(RepoError::conflict("batch belongs to a different robot").into());
    }
    let lease = parse_lease(query.lease.as_deref())?;
    Ok(Json(state.dispatch.renew_lease(batch_id, lease).await?))
}

/// `POST /robot-enhancement-batches/{batch_id}/results/`.
pub async fn submit_results(
    State(state): State<Arc<AppState>>,
    Path(batch_id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let robot = verify_robot(&state, &headers, &body).await?;
    let batch = state.store.get_robot_batch(batch_id).await?;
    if batch.robot_id != robot.id {
        return Err(RepoError::conflict("batch belongs to a different robot").into());
    }
    let submission: ResultSubmissionWire = if body.is_empty() {
        ResultSubmissionWire::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            ApiError(RepoError::invalid_payload(format!("invalid result submission: {e}")))
        })?
    };
    state.dispatch.submit_result(batch_id, submission).await?;
    Ok(StatusCode::ACCEPTED)
}

// ---------------------------------------------------------------------------
// References and search
// ---------------------------------------------------------------------------

/// `GET /references/{reference_id}/`.
pub async fn get_reference(
    State(state): State<Arc<AppState>>,
    Path(reference_id): Path<Uuid>,
) -> ApiResult<Json<refbase_core::Reference>> {
    Ok(Json(state.store.get_reference(reference_id).await?))
}

/// `GET /references/search/`.
pub async fn search_references(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<crate::SearchResultPage>> {
    Ok(Json(state.search.search(&params).await?))
}
