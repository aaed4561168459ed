// SPDX-License-Identifier: MIT OR Apache-2.0
//! Boundary behaviors of the HTTP surface.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use refbase_api::{build_router, AppState, REFERENCE_ALIAS};
use refbase_blob::{BlobClient, MemoryBlobClient};
use refbase_config::RepoConfig;
use refbase_core::{ClientSecret, Robot};
use refbase_robot::sign_request;
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

async fn state() -> Arc<AppState> {
    let blob = Arc::new(MemoryBlobClient::new()) as Arc<dyn BlobClient>;
    let state = AppState::build(RepoConfig::default(), blob);
    state.index_manager.ensure_initialized().await.unwrap();
    state
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn signed_robot_request(
    robot: &Robot,
    method: &str,
    uri: &str,
    body: &str,
) -> Request<Body> {
    let timestamp = chrono::Utc::now().timestamp();
    let signature = sign_request(robot.client_secret.expose(), timestamp, body.as_bytes());
    Request::builder()
        .method(method)
        .uri(uri)
        .header("Authorization", format!("Signature {signature}"))
        .header("X-Client-Id", robot.id.to_string())
        .header("X-Request-Timestamp", timestamp.to_string())
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn registered_robot(state: &AppState) -> Robot {
    let robot = Robot::new(
        "abstract-bot",
        "http://robot.local",
        "makes abstracts",
        "team",
        ClientSecret::new("secret-secret"),
    );
    state.store.insert_robot(robot.clone()).await.unwrap();
    robot
}

#[tokio::test]
async fn healthcheck_is_ok() {
    let app = build_router(state().await);
    let response = app
        .oneshot(Request::get("/healthcheck").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn inverted_year_window_is_422() {
    let app = build_router(state().await);
    let response = app
        .oneshot(
            Request::get("/references/search/?q=x&start_year=2024&end_year=2020")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn paging_beyond_the_window_is_422() {
    let app = build_router(state().await);
    // 501 × 20 > 10 000.
    let response = app
        .oneshot(
            Request::get("/references/search/?q=x&page=501")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = body_json(response).await;
    assert_eq!(body["code"], "RB-I001");
}

#[tokio::test]
async fn free_text_sort_field_is_rejected() {
    let app = build_router(state().await);
    let response = app
        .oneshot(
            Request::get("/references/search/?q=x&sort=title")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn poll_without_work_is_204() {
    let state = state().await;
    let robot = registered_robot(&state).await;
    let app = build_router(Arc::clone(&state));
    let request = signed_robot_request(
        &robot,
        "POST",
        &format!("/robot-enhancement-batches/?robot_id={}&lease=PT60S", robot.id),
        "",
    );
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn malformed_lease_duration_is_422() {
    let state = state().await;
    let robot = registered_robot(&state).await;
    let app = build_router(Arc::clone(&state));
    let request = signed_robot_request(
        &robot,
        "POST",
        &format!("/robot-enhancement-batches/?robot_id={}&lease=60s", robot.id),
        "",
    );
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn unsigned_robot_request_is_rejected() {
    let state = state().await;
    let robot = registered_robot(&state).await;
    let app = build_router(Arc::clone(&state));
    let response = app
        .oneshot(
            Request::post(format!(
                "/robot-enhancement-batches/?robot_id={}",
                robot.id
            ))
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn tampered_signature_is_rejected() {
    let state = state().await;
    let robot = registered_robot(&state).await;
    let app = build_router(Arc::clone(&state));
    let mut request = signed_robot_request(
        &robot,
        "POST",
        &format!("/robot-enhancement-batches/?robot_id={}", robot.id),
        "",
    );
    request.headers_mut().insert(
        "Authorization",
        format!("Signature {}", "0".repeat(64)).parse().unwrap(),
    );
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn unknown_import_record_is_404() {
    let app = build_router(state().await);
    let response = app
        .oneshot(
            Request::get(format!("/imports/records/{}/", uuid::Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["code"], "RB-S001");
}

#[tokio::test]
async fn search_serves_projected_documents() {
    let state = state().await;
    let mut doc = refbase_search::ReferenceDoc::minimal(uuid::Uuid::new_v4());
    doc.title = Some("Glacier melt dynamics".into());
    doc.publication_year = Some(2023);
    state
        .search_engine
        .upsert(REFERENCE_ALIAS, doc)
        .await
        .unwrap();

    let app = build_router(Arc::clone(&state));
    let response = app
        .oneshot(
            Request::get("/references/search/?q=glacier")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["total"], 1);
    assert_eq!(body["hits"][0]["title"], "Glacier melt dynamics");
}
