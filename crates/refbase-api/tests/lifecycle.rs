// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end lifecycle scenarios: ingest → dedup → projection →
//! percolation → dispatch, driven the way the workers drive them.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use refbase_api::{build_router, handle_task, AppState, REFERENCE_ALIAS};
use refbase_blob::{BlobClient, BlobFile, MemoryBlobClient};
use refbase_config::{DedupConfig, RepoConfig};
use refbase_core::{
    ClientSecret, CollisionStrategy, DuplicateDetermination, ImportResultStatus, Robot,
    RobotAutomation,
};
use refbase_import::new_import_record;
use refbase_robot::sign_request;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

struct World {
    state: Arc<AppState>,
    blob: Arc<MemoryBlobClient>,
}

/// Thresholds calibrated to the embedded search engine's score magnitudes.
fn calibrated_config() -> RepoConfig {
    RepoConfig {
        dedup: DedupConfig {
            es_min_score_threshold: 1.0,
            es_high_score_threshold: 50.0,
            ..DedupConfig::default()
        },
        ..RepoConfig::default()
    }
}

async fn world(config: RepoConfig) -> World {
    let blob = Arc::new(MemoryBlobClient::new());
    let state = AppState::build(config, Arc::clone(&blob) as Arc<dyn BlobClient>);
    state.index_manager.ensure_initialized().await.unwrap();
    World { state, blob }
}

/// Run every queued task to completion, the way the workers would.
async fn drain(state: &AppState) {
    while let Some(delivery) = state.bus.receive().await {
        handle_task(state, &delivery).await.unwrap();
        state.bus.ack(delivery.task.id).await.unwrap();
    }
}

fn reference_line(identifiers: Value, title: &str, year: i32, authors: &[&str]) -> String {
    let authorship: Vec<Value> = authors
        .iter()
        .map(|name| json!({"display_name": name}))
        .collect();
    json!({
        "visibility": "public",
        "identifiers": identifiers,
        "enhancements": [{
            "source": "feed",
            "visibility": "public",
            "enhancement_type": "bibliographic",
            "title": title,
            "publication_year": year,
            "authorship": authorship,
        }],
    })
    .to_string()
}

async fn ingest(world: &World, name: &str, lines: &[String]) -> Uuid {
    let file = BlobFile::new("refbase", "imports", name).unwrap();
    world.blob.upload_lines(&file, lines).await.unwrap();
    let record = world
        .state
        .imports
        .create_import_record(new_import_record("proc", "1", "feed", chrono::Utc::now()))
        .await
        .unwrap();
    let batch = world
        .state
        .imports
        .enqueue_batch(record.id, &file.uri(), CollisionStrategy::MergeDefensive)
        .await
        .unwrap();
    drain(&world.state).await;
    batch.id
}

#[tokio::test]
async fn replayed_artifact_leaves_one_reference_and_one_document() {
    let w = world(RepoConfig::default()).await;
    let line = reference_line(
        json!([{"identifier_type": "doi", "identifier": "10.1/x"}]),
        "Understanding drift",
        2025,
        &["Doe", "Smith"],
    );

    let first = ingest(&w, "a.jsonl", &[line.clone()]).await;
    let results = w.state.imports.get_results(first, None).await.unwrap();
    assert_eq!(results[0].status, ImportResultStatus::Created);
    let reference_id = results[0].reference_id.unwrap();

    let decision = w.state.store.active_decision(reference_id).await.unwrap();
    assert_eq!(decision.determination, DuplicateDetermination::Canonical);
    assert_eq!(
        w.state.search_engine.count(REFERENCE_ALIAS).await.unwrap(),
        1
    );

    // Replaying the identical artifact merges defensively: same reference,
    // same document, the result points at the retained row.
    let second = ingest(&w, "b.jsonl", &[line]).await;
    let results = w.state.imports.get_results(second, None).await.unwrap();
    assert_eq!(results[0].status, ImportResultStatus::Updated);
    assert_eq!(results[0].reference_id, Some(reference_id));
    assert_eq!(w.state.store.all_reference_ids().await.len(), 1);
    assert_eq!(
        w.state.search_engine.count(REFERENCE_ALIAS).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn near_identical_titles_collapse_to_one_canonical() {
    let w = world(calibrated_config()).await;
    let a_line = reference_line(
        json!([{"identifier_type": "doi", "identifier": "10.1/x"}]),
        "Climate change impacts on health",
        2023,
        &["Doe"],
    );
    let a_batch = ingest(&w, "a.jsonl", &[a_line]).await;
    let a_id = w.state.imports.get_results(a_batch, None).await.unwrap()[0]
        .reference_id
        .unwrap();

    let b_line = reference_line(
        json!([{"identifier_type": "doi", "identifier": "10.2/y"}]),
        "Climate change impacts on public health",
        2023,
        &["Doe", "Jones"],
    );
    let b_batch = ingest(&w, "b.jsonl", &[b_line]).await;
    let b_id = w.state.imports.get_results(b_batch, None).await.unwrap()[0]
        .reference_id
        .unwrap();

    let decision = w.state.store.active_decision(b_id).await.unwrap();
    assert_eq!(decision.determination, DuplicateDetermination::Duplicate);
    assert_eq!(decision.canonical_reference_id, Some(a_id));

    // One visible document carrying the union of the cluster.
    assert_eq!(
        w.state.search_engine.count(REFERENCE_ALIAS).await.unwrap(),
        1
    );
    let doc = w
        .state
        .search_engine
        .get_doc(REFERENCE_ALIAS, a_id)
        .await
        .unwrap()
        .unwrap();
    assert!(doc.authors.contains(&"Jones".to_string()));
    assert!(doc.identifiers.iter().any(|i| i.identifier == "10.2/y"));
}

#[tokio::test]
async fn automation_fires_on_doi_addition_and_robot_polls_the_work() {
    let w = world(RepoConfig::default()).await;

    let robot = Robot::new(
        "abstract-bot",
        "http://robot.local",
        "makes abstracts",
        "team",
        ClientSecret::new("secret-secret"),
    );
    w.state.store.insert_robot(robot.clone()).await.unwrap();
    w.state
        .automations
        .register(RobotAutomation::new(
            robot.id,
            json!({
                "bool": {
                    "must": [
                        {"term": {"changeset.added_identifiers.identifier_type": "doi"}},
                    ],
                    "must_not": [
                        {"term": {"reference.enhancements.content.enhancement_type": "abstract"}},
                    ],
                }
            }),
        ))
        .await
        .unwrap();

    // Ingest without a DOI: no firing.
    let line = reference_line(
        json!([{"identifier_type": "pm_id", "identifier": "123"}]),
        "A work awaiting its DOI",
        2024,
        &["Doe"],
    );
    let batch = ingest(&w, "a.jsonl", &[line]).await;
    let reference_id = w.state.imports.get_results(batch, None).await.unwrap()[0]
        .reference_id
        .unwrap();
    assert!(w
        .state
        .dispatch
        .poll_batch(robot.id, 10, None)
        .await
        .unwrap()
        .is_none());

    // A merge that adds the DOI fires the automation.
    let line = reference_line(
        json!([
            {"identifier_type": "pm_id", "identifier": "123"},
            {"identifier_type": "doi", "identifier": "10.1/x"},
        ]),
        "A work awaiting its DOI",
        2024,
        &["Doe"],
    );
    ingest(&w, "b.jsonl", &[line]).await;

    // The robot polls over HTTP with a signed request and receives a batch
    // containing the reference.
    let app = build_router(Arc::clone(&w.state));
    let timestamp = chrono::Utc::now().timestamp();
    let signature = sign_request(robot.client_secret.expose(), timestamp, b"");
    let response = app
        .oneshot(
            Request::post(format!(
                "/robot-enhancement-batches/?robot_id={}&limit=10&lease=PT60S",
                robot.id
            ))
            .header("Authorization", format!("Signature {signature}"))
            .header("X-Client-Id", robot.id.to_string())
            .header("X-Request-Timestamp", timestamp.to_string())
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let batch: Value = serde_json::from_slice(&body).unwrap();

    let reference_url = batch["reference_storage_url"].as_str().unwrap();
    let uri = reference_url.split('?').next().unwrap();
    let file = BlobFile::parse_uri(uri).unwrap();
    let lines = w.blob.read_lines(&file).await.unwrap();
    assert_eq!(lines.len(), 1);
    let hydrated: refbase_core::Reference = serde_json::from_str(&lines[0]).unwrap();
    assert_eq!(hydrated.id, reference_id);
}

#[tokio::test]
async fn expired_lease_makes_the_work_pollable_again() {
    let w = world(RepoConfig::default()).await;
    let robot = Robot::new(
        "slow-bot",
        "http://robot.local",
        "slow",
        "team",
        ClientSecret::new("s"),
    );
    w.state.store.insert_robot(robot.clone()).await.unwrap();

    let line = reference_line(
        json!([{"identifier_type": "doi", "identifier": "10.1/x"}]),
        "Slow enhancement target",
        2024,
        &["Doe"],
    );
    let batch = ingest(&w, "a.jsonl", &[line]).await;
    let reference_id = w.state.imports.get_results(batch, None).await.unwrap()[0]
        .reference_id
        .unwrap();

    let request = w
        .state
        .dispatch
        .create_request(
            refbase_core::EnhancementRequest::new(robot.id, vec![reference_id])
                .with_source("operator"),
        )
        .await
        .unwrap();

    let first = w
        .state
        .dispatch
        .poll_batch(robot.id, 10, Some(std::time::Duration::from_secs(60)))
        .await
        .unwrap()
        .expect("work leased");

    // The lease lapses; the sweeper reclaims it and inserts a retry sibling.
    let later = chrono::Utc::now() + chrono::Duration::seconds(120);
    let stats = w.state.dispatch.sweep(later).await.unwrap();
    assert_eq!(stats.expired, 1);
    assert_eq!(stats.retried, 1);

    let second = w
        .state
        .dispatch
        .poll_batch(robot.id, 10, None)
        .await
        .unwrap()
        .expect("retry sibling pollable");
    assert_ne!(first.batch.id, second.batch.id);

    let sibling_id = second.batch.pending_enhancement_ids[0];
    let sibling = w.state.store.get_pending(sibling_id).await.unwrap();
    assert_eq!(sibling.reference_id, reference_id);
    assert!(sibling.retry_of.is_some());
    assert_eq!(
        w.state.dispatch.request_status(request.id).await.unwrap(),
        refbase_core::EnhancementRequestStatus::Accepted
    );
}
