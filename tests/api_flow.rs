//! End-to-end API flow tests
//!
//! Drives the axum router the way a client would: request a probe, measure
//! it, start a dialog, refine to a decision. Corpus rows are seeded either
//! through real image ingestion or directly at the store layer when a
//! scenario needs exact control over stored values.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use imprint::config::Settings;
use imprint::db::features::{insert_feature_batch, resolve_value_type, NewFeature, ValueTypeCache};
use imprint::db::{self, create_image};
use imprint::descriptor::Descriptor;
use imprint::matcher::Probe;
use imprint::sample::{descriptor_for_sample, spec_for_descriptor};
use imprint::server::{create_router, AppState};

async fn test_app() -> (Router, sqlx::SqlitePool) {
    let pool = db::init_memory_pool().await.unwrap();
    let settings = Settings {
        relax_max_steps: 0,
        combo_augmentations: 1,
        random_per_aug: 6,
        progressive_cycles: 1,
        ..Settings::default()
    };
    let state = AppState::new(pool.clone(), settings);
    (create_router(state), pool)
}

async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn probe_for(d: &Descriptor, value: f64) -> Value {
    serde_json::to_value(Probe {
        descriptor: d.clone(),
        value,
        size: d.span,
        rel_x: 1.0,
        rel_y: 0.0,
        resolution_level: None,
    })
    .unwrap()
}

/// Seed stored measurements for a descriptor directly at the store layer.
async fn seed(pool: &sqlx::SqlitePool, d: &Descriptor, values: &[(i64, f64)]) {
    let cache = ValueTypeCache::new();
    let vt = resolve_value_type(pool, &cache, d, 4).await.unwrap();
    let spec = spec_for_descriptor(d);
    let batch: Vec<NewFeature> = values
        .iter()
        .map(|(image_id, value)| NewFeature {
            image_id: *image_id,
            value_type: vt,
            resolution_level: spec.resolution_level,
            pos_x: spec.pos_x,
            pos_y: spec.pos_y,
            rel_x: 1.0,
            rel_y: 0.0,
            value: *value,
            size: d.span,
        })
        .collect();
    insert_feature_batch(pool, &batch).await.unwrap();
}

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _pool) = test_app().await;
    let response = app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_exact_match_single_probe() {
    // S1: one corpus image; the proposed probe measures to an exact match.
    let (app, pool) = test_app().await;
    let x = create_image(&pool, "x.png").await.unwrap().image_id;
    let d = descriptor_for_sample(10, 1);
    seed(&pool, &d, &[(x, 0.30)]).await;

    // Request a probe spec; with one stored descriptor the server proposes it.
    let (status, body) = post_json(&app, "/search/start", json!({ "requestProbe": true })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "REQUEST_PROBE");
    assert_eq!(body["probeSpec"]["descriptorKey"], d.hash());

    // The client measures and calls back; one candidate, no session.
    let (status, body) = post_json(
        &app,
        "/search/start",
        json!({ "probe": probe_for(&d, 0.30) }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "MATCH_FOUND");
    assert_eq!(body["imageId"], x);
    assert!(body.get("sessionId").is_none());
}

#[tokio::test]
async fn test_two_step_disambiguation_and_empty_intersection() {
    // S2 then S3 on the same seeded corpus.
    let (app, pool) = test_app().await;
    let x = create_image(&pool, "x.png").await.unwrap().image_id;
    let y = create_image(&pool, "y.png").await.unwrap().image_id;

    let d1 = descriptor_for_sample(10, 1);
    seed(&pool, &d1, &[(x, 0.30), (y, 0.31)]).await;
    let d2 = d1.with_channel(imprint::Channel::Hue);
    seed(&pool, &d2, &[(x, 0.10), (y, 0.70)]).await;

    // First probe is ambiguous between X and Y.
    let (status, body) = post_json(
        &app,
        "/search/start",
        json!({ "probe": probe_for(&d1, 0.30) }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "CANDIDATES_FOUND");
    let session_id = body["sessionId"].as_str().unwrap().to_string();
    assert_eq!(body["candidates"].as_array().unwrap().len(), 2);
    assert!(body["nextQuestion"].is_object());
    assert_eq!(body["constellationPath"].as_array().unwrap().len(), 1);

    // S2: refine with the true X's measurement resolves the dialog.
    let (status, body) = post_json(
        &app,
        "/search/refine",
        json!({ "sessionId": session_id, "probe": probe_for(&d2, 0.10) }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "MATCH_FOUND");
    assert_eq!(body["imageId"], x);

    // The session is gone afterwards.
    let (status, _) = post_json(
        &app,
        "/search/refine",
        json!({ "sessionId": session_id, "probe": probe_for(&d2, 0.10) }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // S3: a fresh session whose refinement matches neither image.
    let (_, body) = post_json(
        &app,
        "/search/start",
        json!({ "probe": probe_for(&d1, 0.30) }),
    )
    .await;
    let session_id = body["sessionId"].as_str().unwrap().to_string();
    let (status, body) = post_json(
        &app,
        "/search/refine",
        json!({ "sessionId": session_id, "probe": probe_for(&d2, 0.45) }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "NO_MATCH");
}

#[tokio::test]
async fn test_malformed_probe_rejected() {
    let (app, pool) = test_app().await;
    let x = create_image(&pool, "x.png").await.unwrap().image_id;
    let d = descriptor_for_sample(10, 1);
    seed(&pool, &d, &[(x, 0.30)]).await;

    // An explicit resolution level from the legacy encoding is refused.
    let mut probe = probe_for(&d, 0.30);
    probe["resolution_level"] = json!(7);
    let (status, _) = post_json(&app, "/search/start", json!({ "probe": probe })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_ingest_identify_delete_over_http() {
    let (app, _pool) = test_app().await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("corpus.png");
    image::RgbImage::from_fn(240, 200, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    })
    .save(&path)
    .unwrap();

    let (status, body) = post_json(
        &app,
        "/images",
        json!({ "path": path.to_string_lossy() }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "OK");
    let image_id = body["imageId"].as_i64().unwrap();
    assert!(body["featureCount"].as_u64().unwrap() > 0);

    // A discovery batch over a one-image corpus exits cleanly.
    let (status, body) = post_json(&app, "/discover", json!({ "iterations": 5 })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["iterations"], 0);

    // Delete by id, then deleting again is a 404.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/images/{image_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/images/{image_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_missing_ingest_path_is_client_visible_error() {
    let (app, _pool) = test_app().await;
    let (status, _) = post_json(
        &app,
        "/images",
        json!({ "path": "/definitely/not/here.png" }),
    )
    .await;
    assert_ne!(status, StatusCode::OK);
}
