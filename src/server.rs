//! HTTP server
//!
//! The probing protocol and corpus management over JSON. Status values are
//! `REQUEST_PROBE`, `CANDIDATES_FOUND`, `MATCH_FOUND`, `NO_MATCH`; errors
//! map to 400 (malformed probe), 404 (unknown session or image) and 500
//! with no session mutation.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Settings;
use crate::db::{self, features::ValueTypeCache};
use crate::discovery::run_discovery;
use crate::error::EngineError;
use crate::governor::Governor;
use crate::ingest::ingest_image;
use crate::matcher::Probe;
use crate::sample::ProbeSpec;
use crate::session::{self, ConstellationStep, ProbeOutcome, SessionStore};

// ============================================================================
// Application State
// ============================================================================

#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub sessions: Arc<SessionStore>,
    pub settings: Arc<Settings>,
    pub cache: Arc<ValueTypeCache>,
    pub governor: Arc<Governor>,
}

impl AppState {
    pub fn new(db: SqlitePool, settings: Settings) -> Self {
        Self {
            sessions: Arc::new(SessionStore::from_settings(&settings)),
            settings: Arc::new(settings),
            cache: Arc::new(ValueTypeCache::new()),
            governor: Arc::new(Governor::new()),
            db,
        }
    }
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest {
    #[serde(default)]
    request_probe: bool,
    session_id: Option<String>,
    probe: Option<Probe>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefineRequest {
    session_id: String,
    probe: Probe,
}

#[derive(Debug, Deserialize)]
struct AddImageRequest {
    path: String,
    #[serde(default)]
    discover: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct DiscoverRequest {
    iterations: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    candidates: Option<Vec<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_question: Option<ProbeSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    probe_spec: Option<ProbeSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    constellation_path: Option<Vec<ConstellationStep>>,
}

impl SearchResponse {
    fn from_outcome(outcome: ProbeOutcome) -> Self {
        match outcome {
            ProbeOutcome::RequestProbe { probe_spec } => Self {
                status: "REQUEST_PROBE",
                session_id: None,
                image_id: None,
                candidates: None,
                next_question: None,
                probe_spec: Some(probe_spec),
                constellation_path: None,
            },
            ProbeOutcome::NoMatch { constellation } => Self {
                status: "NO_MATCH",
                session_id: None,
                image_id: None,
                candidates: None,
                next_question: None,
                probe_spec: None,
                constellation_path: Some(constellation),
            },
            ProbeOutcome::MatchFound {
                image_id,
                constellation,
            } => Self {
                status: "MATCH_FOUND",
                session_id: None,
                image_id: Some(image_id),
                candidates: None,
                next_question: None,
                probe_spec: None,
                constellation_path: Some(constellation),
            },
            ProbeOutcome::Candidates {
                session_id,
                candidates,
                next_question,
                constellation,
            } => Self {
                status: "CANDIDATES_FOUND",
                session_id: Some(session_id),
                image_id: None,
                candidates: Some(candidates),
                next_question,
                probe_spec: None,
                constellation_path: Some(constellation),
            },
        }
    }
}

fn error_response(e: EngineError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &e {
        EngineError::MalformedDescriptor(_) => StatusCode::BAD_REQUEST,
        EngineError::SessionNotFound(_) | EngineError::ImageNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": e.to_string() })))
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    match db::health_check(&state.db).await {
        Ok(health) => Json(serde_json::json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "sessions": state.sessions.len(),
            "database": health,
        }))
        .into_response(),
        Err(e) => error_response(EngineError::other(e.to_string())).into_response(),
    }
}

async fn search_start_handler(
    State(state): State<AppState>,
    Json(req): Json<StartRequest>,
) -> impl IntoResponse {
    // Probe request: propose a descriptor, allocate nothing.
    if req.request_probe || req.probe.is_none() {
        return match session::request_probe(&state.db, &state.settings).await {
            Ok(probe_spec) => {
                Json(SearchResponse::from_outcome(ProbeOutcome::RequestProbe { probe_spec }))
                    .into_response()
            }
            Err(e) => error_response(e).into_response(),
        };
    }

    let probe = req.probe.expect("checked above");
    let result = match req.session_id {
        Some(session_id) => {
            session::refine(&state.db, &state.sessions, &state.settings, &session_id, &probe).await
        }
        None => session::start_with_probe(&state.db, &state.sessions, &state.settings, &probe).await,
    };

    match result {
        Ok(outcome) => Json(SearchResponse::from_outcome(outcome)).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn search_refine_handler(
    State(state): State<AppState>,
    Json(req): Json<RefineRequest>,
) -> impl IntoResponse {
    match session::refine(
        &state.db,
        &state.sessions,
        &state.settings,
        &req.session_id,
        &req.probe,
    )
    .await
    {
        Ok(outcome) => Json(SearchResponse::from_outcome(outcome)).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn add_image_handler(
    State(state): State<AppState>,
    Json(req): Json<AddImageRequest>,
) -> impl IntoResponse {
    let path = PathBuf::from(&req.path);
    match ingest_image(&state.db, &state.cache, &state.settings, &path).await {
        Ok(report) => {
            if let Some(iterations) = req.discover {
                if let Err(e) = run_discovery(&state.db, &state.settings, iterations, None).await {
                    tracing::warn!("post-ingest discovery failed: {e}");
                }
            }
            state.governor.after_ingest(&state.db, &state.settings).await;
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "status": "OK",
                    "imageId": report.image_id,
                    "featureCount": report.feature_count,
                })),
            )
                .into_response()
        }
        Err(e) => error_response(e).into_response(),
    }
}

async fn delete_image_handler(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> impl IntoResponse {
    let image = match identifier.parse::<i64>() {
        Ok(id) => db::get_image(&state.db, id).await,
        Err(_) => db::get_image_by_filename(&state.db, &identifier).await,
    };
    let image = match image {
        Ok(image) => image,
        Err(e) => return error_response(e).into_response(),
    };

    match db::delete_image(&state.db, image.image_id).await {
        Ok(()) => Json(serde_json::json!({
            "status": "OK",
            "imageId": image.image_id,
        }))
        .into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn discover_handler(
    State(state): State<AppState>,
    Json(req): Json<DiscoverRequest>,
) -> impl IntoResponse {
    match run_discovery(&state.db, &state.settings, req.iterations, None).await {
        Ok(report) => Json(serde_json::json!({
            "status": "OK",
            "iterations": report.iterations_run,
            "pairsWritten": report.pairs_written,
        }))
        .into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

// ============================================================================
// Router & Entry Point
// ============================================================================

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/search/start", post(search_start_handler))
        .route("/search/refine", post(search_refine_handler))
        .route("/images", post(add_image_handler))
        .route("/images/:identifier", delete(delete_image_handler))
        .route("/discover", post(discover_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn run_server(pool: SqlitePool, settings: Settings) -> anyhow::Result<()> {
    let addr = format!("{}:{}", settings.host, settings.port);
    let state = AppState::new(pool, settings);
    let _sweeper = state.sessions.spawn_sweeper();

    let app = create_router(state);
    info!("imprint server listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
