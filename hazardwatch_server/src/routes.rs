//! HTTP routes over a shared [`HazardEngine`].

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use hazardwatch_core::{
    GeoPoint, HazardEngine, HazardStore, ReportCandidate, SubmitError, VerifiedHazard,
};
use hazardwatch_env::TokioContext;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};
use uuid::Uuid;

/// Engine as served: real clock, store chosen at startup.
pub type ServerEngine = HazardEngine<TokioContext, Arc<dyn HazardStore>>;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ServerEngine>,
}

pub fn build_router(engine: Arc<ServerEngine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/report", post(submit_report))
        .route("/hazards", get(list_hazards))
        .route("/clusters/{id}", get(cluster_detail))
        .route("/health", get(health))
        .layer(cors)
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                // Path only: query strings carry reporter coordinates
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    path = %request.uri().path(),
                )
            }),
        )
        .with_state(AppState { engine })
}

/// JSON error body with a status code.
struct ApiError {
    status: StatusCode,
    message: String,
    /// Resubmitting the same report may succeed
    retryable: bool,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<SubmitError> for ApiError {
    fn from(e: SubmitError) -> Self {
        let status = match e {
            SubmitError::Validation(_) => StatusCode::BAD_REQUEST,
            SubmitError::Contention { .. } => StatusCode::SERVICE_UNAVAILABLE,
            SubmitError::Storage(_) | SubmitError::Environment(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: e.to_string(),
            retryable: e.is_retryable(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = if self.retryable {
            json!({ "error": self.message, "retryable": true })
        } else {
            json!({ "error": self.message })
        };
        (self.status, Json(body)).into_response()
    }
}

// --- Handlers ---

async fn submit_report(
    State(state): State<AppState>,
    payload: Result<Json<ReportCandidate>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(candidate) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;

    match state.engine.submit(candidate).await {
        Ok(submission) => Ok((StatusCode::CREATED, Json(submission)).into_response()),
        Err(e) => {
            match &e {
                SubmitError::Validation(_) => {}
                SubmitError::Contention { attempts } => {
                    warn!(attempts, "Report rejected under contention")
                }
                _ => error!(error = %e, "Report failed"),
            }
            Err(e.into())
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct HazardsQuery {
    lat: Option<f64>,
    lng: Option<f64>,
    radius_m: Option<f64>,
}

#[derive(Debug, Serialize)]
struct HazardsResponse {
    hazards: Vec<VerifiedHazard>,
}

async fn list_hazards(
    State(state): State<AppState>,
    Query(query): Query<HazardsQuery>,
) -> Result<Response, ApiError> {
    let hazards = match (query.lat, query.lng) {
        (None, None) => state.engine.verified_hazards().as_ref().clone(),
        (Some(lat), Some(lng)) => {
            let point = GeoPoint::new(lat, lng);
            if !point.is_valid() {
                return Err(ApiError::bad_request(format!(
                    "invalid coordinate ({}, {})",
                    lat, lng
                )));
            }
            let radius_m = query
                .radius_m
                .unwrap_or(state.engine.config().nearby_radius_m);
            if !radius_m.is_finite() || radius_m < 0.0 {
                return Err(ApiError::bad_request(format!(
                    "invalid radius_m {}",
                    radius_m
                )));
            }
            state.engine.verified_near(point, radius_m)
        }
        _ => return Err(ApiError::bad_request("lat and lng must be given together")),
    };

    Ok(Json(HazardsResponse { hazards }).into_response())
}

async fn cluster_detail(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = Uuid::parse_str(&id)
        .map_err(|_| ApiError::bad_request(format!("invalid cluster id {}", id)))?;

    match state.engine.cluster(id)? {
        Some(cluster) => Ok(Json(cluster.summary()).into_response()),
        None => Err(ApiError {
            status: StatusCode::NOT_FOUND,
            message: format!("cluster {} not found", id),
            retryable: false,
        }),
    }
}

async fn health() -> &'static str {
    "ok"
}
