//! Admin HTTP API.

use axum::{
    extract::{Query, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use fleet_reconcile::{PassHealth, PassState};
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::controller::PassController;
use crate::error::FleetError;
use crate::reconciler::PassReport;
use crate::types::FlushMode;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    controller: PassController,
}

impl AppState {
    pub fn new(controller: PassController) -> Self {
        Self { controller }
    }
}

/// Create the admin router.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(Any);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .route("/reconcile", post(reconcile))
        .route("/runner/check", get(runner_check))
        .route("/runner/flush", post(runner_flush))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    detail: String,
}

/// Error returned by handlers.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code: code.into(),
                detail: detail.into(),
            },
        }
    }
}

impl From<FleetError> for ApiError {
    fn from(err: FleetError) -> Self {
        match err {
            FleetError::PlatformUnavailable(_) | FleetError::BackendUnreachable { .. } => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "upstream_unavailable", err.to_string())
            }
            other => Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

// =============================================================================
// Handlers
// =============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    service: String,
    version: String,
    timestamp: String,
}

async fn healthz() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "fleet-manager".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

#[derive(Serialize)]
struct StatusResponse<'a> {
    health: PassHealth,
    state: PassState,
    passes_completed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_pass: Option<&'a PassReport>,
}

async fn status(State(state): State<AppState>) -> Response {
    let last_pass = state.controller.last_report();
    Json(StatusResponse {
        health: last_pass.as_ref().map_or(PassHealth::Healthy, |r| r.health),
        state: state.controller.state(),
        passes_completed: state.controller.passes_completed(),
        last_pass: last_pass.as_deref(),
    })
    .into_response()
}

async fn reconcile(State(state): State<AppState>) -> impl IntoResponse {
    let outcome = state.controller.trigger("api");
    info!(outcome = ?outcome, "Reconciliation requested");
    StatusCode::ACCEPTED
}

async fn runner_check(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let info = state.controller.runner_info().await?;
    Ok(Json(info))
}

#[derive(Debug, Deserialize)]
struct FlushParams {
    #[serde(rename = "flush-busy", default)]
    flush_busy: bool,
}

async fn runner_flush(
    State(state): State<AppState>,
    Query(params): Query<FlushParams>,
) -> Result<impl IntoResponse, ApiError> {
    let mode = if params.flush_busy {
        FlushMode::Busy
    } else {
        FlushMode::Idle
    };
    let report = state.controller.flush(mode).await.map_err(|e| {
        warn!(error = %e, "Flush failed");
        ApiError::from(e)
    })?;
    Ok(Json(report))
}
