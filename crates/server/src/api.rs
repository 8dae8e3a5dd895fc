//! HTTP API for predictions, liveness and audit statistics

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use lifecycle_lib::{
    observability::ServiceMetrics,
    predictor::{PredictError, PredictionService},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

const PREDICT_ENDPOINT: &str = "predict";
const METRICS_ENDPOINT: &str = "metrics";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<PredictionService>,
}

impl AppState {
    pub fn new(service: Arc<PredictionService>) -> Self {
        Self { service }
    }
}

#[derive(Debug, Deserialize)]
pub struct PredictRequest {
    pub features: Vec<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PredictResponse {
    pub prediction: i64,
}

/// Error response for API handlers
pub enum ApiError {
    Predict(PredictError),
    BadRequest(String),
    Internal(String),
}

impl From<PredictError> for ApiError {
    fn from(e: PredictError) -> Self {
        ApiError::Predict(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::BadRequest(detail) | ApiError::Predict(PredictError::InvalidInput(detail)) => {
                (StatusCode::BAD_REQUEST, json!({ "detail": detail }))
            }
            ApiError::Predict(PredictError::Audit(e)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "detail": e.to_string(), "error": "audit_write_failed" }),
            ),
            ApiError::Predict(PredictError::Inference(detail)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "detail": detail, "error": "inference_failed" }),
            ),
            ApiError::Internal(detail) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "detail": detail, "error": "internal" }),
            ),
        };
        (status, Json(body)).into_response()
    }
}

/// Liveness
async fn root(State(state): State<AppState>) -> impl IntoResponse {
    let model = state.service.model();
    Json(json!({
        "message": "Prediction service is running",
        "model_type": model.artifact.model_type,
        "model_source": model.source.to_string(),
    }))
}

async fn predict(
    State(state): State<AppState>,
    payload: Result<Json<PredictRequest>, JsonRejection>,
) -> Result<Json<PredictResponse>, ApiError> {
    let start = Instant::now();
    let result = run_predict(&state, payload).await;
    state
        .service
        .metrics()
        .observe_request(PREDICT_ENDPOINT, start.elapsed().as_secs_f64());
    result
}

async fn run_predict(
    state: &AppState,
    payload: Result<Json<PredictRequest>, JsonRejection>,
) -> Result<Json<PredictResponse>, ApiError> {
    let Json(request) = payload.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;

    // Audit writes hit the filesystem and SQLite
    let service = state.service.clone();
    let prediction = tokio::task::spawn_blocking(move || service.predict(request.features))
        .await
        .map_err(|e| ApiError::Internal(format!("prediction task failed: {}", e)))??;

    Ok(Json(PredictResponse { prediction }))
}

/// Aggregate statistics over the audit store
async fn audit_metrics(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let start = Instant::now();

    let service = state.service.clone();
    let stats = tokio::task::spawn_blocking(move || service.stats())
        .await
        .map_err(|e| ApiError::Internal(format!("stats task failed: {}", e)))
        .and_then(|r| r.map_err(ApiError::from));

    state
        .service
        .metrics()
        .observe_request(METRICS_ENDPOINT, start.elapsed().as_secs_f64());

    if let Err(ApiError::Predict(e)) = &stats {
        error!(error = %e, "Failed to read audit statistics");
    }
    Ok(Json(stats?))
}

/// Prometheus text exposition
async fn prometheus_metrics(State(metrics): State<ServiceMetrics>) -> Response {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => ApiError::Internal(e.to_string()).into_response(),
    }
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/predict", post(predict))
        .route("/metrics", get(audit_metrics))
        .with_state(state)
}

/// Create the exporter router served on the metrics port
pub fn create_metrics_router(metrics: ServiceMetrics) -> Router {
    Router::new()
        .route("/metrics", get(prometheus_metrics))
        .with_state(metrics)
}

/// Serve `app` on `port` until the listener fails
pub async fn serve(name: &'static str, port: u16, app: Router) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    info!(server = name, addr = %addr, "Starting HTTP listener");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
