use crate::config::ApiConfig;
use crate::record_store::{ImageRecord, PointSource};
use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    extract::State,
    http::{Method, StatusCode},
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

const INDEX_HTML: &str = include_str!("../assets/index.html");

/// Issues time-limited upload URLs for new objects
#[async_trait]
pub trait UploadSigner: Send + Sync {
    async fn presign_put(&self, key: &str, expires_in: Duration) -> Result<String>;
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub points: Arc<dyn PointSource>,
    pub signer: Arc<dyn UploadSigner>,
    pub upload_url_expiry: Duration,
}

/// Map marker
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PointResponse {
    pub image_id: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl From<ImageRecord> for PointResponse {
    fn from(r: ImageRecord) -> Self {
        Self {
            image_id: r.image_id,
            latitude: r.latitude,
            longitude: r.longitude,
        }
    }
}

/// Upload URL request
#[derive(Debug, Deserialize)]
pub struct UploadUrlRequest {
    pub filename: String,
}

/// Upload URL response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadUrlResponse {
    /// Presigned PUT URL
    pub upload_url: String,
    /// Object key the upload will land under
    pub key: String,
    pub expires_at: DateTime<Utc>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let methods = [Method::GET, Method::POST, Method::OPTIONS];
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(methods)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(methods)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/", get(index))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/points", get(list_points))
        .route("/images", get(list_images))
        .route("/upload-url", post(create_upload_url))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn not_found() -> ApiError {
    api_error(StatusCode::NOT_FOUND, "Not Found", "NOT_FOUND")
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "geotag-processor"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.points.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

async fn scan(state: &AppState) -> Result<Vec<ImageRecord>, ApiError> {
    state.points.scan().await.map_err(|e| {
        error!(error = %e, "Failed to scan image records");
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to load image locations",
            "QUERY_ERROR",
        )
    })
}

/// Coordinates of every indexed image
#[instrument(skip(state))]
async fn list_points(
    State(state): State<AppState>,
) -> Result<Json<Vec<PointResponse>>, ApiError> {
    let records = scan(&state).await?;
    Ok(Json(records.into_iter().map(PointResponse::from).collect()))
}

/// Every indexed image, including where it is stored
#[instrument(skip(state))]
async fn list_images(State(state): State<AppState>) -> Result<Json<Vec<ImageRecord>>, ApiError> {
    Ok(Json(scan(&state).await?))
}

/// Presign a browser upload
#[instrument(skip(state))]
async fn create_upload_url(
    State(state): State<AppState>,
    Json(request): Json<UploadUrlRequest>,
) -> Result<Json<UploadUrlResponse>, ApiError> {
    let now = Utc::now();
    let key = upload_key(&request.filename, now)
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "Invalid filename", "INVALID_FILENAME"))?;

    let expiry = chrono::Duration::from_std(state.upload_url_expiry).map_err(|e| {
        error!(error = %e, "Upload URL expiry out of range");
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to generate upload URL",
            "PRESIGN_ERROR",
        )
    })?;

    let upload_url = state
        .signer
        .presign_put(&key, state.upload_url_expiry)
        .await
        .map_err(|e| {
            error!(error = %e, key = %key, "Failed to generate upload URL");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to generate upload URL",
                "PRESIGN_ERROR",
            )
        })?;

    info!(key = %key, "Issued upload URL");

    Ok(Json(UploadUrlResponse {
        upload_url,
        key,
        expires_at: now + expiry,
    }))
}

/// Object key for an uploaded file: `<unix seconds>-<filename>`.
///
/// Returns `None` for names that are empty or could escape the bucket prefix.
pub fn upload_key(filename: &str, now: DateTime<Utc>) -> Option<String> {
    let filename = filename.trim();
    if filename.is_empty()
        || filename.contains('/')
        || filename.contains('\\')
        || filename.contains("..")
    {
        return None;
    }
    Some(format!("{}-{}", now.timestamp(), filename))
}

/// Start the API server and serve until `shutdown` is cancelled
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting geotag API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}
