use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;

pub mod cache;
pub mod config;
pub mod negotiate;
pub mod store;
pub mod transform;

use crate::cache::{etag_for_bytes, CachePolicy, DerivativeCache, Dimension, DiskCache};
use crate::config::{ImageFormat, ServerConfig};
use crate::negotiate::{negotiate, parse_accept};
use crate::store::OriginalStore;
use crate::transform::{canonicalize, ImageTranscoder, Transcoder};

#[derive(Error, Debug)]
pub enum ImageServerError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Not acceptable: {0}")]
    NotAcceptable(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Generation error: {0}")]
    GenerationError(String),
    #[error("Eviction error: {0}")]
    EvictionError(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Internal server error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, ImageServerError>;

impl ImageServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ImageServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ImageServerError::NotAcceptable(_) => StatusCode::NOT_ACCEPTABLE,
            ImageServerError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            ImageServerError::Conflict(_) => StatusCode::CONFLICT,
            ImageServerError::GenerationError(_)
            | ImageServerError::EvictionError(_)
            | ImageServerError::IoError(_)
            | ImageServerError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ImageServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            METRICS.errors.fetch_add(1, Ordering::Relaxed);
            tracing::error!(%status, error = %self, "Request failed");
        } else {
            tracing::debug!(%status, error = %self, "Request rejected");
        }

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        if matches!(self, ImageServerError::NotAcceptable(_)) {
            CachePolicy::no_cache().apply(&mut headers);
        }
        let body = match self {
            ImageServerError::NotAcceptable(msg) => msg,
            // Internal details stay in the logs.
            _ if status.is_server_error() => "Internal server error".to_string(),
            other => other.to_string(),
        };
        (status, headers, body).into_response()
    }
}

/// Shared state for all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub cache: Arc<DerivativeCache>,
    /// Output formats in priority order, limited to what the transcoder can encode.
    pub formats: Arc<Vec<ImageFormat>>,
}

impl AppState {
    pub fn new(config: ServerConfig, transcoder: Arc<dyn Transcoder>) -> Self {
        let store = OriginalStore::new(config.images_dir.clone(), config.original_extensions.clone());
        let disk = Arc::new(DiskCache::new(config.images_dir.clone()));
        let formats: Vec<ImageFormat> = config
            .output_formats
            .iter()
            .copied()
            .filter(|f| transcoder.supports(*f))
            .collect();
        let cache = DerivativeCache::new(store, disk, transcoder, config.quality);
        Self { config: Arc::new(config), cache: Arc::new(cache), formats: Arc::new(formats) }
    }
}

/// Public query parameters for derivative requests
#[derive(Debug, Deserialize)]
pub struct ImageQuery {
    // Kept as text so oversized values can clamp instead of failing to deserialize.
    #[serde(default)]
    pub w: Option<String>,
    #[serde(default)]
    pub h: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub name: String,
    pub original: String,
}

fn not_acceptable_message(formats: &[ImageFormat]) -> String {
    let names: Vec<&str> = formats.iter().map(|f| f.extension()).collect();
    format!(
        "Sorry, your client does not accept any image format this server produces ({}).\n\
         Please try another browser or update your browser to the latest version.\n",
        names.join(", ")
    )
}

async fn image_handler(
    State(state): State<AppState>,
    Path(image): Path<String>,
    Query(query): Query<ImageQuery>,
    headers: HeaderMap,
) -> Result<Response> {
    tracing::debug!("Processing image request: image={}, w={:?}, h={:?}", image, query.w, query.h);

    OriginalStore::validate_name(&image)?;
    let max = state.config.max_dimension;
    let width = Dimension::from_optional(query.w.as_deref(), max)?;
    let height = Dimension::from_optional(query.h.as_deref(), max)?;

    // 404 takes precedence over 406, and both come before any generation work.
    let original = state.cache.store().locate(&image).await?;

    let accept = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok());
    let format = negotiate(&parse_accept(accept), &state.formats)
        .ok_or_else(|| ImageServerError::NotAcceptable(not_acceptable_message(&state.formats)))?;

    let derivative = state.cache.fetch_original(&original, width, height, format).await?;
    match derivative.status {
        cache::CacheStatus::Hit => METRICS.cache_hits.fetch_add(1, Ordering::Relaxed),
        cache::CacheStatus::Miss => METRICS.cache_misses.fetch_add(1, Ordering::Relaxed),
    };

    let mut headers = HeaderMap::new();
    CachePolicy::for_derivatives(state.config.retention).apply(&mut headers);
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(format.content_type()));
    if let Ok(etag) = HeaderValue::from_str(&etag_for_bytes(&derivative.bytes)) {
        headers.insert(header::ETAG, etag);
    }
    headers.insert("x-cache", HeaderValue::from_static(derivative.status.as_str()));
    Ok((headers, Body::from(derivative.bytes)).into_response())
}

async fn upload_handler(State(state): State<AppState>, mut multipart: Multipart) -> Result<Response> {
    let mut upload: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ImageServerError::InvalidArgument(format!("invalid multipart: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| ImageServerError::InvalidArgument("file field has no filename".into()))?;
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ImageServerError::InvalidArgument(format!("invalid file: {}", e)))?;
        upload = Some((file_name, bytes.to_vec()));
        break;
    }

    let (file_name, bytes) = upload.ok_or_else(|| ImageServerError::InvalidArgument("missing file".into()))?;
    if bytes.len() > state.config.max_upload_size {
        return Err(ImageServerError::InvalidArgument("upload exceeds size limit".into()));
    }

    // Logical name is the file name minus its extension.
    let name = std::path::Path::new(&file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .unwrap_or_default();
    OriginalStore::validate_name(&name)?;
    if tokio::fs::try_exists(state.cache.store().image_dir(&name)).await.unwrap_or(false) {
        return Err(ImageServerError::Conflict(format!("image {:?} already exists", name)));
    }

    let canonical = state.config.canonical_format;
    let quality = state.config.quality;
    let encoded = tokio::task::spawn_blocking(move || canonicalize(&bytes, canonical, quality))
        .await
        .map_err(|e| ImageServerError::InternalError(e.to_string()))??;

    let original = state.cache.store().create_original(&name, encoded, canonical).await?;
    let file = original
        .path
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or_default()
        .to_string();

    let mut headers = HeaderMap::new();
    CachePolicy::no_cache().apply(&mut headers);
    let body = Json(UploadResponse { name: original.name, original: file });
    Ok((StatusCode::CREATED, headers, body).into_response())
}

async fn index_handler() -> Html<&'static str> {
    Html(
        "<!doctype html>\n<title>imageserver</title>\n\
         <img src=\"/images/cat\" style=\"margin-left:14%; margin-top:7%;\">\n",
    )
}

// ====================================================================================
// OBSERVABILITY
// ====================================================================================

/// Global metrics tracking
pub struct Metrics {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub generations: AtomicU64,
    pub errors: AtomicU64,
    pub evictions: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            generations: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static::lazy_static! {
    pub(crate) static ref METRICS: Metrics = Metrics::new();
}

/// Health check endpoint
async fn health_handler() -> impl IntoResponse {
    use serde_json::json;

    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "imageserver"
    }))
}

/// Metrics endpoint (Prometheus-compatible plain text)
async fn metrics_handler() -> impl IntoResponse {
    let counters = [
        ("imageserver_cache_hits_total", "Total number of derivative cache hits", &METRICS.cache_hits),
        ("imageserver_cache_misses_total", "Total number of derivative cache misses", &METRICS.cache_misses),
        ("imageserver_generations_total", "Total number of derivatives generated", &METRICS.generations),
        ("imageserver_errors_total", "Total number of failed requests", &METRICS.errors),
        ("imageserver_evictions_total", "Total number of derivatives removed by the janitor", &METRICS.evictions),
    ];

    let mut metrics = String::new();
    for (name, help, counter) in counters {
        metrics.push_str(&format!(
            "# HELP {name} {help}\n# TYPE {name} counter\n{name} {}\n",
            counter.load(Ordering::Relaxed)
        ));
    }

    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4")], metrics)
}

/// Builds the full router with the `image`-crate transcoder.
pub fn router(config: ServerConfig) -> Router {
    router_with_transcoder(config, Arc::new(ImageTranscoder))
}

/// Builds the full router around a caller-supplied transcoder.
pub fn router_with_transcoder(config: ServerConfig, transcoder: Arc<dyn Transcoder>) -> Router {
    // Multipart framing adds a little on top of the file itself.
    let body_limit = config.max_upload_size + 64 * 1024;
    let state = AppState::new(config, transcoder);

    tracing::info!(formats = ?state.formats, "Router configured");

    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/images/:image", get(image_handler))
        .route("/upload", post(upload_handler).layer(DefaultBodyLimit::max(body_limit)))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
