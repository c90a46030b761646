#![forbid(unsafe_code)]

//! HTTP surface: the JSON API, the MP3 stream and the static front end.

use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State},
    http::{HeaderValue, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::error;

use crate::{
    config::Settings,
    download::DownloadOrchestrator,
    error::AppError,
    filename::content_disposition,
    probe::{ToolStatus, probe},
    reaper::Reaper,
    search::{SearchOrchestrator, SearchResult},
    tools::Toolbox,
};

const SEARCH_FAILED: &str = "Failed to search videos";
const DOWNLOAD_FAILED: &str = "Failed to download audio";
const AUDIO_MIME: &str = "audio/mpeg";

#[derive(Clone)]
pub struct AppState {
    pub search: SearchOrchestrator,
    pub downloads: DownloadOrchestrator,
    pub toolbox: Toolbox,
    pub www_root: Arc<PathBuf>,
}

impl AppState {
    pub fn new(settings: &Settings, toolbox: Toolbox) -> Self {
        let reaper = Reaper::new(settings.temp_dir.clone(), settings.retention);
        Self {
            search: SearchOrchestrator::new(toolbox.clone(), settings.max_search_results),
            downloads: DownloadOrchestrator::new(toolbox.clone(), reaper),
            toolbox,
            www_root: Arc::new(settings.www_root.clone()),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/search", get(search_videos))
        .route("/api/download", get(download_audio))
        .route("/health", get(health))
        .fallback(static_fallback)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    /// Maps a domain error to a response. Upstream details go to the log
    /// only; the client gets `failure` (plus a timeout marker).
    fn from_app(err: AppError, failure: &'static str) -> Self {
        match &err {
            AppError::Validation(message) => Self::bad_request(message.clone()),
            AppError::Configuration { tool } => {
                error!(tool, "{failure}: tool is not installed");
                Self::internal(err.to_string())
            }
            AppError::Upstream(upstream) => {
                error!(kind = upstream.kind(), error = %upstream, "{failure}");
                if upstream.is_timeout() {
                    Self::internal(format!("{failure} (timed out)"))
                } else {
                    Self::internal(failure)
                }
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Default, Deserialize)]
struct SearchParams {
    q: Option<String>,
}

async fn search_videos(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<Vec<SearchResult>>> {
    let query = params.q.unwrap_or_default();
    let results = state
        .search
        .search(&query)
        .await
        .map_err(|err| ApiError::from_app(err, SEARCH_FAILED))?;
    Ok(Json(results))
}

#[derive(Debug, Default, Deserialize)]
struct DownloadParams {
    id: Option<String>,
    url: Option<String>,
}

impl DownloadParams {
    /// `id` wins when both are given; `url` is accepted for older clients.
    fn identifier(self) -> String {
        self.id
            .filter(|id| !id.trim().is_empty())
            .or(self.url)
            .unwrap_or_default()
    }
}

async fn download_audio(
    State(state): State<AppState>,
    Query(params): Query<DownloadParams>,
) -> ApiResult<Response> {
    let identifier = params.identifier();
    let artifact = state
        .downloads
        .download(&identifier)
        .await
        .map_err(|err| ApiError::from_app(err, DOWNLOAD_FAILED))?;
    let file = artifact
        .open()
        .await
        .map_err(|err| ApiError::from_app(err.into(), DOWNLOAD_FAILED))?;
    let disposition = HeaderValue::from_str(&content_disposition(&artifact.filename))
        .map_err(|err| {
            error!(error = %err, filename = %artifact.filename, "unrepresentable filename");
            ApiError::internal(DOWNLOAD_FAILED)
        })?;
    let size = artifact.size;

    // The body owns the artifact; the file goes away once the body is dropped.
    let stream = ReaderStream::new(file).map(move |chunk| {
        let _held = &artifact;
        chunk
    });

    let mut response = Body::from_stream(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(AUDIO_MIME));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    headers.insert(header::CONTENT_DISPOSITION, disposition);
    Ok(response)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthReport {
    status: &'static str,
    dependencies: &'static str,
    extractor: ToolStatus,
    transcoder: ToolStatus,
    bin_dir: PathBuf,
    temp_dir: PathBuf,
    active_downloads: usize,
    checked_at: DateTime<Utc>,
}

async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    let status = probe(&state.toolbox).await;
    Json(HealthReport {
        status: "ok",
        dependencies: if status.all_present() {
            "installed"
        } else {
            "missing"
        },
        extractor: status.extractor,
        transcoder: status.transcoder,
        bin_dir: state.toolbox.bin_dir().to_path_buf(),
        temp_dir: state.downloads.temp_dir().to_path_buf(),
        active_downloads: state.downloads.in_flight(),
        checked_at: Utc::now(),
    })
}

async fn static_fallback(State(state): State<AppState>, req: Request<Body>) -> Response {
    let path = req.uri().path();
    if path == "/api" || path.starts_with("/api/") {
        return ApiError::not_found("endpoint not found").into_response();
    }

    match serve_www_path(&state.www_root, path).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn serve_www_path(root: &Path, request_path: &str) -> ApiResult<Response> {
    let target = resolve_www_path(root, request_path)?;
    match tokio::fs::metadata(&target).await {
        Ok(meta) if meta.is_dir() => stream_file(root.join("index.html")).await,
        Ok(_) => stream_file(target).await,
        Err(_) if should_fallback_to_index(request_path) => {
            stream_file(root.join("index.html")).await
        }
        Err(_) => Err(ApiError::not_found("file not found")),
    }
}

/// Only plain path segments are accepted, so `..` can never climb out of
/// the web root.
fn resolve_www_path(root: &Path, request_path: &str) -> ApiResult<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(root.join("index.html"));
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(root.join(candidate))
}

/// Client-side routes have no extension; missing assets do.
fn should_fallback_to_index(request_path: &str) -> bool {
    let trimmed = request_path.trim_start_matches('/');
    trimmed.is_empty() || Path::new(trimmed).extension().is_none()
}

async fn stream_file(path: PathBuf) -> ApiResult<Response> {
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let size = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?
        .len();
    let mime = MimeGuess::from_path(&path).first_or_octet_stream();

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    Ok(response)
}
