use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use axum::{
    Json, Router,
    extract::{Path as UrlPath, State, rejection::JsonRejection},
    http::Uri,
    response::{Html, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    config::{DeliveryMode, Settings},
    error::ApiError,
    extractor::{Extracted, ExtractionJob, Extractor},
    quality::Quality,
    sessions::{Session, SessionStore},
    transfer,
};

const INDEX_HTML: &str = include_str!("../assets/index.html");
const COMPLETED_MESSAGE: &str = "Download completed!";

#[derive(Clone)]
pub struct AppState {
    sessions: SessionStore,
    extractor: Arc<dyn Extractor>,
    download_semaphore: Arc<Semaphore>,
    delivery: DeliveryMode,
    download_dir: PathBuf,
    static_dir: PathBuf,
}

impl AppState {
    pub fn new(settings: &Settings, extractor: Arc<dyn Extractor>) -> Self {
        Self {
            sessions: SessionStore::new(),
            extractor,
            download_semaphore: Arc::new(Semaphore::new(settings.max_concurrent_downloads)),
            delivery: settings.delivery,
            download_dir: settings.download_dir.clone(),
            static_dir: settings.static_dir.clone(),
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }
}

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    url: String,
    #[serde(default)]
    quality: Quality,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct DownloadResponse {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    filename: Option<String>,
}

impl DownloadResponse {
    fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            session_id: None,
            title: None,
            filename: None,
        }
    }

    fn completed(session_id: Option<String>, title: String, filename: String) -> Self {
        Self {
            success: true,
            message: COMPLETED_MESSAGE.to_string(),
            session_id,
            title: Some(title),
            filename: Some(filename),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/index.html", get(index))
        .route("/download", post(start_download))
        .route("/get_file/{session_id}", get(get_file))
        .fallback(static_fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// Runs one extraction to completion. Engine failures are reported in the
/// body with a 200 status; only an unreadable request is a 4xx.
async fn start_download(
    State(state): State<AppState>,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> Result<Json<DownloadResponse>, ApiError> {
    let Json(payload) = payload.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;

    let url = payload.url.trim();
    if let Err(message) = check_url(url) {
        return Ok(Json(DownloadResponse::failure(message)));
    }

    let job = ExtractionJob {
        url: url.to_string(),
        format: payload.quality.format_selector(),
        output_dir: state.download_dir.join(Uuid::new_v4().to_string()),
    };
    info!(
        "download requested for {} at quality {}",
        job.url,
        payload.quality.wire_value()
    );

    // Detached so a client hanging up does not abort a half-finished job.
    let task = tokio::spawn(run_download(state, job));
    let response = task.await.unwrap_or_else(|join_error| {
        error!("download task failed: {join_error}");
        DownloadResponse::failure("The download stopped unexpectedly.")
    });

    Ok(Json(response))
}

fn check_url(url: &str) -> Result<(), String> {
    if url.is_empty() {
        return Err("Please enter a video URL.".to_string());
    }
    match Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some() => {
            Ok(())
        }
        _ => Err(format!("Unsupported URL: {url}")),
    }
}

async fn run_download(state: AppState, job: ExtractionJob) -> DownloadResponse {
    let Ok(_permit) = state.download_semaphore.clone().acquire_owned().await else {
        return DownloadResponse::failure("The server is not accepting downloads.");
    };

    if let Err(error) = tokio::fs::create_dir_all(&job.output_dir).await {
        warn!("could not create {:?}: {error}", job.output_dir);
        return DownloadResponse::failure(format!("Could not prepare the download folder: {error}"));
    }

    match state.extractor.extract(&job).await {
        Ok(extracted) => match state.delivery {
            DeliveryMode::Remote => register_session(&state, &job, extracted).await,
            DeliveryMode::Local => keep_local_copy(&state, &job, extracted).await,
        },
        Err(error) => {
            warn!("extraction failed for {}: {error}", job.url);
            transfer::cleanup_job_dir(&job.output_dir).await;
            DownloadResponse::failure(error.into_message())
        }
    }
}

async fn register_session(state: &AppState, job: &ExtractionJob, extracted: Extracted) -> DownloadResponse {
    let filename = display_name(&extracted.file_path);
    let session = Session::new(extracted.file_path, job.output_dir.clone(), extracted.title.clone());
    let session_id = state.sessions.put(session).await;
    info!("{:?} ready as session {session_id}", extracted.title);

    DownloadResponse::completed(Some(session_id), extracted.title, filename)
}

/// Moves the produced file out of its job directory into the download
/// directory and reports the final path. A file already saved under the same
/// name is kept as is, the way yt-dlp skips videos it has already downloaded.
async fn keep_local_copy(state: &AppState, job: &ExtractionJob, extracted: Extracted) -> DownloadResponse {
    let target = state.download_dir.join(display_name(&extracted.file_path));

    if tokio::fs::try_exists(&target).await.unwrap_or(false) {
        info!("{target:?} has already been downloaded, keeping the existing file");
        transfer::cleanup_job_dir(&job.output_dir).await;
        return DownloadResponse::completed(None, extracted.title, target.to_string_lossy().into_owned());
    }

    let saved = match tokio::fs::rename(&extracted.file_path, &target).await {
        Ok(()) => {
            transfer::cleanup_job_dir(&job.output_dir).await;
            target
        }
        Err(error) => {
            warn!(
                "could not move {:?} to {:?}, leaving it in place: {error}",
                extracted.file_path, target
            );
            extracted.file_path
        }
    };
    info!("{:?} saved to {:?}", extracted.title, saved);

    DownloadResponse::completed(None, extracted.title, saved.to_string_lossy().into_owned())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download.bin".to_string())
}

async fn get_file(
    State(state): State<AppState>,
    UrlPath(session_id): UrlPath<String>,
) -> Result<Response, ApiError> {
    let session = state
        .sessions
        .take(&session_id)
        .await
        .ok_or_else(ApiError::session_expired)?;
    info!("session {session_id} claimed");

    transfer::attachment_response(session).await
}

async fn static_fallback(State(state): State<AppState>, uri: Uri) -> Result<Response, ApiError> {
    transfer::static_file_response(&state.static_dir, uri.path()).await
}
