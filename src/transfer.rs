use std::{
    io::ErrorKind,
    path::{Component, Path, PathBuf},
    pin::Pin,
    task::{Context, Poll},
    time::{Duration, SystemTime},
};

use axum::{
    body::{Body, Bytes},
    http::{
        HeaderMap, HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use futures_util::Stream;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{error::ApiError, sessions::Session};

/// Read size for outgoing file bodies.
pub const CHUNK_SIZE: usize = 8 * 1024;
const FALLBACK_FILENAME: &str = "download.bin";

/// Streams a claimed session's file as an attachment.
///
/// The job directory is unlinked as soon as the file is open, so a finished
/// session leaves nothing on disk even if the client never reads the body.
/// Platforms that refuse to delete open files get a second attempt once the
/// body is dropped.
pub async fn attachment_response(session: Session) -> Result<Response, ApiError> {
    let file = match File::open(&session.file_path).await {
        Ok(file) => file,
        Err(error) if error.kind() == ErrorKind::NotFound => {
            cleanup_job_dir(&session.job_dir).await;
            return Err(ApiError::file_missing());
        }
        Err(error) => {
            cleanup_job_dir(&session.job_dir).await;
            return Err(ApiError::internal(format!("Could not open the file: {error}")));
        }
    };

    let filename = session
        .file_path
        .file_name()
        .and_then(|name| name.to_str())
        .map(ToString::to_string)
        .unwrap_or_else(|| FALLBACK_FILENAME.to_string());

    // The session is already gone from the store, so every exit from here on
    // must leave the job directory removed.
    let mut guard = RemovalGuard::new(session.file_path, session.job_dir);
    guard.remove_now().await;

    let content_length = file
        .metadata()
        .await
        .map_err(|error| ApiError::internal(format!("Could not read file metadata: {error}")))?
        .len();

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(content_length));
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&filename))
            .map_err(|_| ApiError::internal("Could not build the download header."))?,
    );

    let stream = GuardedStream {
        inner: ReaderStream::with_capacity(file, CHUNK_SIZE),
        _guard: guard,
    };

    info!("streaming {filename:?} ({content_length} bytes)");
    Ok((headers, Body::from_stream(stream)).into_response())
}

/// Deletes a job's file and directory unless that already happened.
struct RemovalGuard {
    file_path: PathBuf,
    job_dir: PathBuf,
    removed: bool,
}

impl RemovalGuard {
    fn new(file_path: PathBuf, job_dir: PathBuf) -> Self {
        Self {
            file_path,
            job_dir,
            removed: false,
        }
    }

    async fn remove_now(&mut self) {
        match tokio::fs::remove_dir_all(&self.job_dir).await {
            Ok(()) => self.removed = true,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                self.removed = tokio::fs::try_exists(&self.file_path).await.ok() == Some(false);
            }
            Err(error) => debug!("deferring removal of {:?}: {error}", self.job_dir),
        }
    }
}

impl Drop for RemovalGuard {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(error) = std::fs::remove_file(&self.file_path)
            && error.kind() != ErrorKind::NotFound
        {
            warn!("could not remove {:?}: {error}", self.file_path);
        }
        if let Err(error) = std::fs::remove_dir_all(&self.job_dir)
            && error.kind() != ErrorKind::NotFound
        {
            warn!("could not remove {:?}: {error}", self.job_dir);
        }
    }
}

/// File body that owns the removal guard. `inner` is declared first so the
/// file handle is closed before the guard runs.
struct GuardedStream {
    inner: ReaderStream<File>,
    _guard: RemovalGuard,
}

impl Stream for GuardedStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let result = Pin::new(&mut self.inner).poll_next(cx);
        if let Poll::Ready(Some(Err(error))) = &result {
            warn!("file transfer aborted: {error}");
        }
        result
    }
}

/// Serves a file below `root` for any path without a dedicated route.
/// Directories resolve to their `index.html`.
pub async fn static_file_response(root: &Path, request_path: &str) -> Result<Response, ApiError> {
    let not_found = || ApiError::not_found("File not found");
    let mut target = resolve_static_path(root, request_path).ok_or_else(not_found)?;
    if tokio::fs::metadata(&target).await.map_err(|_| not_found())?.is_dir() {
        target = target.join("index.html");
    }

    let file = File::open(&target).await.map_err(|_| not_found())?;
    let metadata = file.metadata().await.map_err(|_| not_found())?;
    if !metadata.is_file() {
        return Err(not_found());
    }

    let filename = target
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_filename(filename)),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(metadata.len()));

    let body = Body::from_stream(ReaderStream::with_capacity(file, CHUNK_SIZE));
    Ok((headers, body).into_response())
}

/// Maps a URL path onto `root`, refusing anything that could climb out of it.
fn resolve_static_path(root: &Path, request_path: &str) -> Option<PathBuf> {
    let decoded = urlencoding::decode(request_path).ok()?;
    let relative = Path::new(decoded.trim_start_matches('/'));
    if relative
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return None;
    }
    Some(root.join(relative))
}

pub async fn cleanup_job_dir(job_dir: &Path) {
    if let Err(error) = tokio::fs::remove_dir_all(job_dir).await
        && error.kind() != ErrorKind::NotFound
    {
        warn!("could not remove job directory {:?}: {error}", job_dir);
    }
}

/// Removes job directories (UUID-named) under `download_dir` whose last
/// modification is at least `older_than` ago. Returns how many were removed.
pub async fn cleanup_stale_jobs(download_dir: &Path, older_than: Duration) -> usize {
    let mut entries = match tokio::fs::read_dir(download_dir).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("could not open {:?} for cleanup: {error}", download_dir);
            }
            return 0;
        }
    };

    let now = SystemTime::now();
    let mut removed = 0;

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                warn!("could not iterate {:?} for cleanup: {error}", download_dir);
                break;
            }
        };

        let path = entry.path();
        let is_job_dir = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| Uuid::parse_str(name).is_ok());
        if !is_job_dir {
            continue;
        }

        let metadata = match entry.metadata().await {
            Ok(metadata) if metadata.is_dir() => metadata,
            Ok(_) => continue,
            Err(error) => {
                warn!("could not read metadata of {:?}: {error}", path);
                continue;
            }
        };

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or(Duration::ZERO);
        if age < older_than {
            continue;
        }

        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => removed += 1,
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("could not remove stale job {:?}: {error}", path),
        }
    }

    removed
}

pub fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" => "text/javascript; charset=utf-8",
        "json" => "application/json",
        "txt" => "text/plain; charset=utf-8",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        "webp" => "image/webp",
        "mkv" => "video/x-matroska",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}

pub fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized = value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric()
                || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
            {
                character
            } else {
                '_'
            }
        })
        .collect::<String>();

    let compact = sanitized.trim();
    if compact.is_empty() {
        FALLBACK_FILENAME.to_string()
    } else {
        compact.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    fn job_with_file(root: &Path, name: &str, contents: &[u8]) -> Session {
        let job_dir = root.join(Uuid::new_v4().to_string());
        std::fs::create_dir_all(&job_dir).unwrap();
        let file_path = job_dir.join(name);
        std::fs::write(&file_path, contents).unwrap();
        Session::new(file_path, job_dir, "title".to_string())
    }

    #[test]
    fn content_disposition_keeps_unicode_in_extended_form() {
        let header = build_content_disposition("Café: día 1.mkv");
        assert_eq!(
            header,
            "attachment; filename=\"Caf__ d_a 1.mkv\"; filename*=UTF-8''Caf%C3%A9%3A%20d%C3%ADa%201.mkv"
        );
        assert_eq!(sanitize_ascii_filename("???"), "___");
        assert_eq!(sanitize_ascii_filename("   "), "download.bin");
    }

    #[test]
    fn content_types_follow_extension() {
        assert_eq!(content_type_for_filename("index.HTML"), "text/html; charset=utf-8");
        assert_eq!(content_type_for_filename("clip.mkv"), "video/x-matroska");
        assert_eq!(content_type_for_filename("README"), "application/octet-stream");
    }

    #[tokio::test]
    async fn attachment_streams_whole_file_and_removes_it() {
        let root = tempfile::tempdir().unwrap();
        let contents = (0..CHUNK_SIZE * 3 + 17).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        let session = job_with_file(root.path(), "clip.mkv", &contents);
        let (file_path, job_dir) = (session.file_path.clone(), session.job_dir.clone());

        let response = attachment_response(session).await.unwrap();
        let headers = response.headers().clone();
        assert_eq!(headers[CONTENT_TYPE], "application/octet-stream");
        assert_eq!(headers[CONTENT_LENGTH], contents.len().to_string().as_str());
        assert!(headers[CONTENT_DISPOSITION].to_str().unwrap().starts_with("attachment;"));

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), contents.as_slice());
        assert!(!file_path.exists());
        assert!(!job_dir.exists());
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let session = job_with_file(root.path(), "clip.mkv", b"x");
        std::fs::remove_file(&session.file_path).unwrap();
        let job_dir = session.job_dir.clone();

        let error = attachment_response(session).await.unwrap_err();
        assert_eq!(error.status(), axum::http::StatusCode::NOT_FOUND);
        assert_eq!(error.message(), "File not found");
        assert!(!job_dir.exists());
    }

    #[test]
    fn dropped_guard_removes_what_is_left() {
        let root = tempfile::tempdir().unwrap();
        let session = job_with_file(root.path(), "clip.mkv", b"x");
        let (file_path, job_dir) = (session.file_path.clone(), session.job_dir.clone());

        drop(RemovalGuard::new(session.file_path, session.job_dir));
        assert!(!file_path.exists());
        assert!(!job_dir.exists());
    }

    #[tokio::test]
    async fn job_dir_is_gone_before_the_body_is_read() {
        let root = tempfile::tempdir().unwrap();
        let session = job_with_file(root.path(), "clip.mkv", b"abc");
        let job_dir = session.job_dir.clone();

        let response = attachment_response(session).await.unwrap();
        assert!(!job_dir.exists());
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"abc");
    }

    #[test]
    fn static_paths_stay_under_root() {
        let root = Path::new("/srv/www");
        assert_eq!(
            resolve_static_path(root, "/css/site%20main.css"),
            Some(PathBuf::from("/srv/www/css/site main.css"))
        );
        assert_eq!(resolve_static_path(root, "/"), Some(PathBuf::from("/srv/www")));
        assert_eq!(resolve_static_path(root, "/../etc/passwd"), None);
        assert_eq!(resolve_static_path(root, "/a/%2e%2e/%2e%2e/etc"), None);
    }

    #[tokio::test]
    async fn static_files_are_served_with_their_type() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("docs")).unwrap();
        std::fs::write(root.path().join("docs/index.html"), b"<p>docs</p>").unwrap();
        std::fs::write(root.path().join("notes.txt"), b"hello").unwrap();

        let response = static_file_response(root.path(), "/notes.txt").await.unwrap();
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain; charset=utf-8");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"hello");

        let response = static_file_response(root.path(), "/docs").await.unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"<p>docs</p>");

        let missing = static_file_response(root.path(), "/nope.css").await.unwrap_err();
        assert_eq!(missing.status(), axum::http::StatusCode::NOT_FOUND);
        // No index.html at the top level.
        assert!(static_file_response(root.path(), "/").await.is_err());
    }

    #[tokio::test]
    async fn stale_cleanup_only_touches_job_directories() {
        let root = tempfile::tempdir().unwrap();
        let job = job_with_file(root.path(), "old.mkv", b"x");
        let unrelated = root.path().join("keep-me");
        std::fs::create_dir_all(&unrelated).unwrap();

        assert_eq!(cleanup_stale_jobs(root.path(), Duration::from_secs(3600)).await, 0);
        assert!(job.job_dir.exists());

        assert_eq!(cleanup_stale_jobs(root.path(), Duration::ZERO).await, 1);
        assert!(!job.job_dir.exists());
        assert!(unrelated.exists());
    }
}
