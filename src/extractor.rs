//! Bridge to the external media extraction engine.
//!
//! The server never looks inside a download: it hands yt-dlp a URL, a format
//! selector and a scratch directory, then picks up whatever file comes out.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::{process::Command, time::timeout};
use tracing::{debug, warn};

use crate::config::Settings;

/// Container every download is merged into; Matroska keeps embedded subtitles.
pub const MERGE_OUTPUT_FORMAT: &str = "mkv";
const OUTPUT_TEMPLATE: &str = "%(title).140B-%(id)s.%(ext)s";
const PRINTED_RECORD: &str = "after_move:%(.{title,filepath})j";
const UNSUPPORTED_URL_MESSAGE: &str = "This URL is not supported or is not a valid video link.";
const SIDECAR_EXTENSIONS: [&str; 9] = [
    "part", "ytdl", "vtt", "srt", "ass", "json", "description", "temp", "lrc",
];

#[derive(Debug, Clone)]
pub struct ExtractionJob {
    pub url: String,
    pub format: &'static str,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub file_path: PathBuf,
    pub title: String,
}

/// Anything that went wrong inside the engine. The message is shown to the
/// user verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionError {
    message: String,
}

impl ExtractionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn into_message(self) -> String {
        self.message
    }
}

impl std::fmt::Display for ExtractionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ExtractionError {}

#[async_trait]
pub trait Extractor: Send + Sync {
    /// Downloads `job.url` into `job.output_dir` and reports the final file.
    async fn extract(&self, job: &ExtractionJob) -> Result<Extracted, ExtractionError>;
}

#[derive(Debug, Deserialize)]
struct PrintedRecord {
    title: Option<String>,
    filepath: Option<String>,
}

/// Runs the `yt-dlp` executable as a child process.
#[derive(Debug, Clone)]
pub struct YtDlp {
    command: Vec<String>,
    subtitle_langs: Vec<String>,
    timeout: Option<Duration>,
}

impl YtDlp {
    pub fn new(command: Vec<String>, subtitle_langs: Vec<String>, timeout: Option<Duration>) -> Self {
        Self {
            command,
            subtitle_langs,
            timeout,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.yt_dlp_command.clone(),
            settings.subtitle_langs.clone(),
            settings.extraction_timeout,
        )
    }

    fn build_args(&self, job: &ExtractionJob) -> Vec<String> {
        let output_template = job.output_dir.join(OUTPUT_TEMPLATE);

        let mut args = vec![
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--newline".to_string(),
            "-f".to_string(),
            job.format.to_string(),
            "--merge-output-format".to_string(),
            MERGE_OUTPUT_FORMAT.to_string(),
        ];

        if !self.subtitle_langs.is_empty() {
            args.extend([
                "--write-subs".to_string(),
                "--write-auto-subs".to_string(),
                "--sub-langs".to_string(),
                self.subtitle_langs.join(","),
                "--embed-subs".to_string(),
            ]);
        }

        args.extend([
            "--print".to_string(),
            PRINTED_RECORD.to_string(),
            "-o".to_string(),
            output_template.to_string_lossy().into_owned(),
            "--".to_string(),
            job.url.clone(),
        ]);

        args
    }
}

#[async_trait]
impl Extractor for YtDlp {
    async fn extract(&self, job: &ExtractionJob) -> Result<Extracted, ExtractionError> {
        let (program, leading_args) = self
            .command
            .split_first()
            .ok_or_else(|| ExtractionError::new("No yt-dlp command is configured."))?;

        let args = self.build_args(job);
        debug!("running {program} {:?} {:?}", leading_args, args);

        let mut command = Command::new(program);
        command
            .args(leading_args)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = match self.timeout {
            Some(limit) => timeout(limit, command.output()).await.map_err(|_| {
                ExtractionError::new(format!(
                    "The download took longer than {} seconds and was stopped.",
                    limit.as_secs()
                ))
            })?,
            None => command.output().await,
        }
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                ExtractionError::new(format!(
                    "{program} is not installed. Install yt-dlp and restart the server."
                ))
            } else {
                ExtractionError::new(format!("Could not run {program}: {error}"))
            }
        })?;

        let record = parse_printed_record(&output.stdout);
        let printed_path = record.as_ref().and_then(|record| record.filepath.as_deref());
        let Some(file_path) = locate_output(&job.output_dir, printed_path).await else {
            return Err(if output.status.success() {
                ExtractionError::new("yt-dlp finished without producing a file.")
            } else {
                ExtractionError::new(failure_message(&output.stderr))
            });
        };

        if !output.status.success() {
            // Subtitle fetch/embed errors fail the run but still leave a usable video.
            warn!(
                "yt-dlp exited with {} but produced {:?}, keeping it: {}",
                output.status,
                file_path,
                failure_message(&output.stderr)
            );
        }

        let title = record
            .and_then(|record| record.title)
            .filter(|title| !title.trim().is_empty())
            .or_else(|| {
                file_path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .map(ToString::to_string)
            })
            .unwrap_or_else(|| "Unknown".to_string());

        Ok(Extracted { file_path, title })
    }
}

fn parse_printed_record(stdout: &[u8]) -> Option<PrintedRecord> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .rev()
        .find_map(|line| serde_json::from_str::<PrintedRecord>(line).ok())
}

/// Last stderr line, except for the common unsupported-site case.
fn failure_message(stderr: &[u8]) -> String {
    let message = String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp could not complete the download.")
        .to_string();

    if message.to_ascii_lowercase().contains("unsupported url") {
        UNSUPPORTED_URL_MESSAGE.to_string()
    } else {
        message
    }
}

fn is_sidecar(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .is_some_and(|ext| SIDECAR_EXTENSIONS.contains(&ext.as_str()))
}

/// Finds the produced media file. The printed path wins when it points inside
/// the job directory; otherwise the largest non-sidecar file is used.
async fn locate_output(job_dir: &Path, printed_path: Option<&str>) -> Option<PathBuf> {
    let canonical_job_dir = match tokio::fs::canonicalize(job_dir).await {
        Ok(path) => path,
        Err(error) => {
            warn!("could not resolve job directory {:?}: {error}", job_dir);
            return None;
        }
    };

    if let Some(printed) = printed_path
        && let Some(path) = accept_candidate(&canonical_job_dir, Path::new(printed)).await
    {
        return Some(path);
    }

    let mut entries = match tokio::fs::read_dir(job_dir).await {
        Ok(entries) => entries,
        Err(error) => {
            warn!("could not list job directory {:?}: {error}", job_dir);
            return None;
        }
    };

    let mut best: Option<(u64, PathBuf)> = None;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if is_sidecar(&path) {
            continue;
        }
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        if best.as_ref().is_none_or(|(size, _)| metadata.len() > *size) {
            best = Some((metadata.len(), path));
        }
    }

    match best {
        Some((_, path)) => accept_candidate(&canonical_job_dir, &path).await,
        None => None,
    }
}

async fn accept_candidate(canonical_job_dir: &Path, candidate: &Path) -> Option<PathBuf> {
    let metadata = tokio::fs::metadata(candidate).await.ok()?;
    if !metadata.is_file() {
        return None;
    }

    let canonical = tokio::fs::canonicalize(candidate).await.ok()?;
    if !canonical.starts_with(canonical_job_dir) {
        warn!("ignoring output outside the job directory: {:?}", canonical);
        return None;
    }

    Some(canonical)
}
