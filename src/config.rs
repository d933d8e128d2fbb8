use std::{path::PathBuf, time::Duration};

use tracing::warn;

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;
pub const DEFAULT_SUBTITLE_LANGS: [&str; 5] = ["en", "zh", "zh-Hans", "zh-Hant", "all"];
const DEFAULT_YT_DLP_BIN: &str = "yt-dlp";
const TEMP_DIR_NAME: &str = "video-downloader";

/// How a finished download reaches the user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// File is handed out once through `/get_file/{id}` and then deleted.
    #[default]
    Remote,
    /// File stays in the download directory; the response reports its path.
    Local,
}

impl DeliveryMode {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "remote" | "stream" => Some(Self::Remote),
            "local" | "keep" => Some(Self::Local),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::Local => "local",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub delivery: DeliveryMode,
    pub download_dir: PathBuf,
    pub static_dir: PathBuf,
    pub max_concurrent_downloads: usize,
    pub extraction_timeout: Option<Duration>,
    pub session_ttl: Option<Duration>,
    pub subtitle_langs: Vec<String>,
    /// Program plus leading arguments, e.g. `python3 -m yt_dlp`.
    pub yt_dlp_command: Vec<String>,
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds settings from an arbitrary variable source. Unparseable values
    /// are reported and replaced by their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| lookup(name).and_then(|value| non_empty(&value).map(str::to_string));

        let delivery = match read("DELIVERY_MODE") {
            Some(value) => DeliveryMode::parse(&value).unwrap_or_else(|| {
                warn!("DELIVERY_MODE={value:?} is not recognised, using remote delivery");
                DeliveryMode::Remote
            }),
            None => DeliveryMode::Remote,
        };

        let download_dir = read("DOWNLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| default_download_dir(delivery, read("HOME").or_else(|| read("USERPROFILE"))));

        let max_concurrent_downloads = match read_number::<usize>(&read, "MAX_CONCURRENT_DOWNLOADS") {
            Some(0) => {
                warn!("MAX_CONCURRENT_DOWNLOADS must be greater than zero, using default");
                DEFAULT_MAX_CONCURRENT_DOWNLOADS
            }
            Some(value) => value,
            None => DEFAULT_MAX_CONCURRENT_DOWNLOADS,
        };

        let subtitle_langs = read("SUBTITLE_LANGS")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|lang| !lang.is_empty())
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|langs| !langs.is_empty())
            .unwrap_or_else(|| DEFAULT_SUBTITLE_LANGS.iter().map(ToString::to_string).collect());

        Self {
            bind_addr: resolve_bind_addr(&read),
            delivery,
            download_dir,
            static_dir: read("STATIC_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from(".")),
            max_concurrent_downloads,
            extraction_timeout: read_seconds(&read, "EXTRACTION_TIMEOUT_SECONDS"),
            session_ttl: read_seconds(&read, "SESSION_TTL_SECONDS"),
            subtitle_langs,
            yt_dlp_command: read("YT_DLP_BIN")
                .map(|value| value.split_whitespace().map(ToString::to_string).collect())
                .unwrap_or_else(|| vec![DEFAULT_YT_DLP_BIN.to_string()]),
        }
    }
}

fn default_download_dir(delivery: DeliveryMode, home: Option<String>) -> PathBuf {
    match (delivery, home) {
        (DeliveryMode::Local, Some(home)) => PathBuf::from(home).join("Downloads").join("Videos"),
        _ => std::env::temp_dir().join(TEMP_DIR_NAME),
    }
}

fn resolve_bind_addr(read: &impl Fn(&str) -> Option<String>) -> String {
    if let Some(configured) = read("APP_ADDR") {
        return configured;
    }

    let port = read_number::<u16>(read, "PORT").unwrap_or(DEFAULT_PORT);
    format!("0.0.0.0:{port}")
}

fn read_number<T: std::str::FromStr>(read: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let value = read(name)?;
    match value.parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("{name}={value:?} is not a valid number, ignoring it");
            None
        }
    }
}

/// Zero disables the feature, same as leaving the variable unset.
fn read_seconds(read: &impl Fn(&str) -> Option<String>, name: &str) -> Option<Duration> {
    read_number::<u64>(read, name)
        .filter(|seconds| *seconds > 0)
        .map(Duration::from_secs)
}

pub fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
