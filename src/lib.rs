//! Small web front-end for yt-dlp: paste a link, pick a quality, get the file.

pub mod config;
pub mod error;
pub mod extractor;
pub mod quality;
pub mod routes;
pub mod sessions;
pub mod transfer;

use std::{sync::Arc, time::Duration};

use tokio::{net::TcpListener, signal, task::JoinHandle};
use tracing::{info, warn};

use crate::{
    config::{DeliveryMode, Settings},
    error::ApiError,
    extractor::YtDlp,
    routes::AppState,
    sessions::SessionStore,
};

const MAX_SWEEP_PERIOD: Duration = Duration::from_secs(60);

pub async fn run(settings: Settings) -> Result<(), ApiError> {
    prepare_download_dir(&settings).await?;

    let state = AppState::new(&settings, Arc::new(YtDlp::from_settings(&settings)));

    match (settings.delivery, settings.session_ttl) {
        (DeliveryMode::Remote, Some(ttl)) => {
            info!("unclaimed downloads expire after {} seconds", ttl.as_secs());
            spawn_session_expiry(state.sessions().clone(), ttl);
        }
        (DeliveryMode::Remote, None) => {
            warn!("SESSION_TTL_SECONDS is not set: unclaimed downloads stay on disk until restart");
        }
        (DeliveryMode::Local, _) => {}
    }

    let app = routes::router(state);

    let listener = TcpListener::bind(&settings.bind_addr).await.map_err(|error| {
        ApiError::internal(format!("Could not bind {}: {error}", settings.bind_addr))
    })?;

    info!("Video downloader ready on http://{}", settings.bind_addr);
    info!(
        "delivery mode: {}, downloads go to {:?}",
        settings.delivery.as_str(),
        settings.download_dir
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

/// Creates the download directory. In remote mode it also removes job
/// directories from a previous run: sessions do not survive a restart, so
/// nothing could ever claim them. Local mode leaves the directory alone since
/// it holds the user's own files.
pub async fn prepare_download_dir(settings: &Settings) -> Result<(), ApiError> {
    tokio::fs::create_dir_all(&settings.download_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!(
                "Could not create download directory {:?}: {error}",
                settings.download_dir
            ))
        })?;

    if settings.delivery == DeliveryMode::Remote {
        let removed = transfer::cleanup_stale_jobs(&settings.download_dir, Duration::ZERO).await;
        if removed > 0 {
            info!("removed {removed} job director(ies) left over from a previous run");
        }
    }

    Ok(())
}

/// Periodically drops sessions older than `ttl` and deletes their files.
pub fn spawn_session_expiry(sessions: SessionStore, ttl: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ttl.min(MAX_SWEEP_PERIOD));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            for session in sessions.remove_expired(ttl).await {
                info!("session for {:?} expired unclaimed", session.title);
                transfer::cleanup_job_dir(&session.job_dir).await;
            }
        }
    })
}

async fn shutdown_signal() {
    if let Err(error) = signal::ctrl_c().await {
        warn!("could not install Ctrl+C handler: {error}");
    }
    info!("shutting down");
}
