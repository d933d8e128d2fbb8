use video_downloader::config::Settings;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "video_downloader=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = video_downloader::run(Settings::from_env()).await {
        tracing::error!("server error: {error}");
        std::process::exit(1);
    }
}
