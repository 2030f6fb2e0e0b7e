mod cache;
mod catalog;
mod config;
mod error;
mod extractor;
mod normalize;
mod rate_limit;
mod remux;
mod retrieval;
mod retry;
mod routes;
mod selector;
mod service;
mod sweep;
#[cfg(test)]
mod testing;

use std::{net::SocketAddr, sync::Arc};

use tokio::{net::TcpListener, sync::Semaphore};
use tracing::{info, warn};

use crate::{
    config::Config,
    error::ApiError,
    extractor::{RotatingDisguise, YtDlp, YtDlpConfig},
    rate_limit::RateLimiter,
    remux::Ffmpeg,
    retry::RetryPolicy,
    routes::AppState,
    service::Downloader,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "vidrelay=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = Config::from_env();

    tokio::fs::create_dir_all(&config.download_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!(
                "Could not create download directory {:?}: {error}",
                config.download_dir
            ))
        })?;
    let download_dir = tokio::fs::canonicalize(&config.download_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!("Could not resolve download directory: {error}"))
        })?;

    let ffmpeg_location = which::which(&config.ffmpeg_bin).ok();
    match &ffmpeg_location {
        Some(path) => info!("Using ffmpeg at {:?}", path),
        None => warn!(
            "{} not found on PATH. Merging separate tracks will fail.",
            config.ffmpeg_bin
        ),
    }
    if which::which(&config.yt_dlp_bin).is_err() {
        warn!("{} not found on PATH. Downloads will fail.", config.yt_dlp_bin);
    }
    match config.cookies.describe() {
        Some(cookies) => info!("Using cookies from {cookies}"),
        None => info!("No cookies configured."),
    }
    if !config.trust_proxy_headers {
        warn!("TRUST_PROXY_HEADERS=false: rate limiting uses the socket address.");
    }

    let extractor = Arc::new(YtDlp::new(
        YtDlpConfig {
            binary: config.yt_dlp_bin.clone(),
            timeout: config.yt_dlp_timeout,
            ffmpeg_location,
            cookies: config.cookies.clone(),
        },
        Arc::new(RotatingDisguise),
    ));
    let remuxer = Arc::new(Ffmpeg::new(config.ffmpeg_bin.clone(), config.remux_timeout));
    let downloader = Downloader::new(
        extractor,
        remuxer,
        download_dir.clone(),
        RetryPolicy::new(config.retry_max_attempts, config.retry_base_delay),
        config.cache_ttl,
    );
    let rate_limiter = Arc::new(RateLimiter::new(
        config.rate_limit_max_requests,
        config.rate_limit_window,
    ));

    sweep::spawn_periodic_sweep(
        download_dir,
        config.sweep_max_age,
        config.sweep_interval,
        Arc::clone(&rate_limiter),
    );

    let addr = config.bind_addr.clone();
    let state = AppState {
        downloader: Arc::new(downloader),
        rate_limiter,
        download_semaphore: Arc::new(Semaphore::new(config.max_concurrent_downloads)),
        config: Arc::new(config),
    };
    let app = routes::router(state)?;

    let listener = TcpListener::bind(&addr).await.map_err(|error| {
        ApiError::internal(format!("Could not bind {addr}: {error}"))
    })?;

    info!("Listening on http://{addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}
