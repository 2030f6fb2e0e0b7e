use std::{
    collections::HashSet,
    io::ErrorKind,
    net::SocketAddr,
    path::Path,
    sync::{Arc, LazyLock},
};

use axum::{
    Form, Json, Router,
    body::Body,
    extract::{ConnectInfo, Query, State},
    http::{
        HeaderMap, HeaderName, HeaderValue, Method,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::{
    process::Command,
    sync::Semaphore,
    time::{Duration, timeout},
};
use tokio_util::io::ReaderStream;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    catalog::FormatOption,
    config::Config,
    error::ApiError,
    rate_limit::{RateLimiter, client_ip},
    service::{AUDIO_FORMATS, Downloader},
};

const VERSION_PROBE_TIMEOUT_SECONDS: u64 = 10;
const DOWNLOAD_FILENAME_HEADER: &str = "x-download-filename";

static JOB_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.+?)-[0-9a-f]{12}(?:\.(?:video|audio))?(\.[A-Za-z0-9]+)$").unwrap()
});

#[derive(Clone)]
pub struct AppState {
    pub downloader: Arc<Downloader>,
    pub rate_limiter: Arc<RateLimiter>,
    pub download_semaphore: Arc<Semaphore>,
    pub config: Arc<Config>,
}

#[derive(Debug, Deserialize)]
pub struct FormatsQuery {
    url: String,
}

#[derive(Debug, Deserialize)]
pub struct DownloadForm {
    url: String,
    #[serde(default = "default_format_code")]
    format_code: String,
}

#[derive(Debug, Deserialize)]
pub struct AudioForm {
    url: String,
    #[serde(default = "default_audio_format")]
    audio_format: String,
}

fn default_format_code() -> String {
    "best".to_string()
}

fn default_audio_format() -> String {
    "mp3".to_string()
}

#[derive(Debug, Serialize)]
pub struct FfmpegStatus {
    installed: bool,
    version: Option<String>,
    path: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DependencyReport {
    ffmpeg: FfmpegStatus,
    aria2c: bool,
    cookies: Option<String>,
    yt_dlp: Option<String>,
    downloads_dir: String,
}

pub fn router(state: AppState) -> Result<Router, ApiError> {
    let cors = build_cors_layer(&state.config.allowed_origins)?;

    Ok(Router::new()
        .route("/health", get(health))
        .route("/check-dependencies", get(check_dependencies))
        .route("/formats", get(formats))
        .route("/download", post(download))
        .route("/download-audio", post(download_audio))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http()))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn check_dependencies(State(state): State<AppState>) -> Json<DependencyReport> {
    let config = &state.config;
    let ffmpeg_path = which::which(&config.ffmpeg_bin).ok();
    let ffmpeg_version = match &ffmpeg_path {
        Some(path) => command_version(path, "-version").await,
        None => None,
    };
    let yt_dlp = match which::which(&config.yt_dlp_bin) {
        Ok(path) => command_version(&path, "--version").await,
        Err(_) => None,
    };

    Json(DependencyReport {
        ffmpeg: FfmpegStatus {
            installed: ffmpeg_path.is_some(),
            version: ffmpeg_version,
            path: ffmpeg_path.map(|path| path.to_string_lossy().into_owned()),
        },
        aria2c: which::which("aria2c").is_ok(),
        cookies: config.cookies.describe(),
        yt_dlp,
        downloads_dir: state
            .downloader
            .download_dir()
            .to_string_lossy()
            .into_owned(),
    })
}

async fn formats(
    State(state): State<AppState>,
    Query(query): Query<FormatsQuery>,
) -> Result<Json<Vec<FormatOption>>, ApiError> {
    let url = query.url.trim();
    if url.is_empty() {
        return Err(ApiError::bad_request("A video url is required."));
    }

    let catalog = state.downloader.formats(url).await;
    debug!("Listing {} format(s) for {url}", catalog.len());
    Ok(Json(catalog.options()))
}

async fn download(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Form(form): Form<DownloadForm>,
) -> Result<Response, ApiError> {
    let url = form.url.trim();
    if url.is_empty() {
        return Err(ApiError::bad_request("A video url is required."));
    }

    let client = client_ip(&headers, addr, state.config.trust_proxy_headers);
    state.rate_limiter.register(&client).await?;
    let _download_permit = state
        .download_semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| ApiError::internal("Could not reserve download capacity."))?;

    info!("Download requested by {client}: {url} [{}]", form.format_code);
    let path = state
        .downloader
        .download(url, &form.format_code)
        .await
        .map_err(|error| {
            warn!("Download of {url} failed: {error}");
            ApiError::retrieval_exhausted(error.cause())
        })?;

    stream_artifact(&path).await
}

async fn download_audio(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Form(form): Form<AudioForm>,
) -> Result<Response, ApiError> {
    let url = form.url.trim();
    if url.is_empty() {
        return Err(ApiError::bad_request("A video url is required."));
    }
    let audio_format = form.audio_format.trim().to_ascii_lowercase();
    if !AUDIO_FORMATS.contains(&audio_format.as_str()) {
        return Err(ApiError::bad_request(format!(
            "Unsupported audio format {audio_format:?}. Use one of: {}.",
            AUDIO_FORMATS.join(", ")
        )));
    }

    let client = client_ip(&headers, addr, state.config.trust_proxy_headers);
    state.rate_limiter.register(&client).await?;
    let _download_permit = state
        .download_semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| ApiError::internal("Could not reserve download capacity."))?;

    info!("Audio download requested by {client}: {url} [{audio_format}]");
    let path = state
        .downloader
        .download_audio(url, &audio_format)
        .await
        .map_err(|error| {
            warn!("Audio download of {url} failed: {error}");
            ApiError::retrieval_exhausted(error)
        })?;

    stream_artifact(&path).await
}

async fn stream_artifact(path: &Path) -> Result<Response, ApiError> {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(error) if error.kind() == ErrorKind::NotFound => {
            return Err(ApiError::artifact_missing(
                "The downloaded file is no longer available.",
            ));
        }
        Err(error) => {
            return Err(ApiError::internal(format!(
                "Could not open the downloaded file: {error}"
            )));
        }
    };
    let metadata = file
        .metadata()
        .await
        .map_err(|error| ApiError::internal(format!("Could not read file metadata: {error}")))?;

    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .map(download_name)
        .unwrap_or_else(|| "download.bin".to_string());

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_filename(&filename)),
    );
    headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&metadata.len().to_string())
            .map_err(|_| ApiError::internal("Could not build the content length header."))?,
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&filename))
            .map_err(|_| ApiError::internal("Could not build the content disposition header."))?,
    );
    headers.insert(
        HeaderName::from_static(DOWNLOAD_FILENAME_HEADER),
        HeaderValue::from_str(&sanitize_ascii_filename(&filename))
            .map_err(|_| ApiError::internal("Could not build the filename header."))?,
    );

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((headers, body).into_response())
}

/// On-disk names carry a job tag, `Title-<job>[.video].ext`; clients get
/// `Title.ext`.
fn download_name(file_name: &str) -> String {
    match JOB_SUFFIX.captures(file_name) {
        Some(captures) => format!("{}{}", &captures[1], &captures[2]),
        None => file_name.to_string(),
    }
}

/// First line of `<binary> <flag>`, or `None` if it cannot be run.
async fn command_version(binary: &Path, flag: &str) -> Option<String> {
    let mut command = Command::new(binary);
    command.arg(flag).kill_on_drop(true);

    let output = timeout(
        Duration::from_secs(VERSION_PROBE_TIMEOUT_SECONDS),
        command.output(),
    )
    .await
    .ok()?
    .ok()?;

    if !output.status.success() {
        return None;
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(ToString::to_string)
}

fn build_cors_layer(configured: &[String]) -> Result<CorsLayer, ApiError> {
    let origins = if configured.is_empty() {
        warn!("ALLOWED_ORIGINS is not set. Falling back to development origins.");
        vec![
            "http://127.0.0.1:5173".to_string(),
            "http://localhost:5173".to_string(),
        ]
    } else {
        configured.to_vec()
    };

    let normalized_origins = origins
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Invalid origin in ALLOWED_ORIGINS: {origin}. Expected e.g. https://example.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    let allowed_origins = Arc::new(normalized_origins);
    let allow_origin = AllowOrigin::predicate({
        let allowed_origins = Arc::clone(&allowed_origins);
        move |origin: &HeaderValue, _| {
            let normalized = origin.to_str().ok().and_then(normalize_origin);
            normalized
                .as_ref()
                .is_some_and(|value| allowed_origins.contains(value))
        }
    });
    info!(
        "CORS allow-list loaded with {} origin(s): {:?}",
        allowed_origins.len(),
        allowed_origins
    );

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers([
            CONTENT_DISPOSITION,
            HeaderName::from_static(DOWNLOAD_FILENAME_HEADER),
        ]))
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    match parsed.port() {
        Some(port) if port != default_port => Some(format!("{scheme}://{host}:{port}")),
        _ => Some(format!("{scheme}://{host}")),
    }
}

fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "wav" => "audio/wav",
        "opus" => "audio/ogg",
        "flac" => "audio/flac",
        _ => "application/octet-stream",
    }
}

fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized: String = value
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
        .collect();

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origins_normalise_default_ports_away() {
        assert_eq!(
            normalize_origin("HTTPS://Example.com:443/").as_deref(),
            Some("https://example.com")
        );
        assert_eq!(
            normalize_origin("http://localhost:5173").as_deref(),
            Some("http://localhost:5173")
        );
        assert_eq!(normalize_origin("https://example.com/app"), None);
        assert_eq!(normalize_origin("ftp://example.com"), None);
    }

    #[test]
    fn invalid_configured_origin_is_rejected() {
        assert!(build_cors_layer(&["not a url".to_string()]).is_err());
        assert!(build_cors_layer(&[]).is_ok());
    }

    #[test]
    fn content_disposition_keeps_utf8_and_ascii_fallback() {
        let header = build_content_disposition("Canción #1.mp4");
        assert_eq!(
            header,
            "attachment; filename=\"Canci_n _1.mp4\"; filename*=UTF-8''Canci%C3%B3n%20%231.mp4"
        );
        assert_eq!(sanitize_ascii_filename("///"), "___");
        assert_eq!(sanitize_ascii_filename("  "), "download.bin");
    }

    #[test]
    fn job_tag_is_hidden_from_download_name() {
        assert_eq!(download_name("My Clip-0123456789ab.mp4"), "My Clip.mp4");
        assert_eq!(download_name("My Clip-0123456789ab.video.webm"), "My Clip.webm");
        assert_eq!(download_name("a-b-fedcba987654.mp3"), "a-b.mp3");
        assert_eq!(download_name("plain.mp4"), "plain.mp4");
        assert_eq!(download_name("-0123456789ab.mp4"), "-0123456789ab.mp4");
    }

    #[test]
    fn content_type_follows_extension() {
        assert_eq!(content_type_for_filename("a.MP4"), "video/mp4");
        assert_eq!(content_type_for_filename("a.opus"), "audio/ogg");
        assert_eq!(content_type_for_filename("a"), "application/octet-stream");
    }

    #[tokio::test]
    async fn vanished_artifact_is_reported_missing() {
        let dir = tempfile::tempdir().unwrap();
        let error = stream_artifact(&dir.path().join("gone.mp4"))
            .await
            .unwrap_err();
        assert_eq!(error.status, axum::http::StatusCode::NOT_FOUND);
        assert_eq!(error.code, Some("ARTIFACT_MISSING"));
    }

    #[tokio::test]
    async fn artifact_streams_with_download_headers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip-0123456789ab.mp4");
        std::fs::write(&path, b"0123456789").unwrap();

        let response = stream_artifact(&path).await.unwrap();
        let headers = response.headers();
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "video/mp4");
        assert_eq!(headers.get(CONTENT_LENGTH).unwrap(), "10");
        assert_eq!(headers.get(DOWNLOAD_FILENAME_HEADER).unwrap(), "clip.mp4");
        assert_eq!(
            headers.get(CONTENT_DISPOSITION).unwrap(),
            "attachment; filename=\"clip.mp4\"; filename*=UTF-8''clip.mp4"
        );
    }
}
