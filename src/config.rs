use std::path::{Path, PathBuf};

use tokio::time::Duration;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";
const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;
const DEFAULT_RATE_LIMIT_MAX_REQUESTS: usize = 10;
const DEFAULT_RATE_LIMIT_WINDOW_HOURS: i64 = 24;
const DEFAULT_RETRY_MAX_ATTEMPTS: usize = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_CACHE_TTL_HOURS: i64 = 24;
const DEFAULT_SWEEP_MAX_AGE_MINUTES: u64 = 2 * 60;
const DEFAULT_SWEEP_INTERVAL_MINUTES: u64 = 15;
const DEFAULT_YT_DLP_TIMEOUT_SECONDS: u64 = 180;
const DEFAULT_REMUX_TIMEOUT_SECONDS: u64 = 300;
const DEFAULT_COOKIES_FILE: &str = "youtube_cookies.txt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieSource {
    None,
    Browser {
        browser: String,
        profile: Option<String>,
    },
    File(PathBuf),
}

impl CookieSource {
    pub fn describe(&self) -> Option<String> {
        match self {
            Self::None => None,
            Self::Browser { browser, profile } => Some(match profile {
                Some(profile) => format!("browser:{browser}:{profile}"),
                None => format!("browser:{browser}"),
            }),
            Self::File(path) => Some(path.to_string_lossy().into_owned()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub download_dir: PathBuf,
    pub max_concurrent_downloads: usize,
    pub trust_proxy_headers: bool,
    pub allowed_origins: Vec<String>,
    pub rate_limit_max_requests: usize,
    pub rate_limit_window: chrono::Duration,
    pub retry_max_attempts: usize,
    pub retry_base_delay: Duration,
    pub cache_ttl: chrono::Duration,
    pub sweep_max_age: Duration,
    pub sweep_interval: Duration,
    pub yt_dlp_bin: String,
    pub ffmpeg_bin: String,
    pub yt_dlp_timeout: Duration,
    pub remux_timeout: Duration,
    pub cookies: CookieSource,
}

impl Config {
    pub fn from_env() -> Self {
        let download_dir = non_empty_env("DOWNLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("downloads"));

        Self {
            bind_addr: resolve_bind_addr(),
            download_dir,
            max_concurrent_downloads: read_usize_env("MAX_CONCURRENT_DOWNLOADS")
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_MAX_CONCURRENT_DOWNLOADS),
            trust_proxy_headers: read_bool_env("TRUST_PROXY_HEADERS").unwrap_or(false),
            allowed_origins: non_empty_env("ALLOWED_ORIGINS")
                .map(|value| {
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|origin| !origin.is_empty())
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            rate_limit_max_requests: read_usize_env("RATE_LIMIT_MAX_REQUESTS")
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_RATE_LIMIT_MAX_REQUESTS),
            rate_limit_window: chrono::Duration::hours(
                read_u64_env("RATE_LIMIT_WINDOW_HOURS")
                    .filter(|value| *value > 0)
                    .and_then(|value| i64::try_from(value).ok())
                    .unwrap_or(DEFAULT_RATE_LIMIT_WINDOW_HOURS),
            ),
            retry_max_attempts: read_usize_env("RETRY_MAX_ATTEMPTS")
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_RETRY_MAX_ATTEMPTS),
            retry_base_delay: Duration::from_millis(
                read_u64_env("RETRY_BASE_DELAY_MS").unwrap_or(DEFAULT_RETRY_BASE_DELAY_MS),
            ),
            cache_ttl: chrono::Duration::hours(
                read_u64_env("CACHE_TTL_HOURS")
                    .filter(|value| *value > 0)
                    .and_then(|value| i64::try_from(value).ok())
                    .unwrap_or(DEFAULT_CACHE_TTL_HOURS),
            ),
            sweep_max_age: Duration::from_secs(
                60 * read_u64_env("SWEEP_MAX_AGE_MINUTES")
                    .filter(|value| *value > 0)
                    .unwrap_or(DEFAULT_SWEEP_MAX_AGE_MINUTES),
            ),
            sweep_interval: Duration::from_secs(
                60 * read_u64_env("SWEEP_INTERVAL_MINUTES")
                    .filter(|value| *value > 0)
                    .unwrap_or(DEFAULT_SWEEP_INTERVAL_MINUTES),
            ),
            yt_dlp_bin: non_empty_env("YT_DLP_BIN").unwrap_or_else(|| "yt-dlp".to_string()),
            ffmpeg_bin: non_empty_env("FFMPEG_BIN").unwrap_or_else(|| "ffmpeg".to_string()),
            yt_dlp_timeout: Duration::from_secs(
                read_u64_env("YT_DLP_TIMEOUT_SECONDS")
                    .filter(|value| *value > 0)
                    .unwrap_or(DEFAULT_YT_DLP_TIMEOUT_SECONDS),
            ),
            remux_timeout: Duration::from_secs(
                read_u64_env("REMUX_TIMEOUT_SECONDS")
                    .filter(|value| *value > 0)
                    .unwrap_or(DEFAULT_REMUX_TIMEOUT_SECONDS),
            ),
            cookies: resolve_cookie_source(
                non_empty_env("YTDLP_COOKIES_FROM_BROWSER").as_deref(),
                &non_empty_env("COOKIES_FILE")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_COOKIES_FILE)),
            ),
        }
    }
}

/// Browser cookies win over a cookies file; the file is only used when it exists.
pub fn resolve_cookie_source(from_browser: Option<&str>, cookies_file: &Path) -> CookieSource {
    if let Some(value) = from_browser.and_then(non_empty) {
        let mut parts = value.splitn(2, ':');
        let browser = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
        let profile = parts.next().and_then(non_empty).map(ToString::to_string);
        return CookieSource::Browser { browser, profile };
    }

    if cookies_file.is_file() {
        CookieSource::File(cookies_file.to_path_buf())
    } else {
        CookieSource::None
    }
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = non_empty_env("APP_ADDR") {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
}

fn read_bool_env(name: &str) -> Option<bool> {
    parse_bool(&std::env::var(name).ok()?)
}

fn read_usize_env(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
}

fn read_u64_env(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
