use std::{io::ErrorKind, path::PathBuf, process::Output, sync::Arc};

use async_trait::async_trait;
use tokio::{
    process::Command,
    time::{Duration, timeout},
};
use tracing::debug;

use super::{
    ClientDisguisePolicy, ClientIdentity, Extractor, ExtractorError, FetchRequest, VideoInfo,
};
use crate::{config::CookieSource, normalize::CanonicalUrl};

const RETRIES: u32 = 15;
const FRAGMENT_RETRIES: u32 = 15;
const RETRY_SLEEP: &str = "exponential:1.5";
const SOCKET_TIMEOUT_SECONDS: u32 = 30;
const RATE_LIMIT: &str = "6M";
const HTTP_CHUNK_SIZE: &str = "4M";

#[derive(Clone)]
pub struct YtDlpConfig {
    pub binary: String,
    pub timeout: Duration,
    pub ffmpeg_location: Option<PathBuf>,
    pub cookies: CookieSource,
}

pub struct YtDlp {
    config: YtDlpConfig,
    disguise: Arc<dyn ClientDisguisePolicy>,
}

impl YtDlp {
    pub fn new(config: YtDlpConfig, disguise: Arc<dyn ClientDisguisePolicy>) -> Self {
        Self { config, disguise }
    }

    fn common_args(&self, client: ClientIdentity) -> Vec<String> {
        let mut args = vec![
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--no-check-certificate".to_string(),
            "--geo-bypass".to_string(),
            "--socket-timeout".to_string(),
            SOCKET_TIMEOUT_SECONDS.to_string(),
            "--retries".to_string(),
            RETRIES.to_string(),
            "--fragment-retries".to_string(),
            FRAGMENT_RETRIES.to_string(),
            "--retry-sleep".to_string(),
            RETRY_SLEEP.to_string(),
            "--user-agent".to_string(),
            self.disguise.user_agent(),
        ];

        for (name, value) in self.disguise.headers() {
            args.push("--add-header".to_string());
            args.push(format!("{name}:{value}"));
        }

        args.push("--extractor-args".to_string());
        args.push(format!(
            "youtube:player_client={}",
            self.disguise.player_clients(client).join(",")
        ));

        match &self.config.cookies {
            CookieSource::Browser { browser, profile } => {
                args.push("--cookies-from-browser".to_string());
                args.push(match profile {
                    Some(profile) => format!("{browser}:{profile}"),
                    None => browser.clone(),
                });
            }
            CookieSource::File(path) => {
                args.push("--cookies".to_string());
                args.push(path.to_string_lossy().into_owned());
            }
            CookieSource::None => {}
        }

        args
    }

    fn fetch_args(&self, request: &FetchRequest) -> Vec<String> {
        let mut args = self.common_args(request.client);
        args.extend([
            "--newline".to_string(),
            "--limit-rate".to_string(),
            RATE_LIMIT.to_string(),
            "--http-chunk-size".to_string(),
            HTTP_CHUNK_SIZE.to_string(),
            "--concurrent-fragments".to_string(),
            "1".to_string(),
            "--hls-prefer-ffmpeg".to_string(),
            "--print".to_string(),
            "after_move:filepath".to_string(),
            "-f".to_string(),
            request.expression.clone(),
            "-o".to_string(),
            request.output_template.to_string_lossy().into_owned(),
        ]);

        if let Some(location) = &self.config.ffmpeg_location {
            args.push("--ffmpeg-location".to_string());
            args.push(location.to_string_lossy().into_owned());
        }
        if let Some(container) = &request.merge_into {
            args.push("--merge-output-format".to_string());
            args.push(container.clone());
        }
        if let Some(codec) = &request.extract_audio {
            args.extend([
                "-x".to_string(),
                "--audio-format".to_string(),
                codec.clone(),
                "--audio-quality".to_string(),
                "0".to_string(),
                "--embed-metadata".to_string(),
            ]);
        }

        args.push(request.url.to_string());
        args
    }

    async fn run(&self, args: Vec<String>) -> Result<Output, ExtractorError> {
        debug!("{} {}", self.config.binary, args.join(" "));

        let command_future = Command::new(&self.config.binary)
            .args(args)
            .kill_on_drop(true)
            .output();
        let output = timeout(self.config.timeout, command_future)
            .await
            .map_err(|_| ExtractorError::Timeout(self.config.timeout.as_secs()))?
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    ExtractorError::ToolMissing(self.config.binary.clone())
                } else {
                    ExtractorError::Io(error)
                }
            })?;

        if !output.status.success() {
            return Err(ExtractorError::from_stderr(&output.stderr));
        }

        Ok(output)
    }
}

#[async_trait]
impl Extractor for YtDlp {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn probe(
        &self,
        url: &CanonicalUrl,
        client: ClientIdentity,
    ) -> Result<VideoInfo, ExtractorError> {
        let mut args = self.common_args(client);
        args.extend([
            "-J".to_string(),
            "--skip-download".to_string(),
            url.to_string(),
        ]);

        let output = self.run(args).await?;
        parse_metadata(&output.stdout)
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<PathBuf, ExtractorError> {
        let output = self.run(self.fetch_args(request)).await?;
        extract_printed_path(&output.stdout)
            .map(PathBuf::from)
            .ok_or_else(|| ExtractorError::Failed("extractor did not report an output path".into()))
    }
}

fn parse_metadata(stdout: &[u8]) -> Result<VideoInfo, ExtractorError> {
    let value: serde_json::Value =
        serde_json::from_slice(stdout).map_err(|error| ExtractorError::Parse(error.to_string()))?;
    if value.is_null() {
        return Err(ExtractorError::Blocked(
            "metadata query returned null (likely blocked or sign-in required)".into(),
        ));
    }

    let info: VideoInfo =
        serde_json::from_value(value).map_err(|error| ExtractorError::Parse(error.to_string()))?;
    Ok(info.into_single())
}

fn extract_printed_path(stdout: &[u8]) -> Option<String> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .map(ToString::to_string)
}
