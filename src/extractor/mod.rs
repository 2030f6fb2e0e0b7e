mod disguise;
mod ytdlp;

use std::{
    fmt,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::Deserialize;

use crate::normalize::CanonicalUrl;

pub use disguise::{ClientDisguisePolicy, RotatingDisguise};
pub use ytdlp::{YtDlp, YtDlpConfig};

/// Virtual client profile the extractor presents to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientIdentity {
    #[default]
    Default,
    Mobile,
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Mobile => write!(f, "mobile"),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct VideoInfo {
    pub id: Option<String>,
    pub title: Option<String>,
    #[serde(default)]
    pub formats: Vec<RawFormat>,
    #[serde(default)]
    pub entries: Vec<VideoInfo>,
}

impl VideoInfo {
    /// Playlist payloads collapse to their first entry.
    pub fn into_single(mut self) -> Self {
        if self.formats.is_empty() && !self.entries.is_empty() {
            return self.entries.swap_remove(0).into_single();
        }
        self
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawFormat {
    pub format_id: Option<String>,
    pub ext: Option<String>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub filesize: Option<f64>,
    pub filesize_approx: Option<f64>,
}

impl RawFormat {
    pub fn has_video(&self) -> bool {
        matches!(self.vcodec.as_deref(), Some(value) if value != "none")
    }

    pub fn has_audio(&self) -> bool {
        matches!(self.acodec.as_deref(), Some(value) if value != "none")
    }
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: CanonicalUrl,
    pub expression: String,
    /// Output path template; `%(ext)s` and friends are expanded by the extractor.
    pub output_template: PathBuf,
    pub merge_into: Option<String>,
    pub extract_audio: Option<String>,
    pub client: ClientIdentity,
}

impl FetchRequest {
    pub fn new(url: &CanonicalUrl, expression: impl Into<String>, output_template: &Path) -> Self {
        Self {
            url: url.clone(),
            expression: expression.into(),
            output_template: output_template.to_path_buf(),
            merge_into: None,
            extract_audio: None,
            client: ClientIdentity::Default,
        }
    }

    pub fn merge_into(mut self, container: impl Into<String>) -> Self {
        self.merge_into = Some(container.into());
        self
    }

    pub fn extract_audio(mut self, codec: impl Into<String>) -> Self {
        self.extract_audio = Some(codec.into());
        self
    }

    pub fn client(mut self, client: ClientIdentity) -> Self {
        self.client = client;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractorError {
    #[error("host returned no data or blocked the request: {0}")]
    Blocked(String),
    #[error("merging streams failed: {0}")]
    Merge(String),
    #[error("network failure: {0}")]
    Network(String),
    #[error("{0} is not installed")]
    ToolMissing(String),
    #[error("extractor timed out after {0}s")]
    Timeout(u64),
    #[error("could not parse extractor metadata: {0}")]
    Parse(String),
    #[error("extractor failed: {0}")]
    Failed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ExtractorError {
    /// Classifies the last meaningful stderr line of a failed run.
    pub fn from_stderr(stderr: &[u8]) -> Self {
        let message = String::from_utf8_lossy(stderr)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .next_back()
            .unwrap_or("extractor exited without diagnostics")
            .to_string();
        let lower = message.to_ascii_lowercase();

        if lower.contains("sign in to confirm")
            || lower.contains("not a bot")
            || lower.contains("http error 403")
            || lower.contains("http error 429")
            || lower.contains("nonetype")
            || lower.contains("login required")
        {
            Self::Blocked(message)
        } else if lower.contains("ffmpeg")
            || lower.contains("merging")
            || lower.contains("merger")
            || lower.contains("postprocessing")
        {
            Self::Merge(message)
        } else if lower.contains("timed out")
            || lower.contains("connection reset")
            || lower.contains("temporary failure in name resolution")
            || lower.contains("network is unreachable")
            || lower.contains("unable to download webpage")
        {
            Self::Network(message)
        } else {
            Self::Failed(message)
        }
    }

    pub fn is_merge_failure(&self) -> bool {
        matches!(self, Self::Merge(_))
    }
}

#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Metadata-only query; no media bytes are transferred.
    async fn probe(
        &self,
        url: &CanonicalUrl,
        client: ClientIdentity,
    ) -> Result<VideoInfo, ExtractorError>;

    /// Downloads according to `request` and returns the path the extractor wrote.
    async fn fetch(&self, request: &FetchRequest) -> Result<PathBuf, ExtractorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_classification() {
        let blocked = ExtractorError::from_stderr(
            b"WARNING: something\nERROR: [youtube] x: Sign in to confirm you're not a bot\n",
        );
        assert!(matches!(blocked, ExtractorError::Blocked(_)));

        let merge = ExtractorError::from_stderr(
            b"ERROR: Postprocessing: ffmpeg exited with code 1\n\n",
        );
        assert!(merge.is_merge_failure());

        let network = ExtractorError::from_stderr(b"ERROR: Read timed out.");
        assert!(matches!(network, ExtractorError::Network(_)));

        let other = ExtractorError::from_stderr(b"");
        assert!(matches!(other, ExtractorError::Failed(_)));
    }

    #[test]
    fn playlist_payload_collapses_to_first_entry() {
        let info: VideoInfo = serde_json::from_str(
            r#"{"title":"list","entries":[{"id":"a","title":"first","formats":[{"format_id":"18"}]},{"id":"b"}]}"#,
        )
        .unwrap();

        let single = info.into_single();
        assert_eq!(single.id.as_deref(), Some("a"));
        assert_eq!(single.formats.len(), 1);
    }
}
