use std::{
    fmt,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    extractor::{ClientIdentity, Extractor, ExtractorError, FetchRequest},
    normalize::CanonicalUrl,
    remux::Remuxer,
};

const MERGE_CONTAINER: &str = "mp4";
const AUDIO_TRACK: &str = "bestaudio[ext=m4a]/bestaudio";
const SINGLE_STREAM: &str = "best[ext=mp4]/best";

/// What the caller asked for, after catalog resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatTarget {
    Best,
    Height(u32),
    Entry {
        format_id: String,
        height: Option<u32>,
        has_audio: bool,
    },
    /// Raw extractor format syntax, passed through untouched.
    Expression(String),
    /// A re-phrasing produced by `alternate`. Keeps the height ceiling so
    /// the separate-tracks video fetch still honours it.
    Alternate {
        expression: String,
        height: Option<u32>,
    },
}

impl FormatTarget {
    pub fn combined_expression(&self) -> String {
        match self {
            Self::Best => "bestvideo[ext=mp4]+bestaudio/best".to_string(),
            Self::Height(height) => format!(
                "bestvideo[height<={height}][ext=mp4]+bestaudio/best[height<={height}][ext=mp4]/best"
            ),
            Self::Entry {
                format_id,
                height,
                has_audio: true,
            } => match height {
                Some(height) => format!("{format_id}/best[height<={height}][ext=mp4]/best"),
                None => format!("{format_id}/best"),
            },
            Self::Entry {
                format_id,
                height,
                has_audio: false,
            } => match height {
                Some(height) => format!(
                    "{format_id}+bestaudio[ext=m4a]/{format_id}+bestaudio/bestvideo[height<={height}][ext=mp4]+bestaudio/best[height<={height}][ext=mp4]/best"
                ),
                None => format!("{format_id}+bestaudio[ext=m4a]/{format_id}+bestaudio/best"),
            },
            Self::Expression(expression) | Self::Alternate { expression, .. } => expression.clone(),
        }
    }

    pub fn video_expression(&self) -> String {
        match self {
            Self::Height(height) => {
                format!("bestvideo[height<={height}][ext=mp4]/bestvideo[height<={height}]")
            }
            Self::Entry {
                format_id,
                height: Some(height),
                ..
            } => format!("{format_id}/bestvideo[height<={height}][ext=mp4]"),
            Self::Entry {
                format_id,
                height: None,
                ..
            } => format_id.clone(),
            Self::Alternate {
                height: Some(height),
                ..
            } => format!("bestvideo[height<={height}]/best[height<={height}]"),
            Self::Best | Self::Expression(_) | Self::Alternate { height: None, .. } => {
                "bestvideo[ext=mp4]/bestvideo".to_string()
            }
        }
    }

    /// A differently-phrased request for roughly the same quality, used when
    /// the original phrasing keeps failing.
    pub fn alternate(&self) -> Self {
        match self {
            Self::Best => Self::Alternate {
                expression: "bestvideo+bestaudio/best".to_string(),
                height: None,
            },
            Self::Height(height)
            | Self::Entry {
                height: Some(height),
                ..
            }
            | Self::Alternate {
                height: Some(height),
                ..
            } => Self::Alternate {
                expression: format!(
                    "bestvideo[height<={height}]+bestaudio/best[height<={height}]"
                ),
                height: Some(*height),
            },
            Self::Entry { height: None, .. }
            | Self::Expression(_)
            | Self::Alternate { height: None, .. } => Self::Best,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    CombinedMux,
    SeparateTracks,
    SimplifiedSingleStream,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CombinedMux => write!(f, "combined-mux"),
            Self::SeparateTracks => write!(f, "separate-tracks"),
            Self::SimplifiedSingleStream => write!(f, "single-stream"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StrategyFailure {
    #[error(transparent)]
    Extractor(#[from] ExtractorError),
    #[error("artifact missing or empty: {0:?}")]
    ArtifactMissingOrEmpty(PathBuf),
    #[error("could not inspect artifact: {0}")]
    Io(#[from] std::io::Error),
}

impl StrategyFailure {
    fn implicates_merge(&self) -> bool {
        match self {
            Self::Extractor(error) => error.is_merge_failure(),
            Self::ArtifactMissingOrEmpty(_) => true,
            Self::Io(_) => false,
        }
    }

    /// False when retrying cannot help, e.g. the extractor binary is absent.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Extractor(ExtractorError::ToolMissing(_)))
    }
}

#[derive(Debug)]
pub enum Outcome {
    Success(PathBuf),
    Failure(String),
}

#[derive(Debug)]
pub struct RetrievalAttempt {
    pub strategy: Strategy,
    pub format_selector: String,
    pub outcome: Outcome,
}

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("{strategy} failed: {cause}")]
    StrategiesFailed {
        strategy: Strategy,
        attempts: Vec<RetrievalAttempt>,
        #[source]
        cause: StrategyFailure,
    },
    #[error("retrieval failed after {attempts} attempt(s): {last}")]
    Exhausted {
        attempts: usize,
        #[source]
        last: Box<RetrievalError>,
    },
}

impl RetrievalError {
    /// The concrete failure at the bottom of the chain.
    pub fn cause(&self) -> &StrategyFailure {
        match self {
            Self::StrategiesFailed { cause, .. } => cause,
            Self::Exhausted { last, .. } => last.cause(),
        }
    }
}

/// Runs the strategies in order until one yields a verified, non-empty file.
/// Holds no state across calls.
pub struct Retriever {
    extractor: Arc<dyn Extractor>,
    remuxer: Arc<dyn Remuxer>,
    download_dir: PathBuf,
}

impl Retriever {
    pub fn new(
        extractor: Arc<dyn Extractor>,
        remuxer: Arc<dyn Remuxer>,
        download_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            extractor,
            remuxer,
            download_dir: download_dir.into(),
        }
    }

    pub async fn retrieve(
        &self,
        url: &CanonicalUrl,
        target: &FormatTarget,
        client: ClientIdentity,
    ) -> Result<PathBuf, RetrievalError> {
        let job = job_tag();
        let mut attempts = Vec::new();
        let mut strategy = Strategy::CombinedMux;

        loop {
            let format_selector = match strategy {
                Strategy::CombinedMux => target.combined_expression(),
                Strategy::SeparateTracks => {
                    format!("{} & {AUDIO_TRACK}", target.video_expression())
                }
                Strategy::SimplifiedSingleStream => SINGLE_STREAM.to_string(),
            };

            let result = match strategy {
                Strategy::CombinedMux => self.combined_mux(url, target, client, &job).await,
                Strategy::SeparateTracks => self.separate_tracks(url, target, client, &job).await,
                Strategy::SimplifiedSingleStream => self.single_stream(url, client, &job).await,
            };
            let verified = match result {
                Ok(path) => verify_artifact(&path).await,
                Err(failure) => Err(failure),
            };

            match verified {
                Ok(path) => {
                    info!("{strategy} produced {:?} for {url}", path);
                    attempts.push(RetrievalAttempt {
                        strategy,
                        format_selector,
                        outcome: Outcome::Success(path.clone()),
                    });
                    trace_attempts(url, &attempts);
                    return Ok(path);
                }
                Err(failure) => {
                    warn!("{strategy} failed for {url} [{format_selector}]: {failure}");
                    attempts.push(RetrievalAttempt {
                        strategy,
                        format_selector,
                        outcome: Outcome::Failure(failure.to_string()),
                    });

                    match next_strategy(strategy, &failure) {
                        Some(next) => strategy = next,
                        None => {
                            trace_attempts(url, &attempts);
                            return Err(RetrievalError::StrategiesFailed {
                                strategy,
                                attempts,
                                cause: failure,
                            });
                        }
                    }
                }
            }
        }
    }

    async fn combined_mux(
        &self,
        url: &CanonicalUrl,
        target: &FormatTarget,
        client: ClientIdentity,
        job: &str,
    ) -> Result<PathBuf, StrategyFailure> {
        let request = FetchRequest::new(
            url,
            target.combined_expression(),
            &self.output_template(job, None),
        )
        .merge_into(MERGE_CONTAINER)
        .client(client);

        let path = self.extractor.fetch(&request).await?;
        Ok(settle_container(path).await)
    }

    async fn separate_tracks(
        &self,
        url: &CanonicalUrl,
        target: &FormatTarget,
        client: ClientIdentity,
        job: &str,
    ) -> Result<PathBuf, StrategyFailure> {
        let video_request = FetchRequest::new(
            url,
            target.video_expression(),
            &self.output_template(job, Some("video")),
        )
        .client(client);
        let video = self.extractor.fetch(&video_request).await?;
        verify_artifact(&video).await?;

        let audio_request =
            FetchRequest::new(url, AUDIO_TRACK, &self.output_template(job, Some("audio")))
                .client(client);
        let audio = match self.extractor.fetch(&audio_request).await {
            Ok(audio) => audio,
            Err(error) => {
                warn!("Audio track unavailable for {url}, serving silent video: {error}");
                return Ok(video);
            }
        };

        let output = merged_output_path(&video, job);
        match self.remuxer.remux(&video, &audio, &output).await {
            Ok(()) => {
                remove_quietly(&audio).await;
                if verify_artifact(&output).await.is_ok() {
                    remove_quietly(&video).await;
                    Ok(output)
                } else {
                    warn!("Remux of {url} produced no output, serving silent video");
                    remove_quietly(&output).await;
                    Ok(video)
                }
            }
            Err(error) => {
                warn!("Remux failed for {url}, serving silent video: {error}");
                remove_quietly(&audio).await;
                remove_quietly(&output).await;
                Ok(video)
            }
        }
    }

    async fn single_stream(
        &self,
        url: &CanonicalUrl,
        client: ClientIdentity,
        job: &str,
    ) -> Result<PathBuf, StrategyFailure> {
        let request =
            FetchRequest::new(url, SINGLE_STREAM, &self.output_template(job, None)).client(client);
        Ok(self.extractor.fetch(&request).await?)
    }

    fn output_template(&self, job: &str, track: Option<&str>) -> PathBuf {
        let name = match track {
            Some(track) => format!("%(title).120B-{job}.{track}.%(ext)s"),
            None => format!("%(title).120B-{job}.%(ext)s"),
        };
        self.download_dir.join(name)
    }
}

fn next_strategy(current: Strategy, failure: &StrategyFailure) -> Option<Strategy> {
    match current {
        Strategy::CombinedMux if failure.implicates_merge() => Some(Strategy::SeparateTracks),
        Strategy::CombinedMux | Strategy::SeparateTracks => Some(Strategy::SimplifiedSingleStream),
        Strategy::SimplifiedSingleStream => None,
    }
}

fn trace_attempts(url: &CanonicalUrl, attempts: &[RetrievalAttempt]) {
    for (index, attempt) in attempts.iter().enumerate() {
        match &attempt.outcome {
            Outcome::Success(path) => debug!(
                "{url} #{index} {} [{}] -> {:?}",
                attempt.strategy, attempt.format_selector, path
            ),
            Outcome::Failure(reason) => debug!(
                "{url} #{index} {} [{}] failed: {reason}",
                attempt.strategy, attempt.format_selector
            ),
        }
    }
}

pub(crate) fn job_tag() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..12].to_string()
}

/// `<title>-<job>.video.<ext>` becomes `<title>-<job>.mp4` next to it.
fn merged_output_path(video: &Path, job: &str) -> PathBuf {
    let file_name = video
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = file_name
        .rfind(".video.")
        .map(|index| file_name[..index].to_string())
        .unwrap_or_else(|| job.to_string());
    video.with_file_name(format!("{stem}.{MERGE_CONTAINER}"))
}

/// Prefers a non-empty `.mp4` sibling when the extractor reports a
/// pre-merge extension.
async fn settle_container(path: PathBuf) -> PathBuf {
    let is_mp4 = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(MERGE_CONTAINER));
    if is_mp4 {
        return path;
    }

    let candidate = path.with_extension(MERGE_CONTAINER);
    match tokio::fs::metadata(&candidate).await {
        Ok(metadata) if metadata.is_file() && metadata.len() > 0 => candidate,
        _ => path,
    }
}

pub async fn verify_artifact(path: &Path) -> Result<PathBuf, StrategyFailure> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() && metadata.len() > 0 => Ok(path.to_path_buf()),
        Ok(_) => Err(StrategyFailure::ArtifactMissingOrEmpty(path.to_path_buf())),
        Err(error) if error.kind() == ErrorKind::NotFound => {
            Err(StrategyFailure::ArtifactMissingOrEmpty(path.to_path_buf()))
        }
        Err(error) => Err(StrategyFailure::Io(error)),
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(error) = tokio::fs::remove_file(path).await
        && error.kind() != ErrorKind::NotFound
    {
        warn!("Could not remove temporary file {:?}: {error}", path);
    }
}
