use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{debug, info};

use crate::{
    cache::ArtifactCache,
    catalog::{CatalogEntry, FormatCatalog, list_formats},
    extractor::{Extractor, FetchRequest},
    normalize::{CanonicalUrl, normalize},
    remux::Remuxer,
    retrieval::{
        FormatTarget, RetrievalError, Retriever, StrategyFailure, job_tag, verify_artifact,
    },
    retry::{RetryOrchestrator, RetryPolicy},
    selector::{QualityRequest, resolve},
};

pub const AUDIO_FORMATS: [&str; 6] = ["mp3", "m4a", "opus", "wav", "flac", "aac"];

/// Owns the artifact cache and drives one request through
/// normalise -> cache -> catalog -> select -> retrieve -> cache.
pub struct Downloader {
    extractor: Arc<dyn Extractor>,
    cache: ArtifactCache,
    orchestrator: RetryOrchestrator,
    download_dir: PathBuf,
}

impl Downloader {
    pub fn new(
        extractor: Arc<dyn Extractor>,
        remuxer: Arc<dyn Remuxer>,
        download_dir: PathBuf,
        policy: RetryPolicy,
        cache_ttl: chrono::Duration,
    ) -> Self {
        let retriever = Retriever::new(extractor.clone(), remuxer, download_dir.clone());
        Self {
            extractor,
            cache: ArtifactCache::new(cache_ttl),
            orchestrator: RetryOrchestrator::new(retriever, policy),
            download_dir,
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub async fn formats(&self, raw_url: &str) -> FormatCatalog {
        list_formats(self.extractor.as_ref(), &normalize(raw_url)).await
    }

    pub async fn download(&self, raw_url: &str, format_code: &str) -> Result<PathBuf, RetrievalError> {
        let url = normalize(raw_url);
        let request = QualityRequest::parse(format_code);
        let token = request.token();

        if let Some(path) = self.cache.lookup(&url, &token).await {
            info!("Serving cached artifact {:?} for {url} [{token}]", path);
            return Ok(path);
        }

        let target = self.resolve_target(&url, &request).await;
        debug!("{url} [{token}] resolved to {:?}", target);

        let path = self.orchestrator.retrieve_with_retry(&url, &target).await?;
        self.cache.insert(&url, &token, &path).await;
        Ok(path)
    }

    async fn resolve_target(&self, url: &CanonicalUrl, request: &QualityRequest) -> FormatTarget {
        match request {
            QualityRequest::Best => FormatTarget::Best,
            QualityRequest::Literal(expression) => FormatTarget::Expression(expression.clone()),
            QualityRequest::Height(height) => {
                let catalog = list_formats(self.extractor.as_ref(), url).await;
                let format_id = resolve(&catalog, request);
                match catalog.get(&format_id).and_then(CatalogEntry::descriptor) {
                    Some(descriptor) => FormatTarget::Entry {
                        format_id,
                        height: descriptor.height,
                        has_audio: descriptor.has_audio,
                    },
                    None => FormatTarget::Height(*height),
                }
            }
        }
    }

    /// Best audio stream converted to `audio_format` by the extractor's
    /// post-processor. Not cached.
    pub async fn download_audio(
        &self,
        raw_url: &str,
        audio_format: &str,
    ) -> Result<PathBuf, StrategyFailure> {
        let url = normalize(raw_url);
        let template = self
            .download_dir
            .join(format!("%(title).120B-{}.%(ext)s", job_tag()));
        let request = FetchRequest::new(&url, "bestaudio/best", &template).extract_audio(audio_format);

        let path = self.extractor.fetch(&request).await?;
        let path = prefer_converted(path, audio_format).await;
        verify_artifact(&path).await
    }
}

async fn prefer_converted(path: PathBuf, audio_format: &str) -> PathBuf {
    let already = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(audio_format));
    if already {
        return path;
    }

    let candidate = path.with_extension(audio_format);
    if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
        candidate
    } else {
        path
    }
}
