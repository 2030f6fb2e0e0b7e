use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::Mutex,
};

use async_trait::async_trait;
use tokio::time::Instant;

use crate::{
    extractor::{ClientIdentity, Extractor, ExtractorError, FetchRequest, RawFormat, VideoInfo},
    normalize::CanonicalUrl,
    remux::{RemuxError, Remuxer},
};

pub const FAKE_TITLE: &str = "Test Video";

pub fn raw_format(format_id: &str, ext: &str, height: Option<u32>, fps: Option<f64>) -> RawFormat {
    RawFormat {
        format_id: Some(format_id.to_string()),
        ext: Some(ext.to_string()),
        vcodec: Some("avc1.4d401f".to_string()),
        acodec: Some("none".to_string()),
        height,
        fps,
        filesize: None,
        filesize_approx: None,
    }
}

#[derive(Clone)]
pub enum FetchStep {
    Write {
        ext: &'static str,
        bytes: &'static [u8],
    },
    Fail(fn() -> ExtractorError),
}

impl FetchStep {
    pub fn write(ext: &'static str, bytes: &'static [u8]) -> Self {
        Self::Write { ext, bytes }
    }

    pub fn fail(error: fn() -> ExtractorError) -> Self {
        Self::Fail(error)
    }
}

enum ProbeBehaviour {
    Formats(Vec<RawFormat>),
    Fail(fn() -> ExtractorError),
}

/// Scripted extractor: each `fetch` consumes the next step, falling back to
/// `otherwise` once the script runs out.
pub struct FakeExtractor {
    probe: ProbeBehaviour,
    steps: Mutex<VecDeque<FetchStep>>,
    otherwise: FetchStep,
    requests: Mutex<Vec<FetchRequest>>,
    fetch_times: Mutex<Vec<Instant>>,
    probes: Mutex<usize>,
}

impl FakeExtractor {
    pub fn new() -> Self {
        Self {
            probe: ProbeBehaviour::Formats(Vec::new()),
            steps: Mutex::new(VecDeque::new()),
            otherwise: FetchStep::fail(|| ExtractorError::Failed("no scripted outcome".into())),
            requests: Mutex::new(Vec::new()),
            fetch_times: Mutex::new(Vec::new()),
            probes: Mutex::new(0),
        }
    }

    pub fn probe_formats(mut self, formats: Vec<RawFormat>) -> Self {
        self.probe = ProbeBehaviour::Formats(formats);
        self
    }

    pub fn probe_error(mut self, error: fn() -> ExtractorError) -> Self {
        self.probe = ProbeBehaviour::Fail(error);
        self
    }

    pub fn then(self, step: FetchStep) -> Self {
        self.steps.lock().unwrap().push_back(step);
        self
    }

    pub fn otherwise(mut self, step: FetchStep) -> Self {
        self.otherwise = step;
        self
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn fetch_times(&self) -> Vec<Instant> {
        self.fetch_times.lock().unwrap().clone()
    }

    pub fn probe_count(&self) -> usize {
        *self.probes.lock().unwrap()
    }
}

#[async_trait]
impl Extractor for FakeExtractor {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn probe(
        &self,
        url: &CanonicalUrl,
        _client: ClientIdentity,
    ) -> Result<VideoInfo, ExtractorError> {
        *self.probes.lock().unwrap() += 1;
        match &self.probe {
            ProbeBehaviour::Formats(formats) => Ok(VideoInfo {
                id: url.video_id().map(ToString::to_string),
                title: Some(FAKE_TITLE.to_string()),
                formats: formats.clone(),
                entries: Vec::new(),
            }),
            ProbeBehaviour::Fail(error) => Err(error()),
        }
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<PathBuf, ExtractorError> {
        self.requests.lock().unwrap().push(request.clone());
        self.fetch_times.lock().unwrap().push(Instant::now());

        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.otherwise.clone());

        match step {
            FetchStep::Write { ext, bytes } => {
                let path = expand_template(&request.output_template, request.url.video_id(), ext);
                tokio::fs::write(&path, bytes).await?;
                Ok(path)
            }
            FetchStep::Fail(error) => Err(error()),
        }
    }
}

fn expand_template(template: &Path, id: Option<&str>, ext: &str) -> PathBuf {
    let expanded = template
        .to_string_lossy()
        .replace("%(title).120B", FAKE_TITLE)
        .replace("%(id)s", id.unwrap_or("unknown"))
        .replace("%(ext)s", ext);
    PathBuf::from(expanded)
}

/// Concatenates its inputs, fails with a diagnostic, or exits cleanly
/// without writing anything, depending on how it was built.
pub struct FakeRemuxer {
    behaviour: RemuxBehaviour,
}

enum RemuxBehaviour {
    Concatenate,
    Fail,
    WriteEmpty,
}

impl FakeRemuxer {
    pub fn succeeding() -> Self {
        Self {
            behaviour: RemuxBehaviour::Concatenate,
        }
    }

    pub fn failing() -> Self {
        Self {
            behaviour: RemuxBehaviour::Fail,
        }
    }

    pub fn writing_empty() -> Self {
        Self {
            behaviour: RemuxBehaviour::WriteEmpty,
        }
    }
}

#[async_trait]
impl Remuxer for FakeRemuxer {
    async fn remux(&self, video: &Path, audio: &Path, output: &Path) -> Result<(), RemuxError> {
        match self.behaviour {
            RemuxBehaviour::Concatenate => {
                let mut bytes = tokio::fs::read(video).await?;
                bytes.extend(tokio::fs::read(audio).await?);
                tokio::fs::write(output, bytes).await?;
                Ok(())
            }
            RemuxBehaviour::Fail => Err(RemuxError::Failed {
                status: "exit status: 1".into(),
                detail: "Could not find tag for codec".into(),
            }),
            RemuxBehaviour::WriteEmpty => {
                tokio::fs::write(output, b"").await?;
                Ok(())
            }
        }
    }
}
