use std::{io::ErrorKind, path::Path};

use async_trait::async_trait;
use tokio::{
    process::Command,
    time::{Duration, timeout},
};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum RemuxError {
    #[error("{0} is not installed")]
    ToolMissing(String),
    #[error("remux timed out after {0}s")]
    Timeout(u64),
    #[error("remux exited with {status}: {detail}")]
    Failed { status: String, detail: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Combines a video-only and an audio-only file into one container.
#[async_trait]
pub trait Remuxer: Send + Sync {
    async fn remux(&self, video: &Path, audio: &Path, output: &Path) -> Result<(), RemuxError>;
}

pub struct Ffmpeg {
    binary: String,
    timeout: Duration,
}

impl Ffmpeg {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    fn args(video: &Path, audio: &Path, output: &Path) -> Vec<String> {
        vec![
            "-y".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-i".to_string(),
            video.to_string_lossy().into_owned(),
            "-i".to_string(),
            audio.to_string_lossy().into_owned(),
            "-map".to_string(),
            "0:v:0".to_string(),
            "-map".to_string(),
            "1:a:0".to_string(),
            "-c".to_string(),
            "copy".to_string(),
            "-movflags".to_string(),
            "+faststart".to_string(),
            output.to_string_lossy().into_owned(),
        ]
    }
}

#[async_trait]
impl Remuxer for Ffmpeg {
    async fn remux(&self, video: &Path, audio: &Path, output: &Path) -> Result<(), RemuxError> {
        let args = Self::args(video, audio, output);
        debug!("{} {}", self.binary, args.join(" "));

        let command_future = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output();
        let output = timeout(self.timeout, command_future)
            .await
            .map_err(|_| RemuxError::Timeout(self.timeout.as_secs()))?
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    RemuxError::ToolMissing(self.binary.clone())
                } else {
                    RemuxError::Io(error)
                }
            })?;

        if !output.status.success() {
            return Err(RemuxError::Failed {
                status: output.status.to_string(),
                detail: last_line(&output.stderr),
            });
        }

        Ok(())
    }
}

fn last_line(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("no diagnostics")
        .to_string()
}
