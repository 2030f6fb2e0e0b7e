use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    extractor::{ClientIdentity, Extractor, RawFormat},
    normalize::CanonicalUrl,
};

pub const BEST: &str = "best";
const HIGH_FRAME_RATE: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Mp4,
    Webm,
    M4a,
    Other,
}

impl Container {
    pub fn from_ext(ext: &str) -> Self {
        match ext.trim().to_ascii_lowercase().as_str() {
            "mp4" => Self::Mp4,
            "webm" => Self::Webm,
            "m4a" => Self::M4a,
            _ => Self::Other,
        }
    }

    pub fn ext(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Webm => "webm",
            Self::M4a => "m4a",
            Self::Other => "bin",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FormatDescriptor {
    pub format_id: String,
    pub container: Container,
    pub has_video: bool,
    pub has_audio: bool,
    pub height: Option<u32>,
    pub frame_rate: Option<f64>,
    pub approx_size_bytes: Option<u64>,
}

impl FormatDescriptor {
    pub fn from_raw(raw: &RawFormat) -> Option<Self> {
        let format_id = raw.format_id.clone().filter(|id| !id.trim().is_empty())?;
        Some(Self {
            format_id,
            container: Container::from_ext(raw.ext.as_deref().unwrap_or_default()),
            has_video: raw.has_video(),
            has_audio: raw.has_audio(),
            height: raw.height.filter(|height| *height > 0),
            frame_rate: raw.fps.filter(|fps| *fps > 0.0),
            approx_size_bytes: raw
                .filesize
                .or(raw.filesize_approx)
                .filter(|size| *size > 0.0)
                .map(|size| size as u64),
        })
    }

    /// `"<height>p"`, with a `60` suffix from 50 fps upwards.
    pub fn label(&self) -> String {
        let height = self.height.unwrap_or_default();
        if self.frame_rate.is_some_and(|fps| fps >= HIGH_FRAME_RATE) {
            format!("{height}p60")
        } else {
            format!("{height}p")
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CatalogEntry {
    Auto,
    Format(FormatDescriptor),
}

impl CatalogEntry {
    pub fn format_id(&self) -> &str {
        match self {
            Self::Auto => BEST,
            Self::Format(descriptor) => &descriptor.format_id,
        }
    }

    pub fn descriptor(&self) -> Option<&FormatDescriptor> {
        match self {
            Self::Auto => None,
            Self::Format(descriptor) => Some(descriptor),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FormatOption {
    pub format_id: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesize_mb: Option<f64>,
}

impl From<&CatalogEntry> for FormatOption {
    fn from(entry: &CatalogEntry) -> Self {
        match entry {
            CatalogEntry::Auto => Self {
                format_id: BEST.to_string(),
                label: "Auto".to_string(),
                ext: None,
                fps: None,
                filesize_mb: None,
            },
            CatalogEntry::Format(descriptor) => Self {
                format_id: descriptor.format_id.clone(),
                label: descriptor.label(),
                ext: Some(descriptor.container.ext()),
                fps: Some(descriptor.frame_rate.unwrap_or_default()),
                filesize_mb: descriptor
                    .approx_size_bytes
                    .map(|bytes| (bytes as f64 / 1_048_576.0 * 100.0).round() / 100.0),
            },
        }
    }
}

/// Selectable formats for one video. The first entry is always the synthetic
/// `best` entry, so the catalog is never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct FormatCatalog {
    entries: Vec<CatalogEntry>,
}

impl FormatCatalog {
    pub fn fallback() -> Self {
        Self {
            entries: vec![CatalogEntry::Auto],
        }
    }

    pub fn from_descriptors(descriptors: impl IntoIterator<Item = FormatDescriptor>) -> Self {
        let mut seen_ids = HashSet::new();
        let mut entries = vec![CatalogEntry::Auto];
        entries.extend(
            descriptors
                .into_iter()
                .filter(|descriptor| descriptor.format_id != BEST)
                .filter(|descriptor| seen_ids.insert(descriptor.format_id.clone()))
                .map(CatalogEntry::Format),
        );
        Self { entries }
    }

    pub fn from_raw(formats: &[RawFormat]) -> Self {
        Self::from_descriptors(
            formats
                .iter()
                .filter_map(FormatDescriptor::from_raw)
                .filter(is_selectable),
        )
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &FormatDescriptor> {
        self.entries.iter().filter_map(CatalogEntry::descriptor)
    }

    pub fn get(&self, format_id: &str) -> Option<&CatalogEntry> {
        self.entries.iter().find(|entry| entry.format_id() == format_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn options(&self) -> Vec<FormatOption> {
        self.entries.iter().map(FormatOption::from).collect()
    }
}

/// Video-bearing mp4 streams with a known height.
fn is_selectable(descriptor: &FormatDescriptor) -> bool {
    descriptor.has_video && descriptor.container == Container::Mp4 && descriptor.height.is_some()
}

/// Best-effort: any extractor failure degrades to the single `best` entry.
pub async fn list_formats(extractor: &dyn Extractor, url: &CanonicalUrl) -> FormatCatalog {
    match extractor.probe(url, ClientIdentity::Default).await {
        Ok(info) => {
            let catalog = FormatCatalog::from_raw(&info.formats);
            debug!(
                "{} listed {} selectable format(s) for {:?} ({})",
                extractor.name(),
                catalog.len() - 1,
                info.title.as_deref().unwrap_or("untitled"),
                info.id.as_deref().or(url.video_id()).unwrap_or("unknown id"),
            );
            catalog
        }
        Err(error) => {
            warn!("Format listing failed for {url}: {error}");
            FormatCatalog::fallback()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        extractor::ExtractorError,
        normalize::normalize,
        testing::{FakeExtractor, raw_format},
    };

    #[test]
    fn filters_unselectable_and_labels_frame_rates() {
        let mut audio_only = raw_format("140", "m4a", None, None);
        audio_only.vcodec = Some("none".into());
        let formats = vec![
            raw_format("18", "mp4", Some(360), Some(30.0)),
            raw_format("248", "webm", Some(1080), Some(30.0)),
            raw_format("299", "mp4", Some(1080), Some(59.94)),
            raw_format("298", "mp4", Some(720), Some(50.0)),
            raw_format("nohigh", "mp4", None, Some(30.0)),
            audio_only,
            raw_format("18", "mp4", Some(360), Some(30.0)),
        ];

        let catalog = FormatCatalog::from_raw(&formats);
        let labels: Vec<_> = catalog
            .options()
            .into_iter()
            .map(|option| (option.format_id, option.label))
            .collect();

        assert_eq!(
            labels,
            vec![
                ("best".to_string(), "Auto".to_string()),
                ("18".to_string(), "360p".to_string()),
                ("299".to_string(), "1080p60".to_string()),
                ("298".to_string(), "720p60".to_string()),
            ]
        );
    }

    #[test]
    fn auto_option_serializes_without_details() {
        let json = serde_json::to_value(FormatCatalog::fallback().options()).unwrap();
        assert_eq!(json, serde_json::json!([{"format_id": "best", "label": "Auto"}]));
    }

    #[test]
    fn filesize_is_reported_in_megabytes() {
        let mut raw = raw_format("22", "mp4", Some(720), Some(30.0));
        raw.filesize = Some(5.0 * 1_048_576.0);
        let catalog = FormatCatalog::from_raw(&[raw]);
        let option = &catalog.options()[1];
        assert_eq!(option.filesize_mb, Some(5.0));
        assert_eq!(option.ext, Some("mp4"));
    }

    #[tokio::test]
    async fn extractor_failure_yields_fallback_catalog() {
        let extractor = FakeExtractor::new()
            .probe_error(|| ExtractorError::Blocked("sign in to confirm".into()));
        let catalog = list_formats(&extractor, &normalize("https://youtu.be/ABCDEFGHIJK")).await;

        assert_eq!(catalog, FormatCatalog::fallback());
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get("best"), Some(&CatalogEntry::Auto));
    }

    #[tokio::test]
    async fn empty_listing_still_has_best_entry() {
        let extractor = FakeExtractor::new().probe_formats(Vec::new());
        let catalog = list_formats(&extractor, &normalize("https://youtu.be/ABCDEFGHIJK")).await;
        assert_eq!(catalog, FormatCatalog::fallback());
    }
}
