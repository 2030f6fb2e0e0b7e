use std::{fmt, sync::LazyLock};

use regex::Regex;

const WATCH_PREFIX: &str = "https://www.youtube.com/watch?v=";

static SHORT_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://(?:www\.)?youtu\.be/([A-Za-z0-9_-]{11})(?:[?&].*)?$")
        .unwrap()
});

static SHORTS_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://(?:www\.|m\.)?youtube\.com/shorts/([A-Za-z0-9_-]{11})(?:[?&/].*)?$")
        .unwrap()
});

static EMBED_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://(?:www\.|m\.)?youtube\.com/embed/([A-Za-z0-9_-]{11})(?:[?&/].*)?$")
        .unwrap()
});

static WATCH_PARAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[?&]v=([A-Za-z0-9_-]{11})(?:[&#]|$)")
        .unwrap()
});

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalUrl(String);

impl CanonicalUrl {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The 11-character video id, when the url was recognised.
    pub fn video_id(&self) -> Option<&str> {
        self.0.strip_prefix(WATCH_PREFIX)
    }
}

impl fmt::Display for CanonicalUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rewrites short-link, shorts, embed and watch forms to
/// `https://www.youtube.com/watch?v=<id>`. Anything else passes through
/// trimmed but otherwise untouched.
pub fn normalize(raw: &str) -> CanonicalUrl {
    let raw = raw.trim();

    let id = [&*SHORT_LINK, &*SHORTS_PATH, &*EMBED_PATH, &*WATCH_PARAM]
        .iter()
        .find_map(|pattern| pattern.captures(raw))
        .and_then(|captures| captures.get(1))
        .map(|matched| matched.as_str());

    match id {
        Some(id) => CanonicalUrl(format!("{WATCH_PREFIX}{id}")),
        None => CanonicalUrl(raw.to_string()),
    }
}
