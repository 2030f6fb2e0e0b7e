use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::debug;

use crate::normalize::CanonicalUrl;

#[derive(Debug, Clone)]
struct CacheEntry {
    file_path: PathBuf,
    created_at: DateTime<Utc>,
}

/// Maps `(url, format token)` to a previously retrieved artifact.
///
/// Entries are invalidated lazily: a stale or dangling entry is simply not
/// returned and gets overwritten by the next insert under the same key.
pub struct ArtifactCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: chrono::Duration,
}

pub fn fingerprint(url: &CanonicalUrl, format_token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_str().as_bytes());
    hasher.update(b"::");
    hasher.update(format_token.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl ArtifactCache {
    pub fn new(ttl: chrono::Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn lookup(&self, url: &CanonicalUrl, format_token: &str) -> Option<PathBuf> {
        self.lookup_at(url, format_token, Utc::now()).await
    }

    pub async fn lookup_at(
        &self,
        url: &CanonicalUrl,
        format_token: &str,
        now: DateTime<Utc>,
    ) -> Option<PathBuf> {
        let key = fingerprint(url, format_token);
        let entry = self.entries.lock().await.get(&key).cloned()?;

        if now - entry.created_at >= self.ttl {
            debug!("Cache entry for {url} [{format_token}] expired");
            return None;
        }
        if !is_present(&entry.file_path).await {
            debug!(
                "Cache entry for {url} [{format_token}] points at missing file {:?}",
                entry.file_path
            );
            return None;
        }

        Some(entry.file_path)
    }

    pub async fn insert(&self, url: &CanonicalUrl, format_token: &str, file_path: &Path) {
        self.insert_at(url, format_token, file_path, Utc::now()).await;
    }

    pub async fn insert_at(
        &self,
        url: &CanonicalUrl,
        format_token: &str,
        file_path: &Path,
        now: DateTime<Utc>,
    ) {
        let key = fingerprint(url, format_token);
        self.entries.lock().await.insert(
            key,
            CacheEntry {
                file_path: file_path.to_path_buf(),
                created_at: now,
            },
        );
    }
}

async fn is_present(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|metadata| metadata.is_file())
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::normalize::normalize;

    fn url() -> CanonicalUrl {
        normalize("https://youtu.be/ABCDEFGHIJK")
    }

    #[tokio::test]
    async fn entry_expires_after_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("video.mp4");
        std::fs::write(&file, b"data").unwrap();

        let cache = ArtifactCache::new(Duration::hours(24));
        let inserted_at = Utc::now();
        cache.insert_at(&url(), "720", &file, inserted_at).await;

        let almost = inserted_at + Duration::hours(23) + Duration::minutes(59);
        assert_eq!(cache.lookup_at(&url(), "720", almost).await, Some(file.clone()));

        let past = inserted_at + Duration::hours(24) + Duration::minutes(1);
        assert_eq!(cache.lookup_at(&url(), "720", past).await, None);
    }

    #[tokio::test]
    async fn deleted_file_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("video.mp4");
        std::fs::write(&file, b"data").unwrap();

        let cache = ArtifactCache::new(Duration::hours(24));
        cache.insert(&url(), "best", &file).await;
        assert!(cache.lookup(&url(), "best").await.is_some());

        std::fs::remove_file(&file).unwrap();
        assert_eq!(cache.lookup(&url(), "best").await, None);
    }

    #[tokio::test]
    async fn keys_separate_format_tokens_and_reinsert_supersedes() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.mp4");
        let new = dir.path().join("new.mp4");
        std::fs::write(&old, b"a").unwrap();
        std::fs::write(&new, b"b").unwrap();

        let cache = ArtifactCache::new(Duration::hours(24));
        let stale = Utc::now() - Duration::hours(30);
        cache.insert_at(&url(), "720", &old, stale).await;
        assert_eq!(cache.lookup(&url(), "720").await, None);
        assert_eq!(cache.lookup(&url(), "480").await, None);

        cache.insert(&url(), "720", &new).await;
        assert_eq!(cache.lookup(&url(), "720").await, Some(new));
    }

    #[test]
    fn fingerprint_depends_on_both_parts() {
        let url = url();
        assert_eq!(fingerprint(&url, "720"), fingerprint(&url, "720"));
        assert_ne!(fingerprint(&url, "720"), fingerprint(&url, "1080"));
        assert_eq!(fingerprint(&url, "best").len(), 64);
    }
}
