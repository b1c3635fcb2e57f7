//! Output directory reconciler.
//!
//! Each stream owns `{root}/{stream_id}/`, holding the HLS playlist and its
//! rolling window of segments. The reconciler creates that directory,
//! watches it for evidence that the encoder is producing output, and
//! purges it once the session ends.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::Result;
use crate::domain::source::validate_stream_id;
use crate::encoder::PLAYLIST_FILE;
use crate::utils::fs;

/// Default interval between playlist checks.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Tolerance for filesystems with coarse modification timestamps.
const MTIME_SLACK: Duration = Duration::from_secs(2);

/// URL prefix under which the HTTP layer serves output directories.
pub const PUBLIC_PREFIX: &str = "/streams";

/// Manages per-stream output directories under a shared root.
#[derive(Debug, Clone)]
pub struct OutputReconciler {
    root: PathBuf,
    poll_interval: Duration,
}

impl OutputReconciler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory owned by `stream_id`.
    pub fn stream_dir(&self, stream_id: &str) -> Result<PathBuf> {
        validate_stream_id(stream_id)?;
        Ok(self.root.join(stream_id))
    }

    pub fn playlist_path(dir: &Path) -> PathBuf {
        dir.join(PLAYLIST_FILE)
    }

    /// Public locator of a stream's playlist.
    pub fn playlist_locator(stream_id: &str) -> String {
        format!("{PUBLIC_PREFIX}/{stream_id}/{PLAYLIST_FILE}")
    }

    /// Create an empty directory for `stream_id`.
    ///
    /// Safe to call when the directory already exists; leftovers from an
    /// earlier run are removed first so they cannot be mistaken for fresh
    /// output.
    pub async fn prepare(&self, stream_id: &str) -> Result<PathBuf> {
        let dir = self.stream_dir(stream_id)?;

        if fs::dir_has_entries(&dir).await? {
            warn!(stream_id, "Removing stale artifacts from {}", dir.display());
            fs::remove_dir_all_if_exists(&dir).await?;
        }

        fs::ensure_dir_all_with_op("creating output directory", &dir).await?;
        debug!(stream_id, "Prepared output directory {}", dir.display());
        Ok(dir)
    }

    /// Poll `dir` until a playlist written at or after `since` lists at least
    /// one segment, or `budget` runs out.
    pub async fn verify_producing(&self, dir: &Path, since: SystemTime, budget: Duration) -> bool {
        let deadline = Instant::now() + budget;

        loop {
            if Self::playlist_ready(dir, since).await {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                debug!("No playlist in {} after {:?}", dir.display(), budget);
                return false;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// One-shot check used by [`Self::verify_producing`].
    pub async fn playlist_ready(dir: &Path, since: SystemTime) -> bool {
        let playlist = Self::playlist_path(dir);

        let modified = match tokio::fs::metadata(&playlist).await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => return false,
        };
        let threshold = since.checked_sub(MTIME_SLACK).unwrap_or(since);
        if modified < threshold {
            return false;
        }

        let Ok(bytes) = tokio::fs::read(&playlist).await else {
            return false;
        };
        match m3u8_rs::parse_media_playlist_res(&bytes) {
            Ok(media) => !media.segments.is_empty(),
            // Possibly caught mid-write; the next poll retries.
            Err(_) => false,
        }
    }

    /// Remove every artifact in `dir`. A missing directory is a no-op.
    pub async fn purge(&self, dir: &Path) -> Result<()> {
        if fs::remove_dir_all_if_exists(dir).await? {
            info!("Purged output directory {}", dir.display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use tempfile::TempDir;

    const PLAYLIST: &str = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:2\n#EXT-X-MEDIA-SEQUENCE:0\n#EXTINF:2.000000,\nsegment_000.ts\n";

    fn reconciler(temp: &TempDir) -> OutputReconciler {
        OutputReconciler::new(temp.path()).with_poll_interval(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_prepare_creates_empty_dir() {
        let temp = TempDir::new().unwrap();
        let dir = reconciler(&temp).prepare("cam1").await.unwrap();

        assert_eq!(dir, temp.path().join("cam1"));
        assert!(dir.is_dir());
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_prepare_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let reconciler = reconciler(&temp);
        let first = reconciler.prepare("cam1").await.unwrap();
        let second = reconciler.prepare("cam1").await.unwrap();
        assert_eq!(first, second);
        assert!(second.is_dir());
    }

    #[tokio::test]
    async fn test_prepare_clears_stale_artifacts() {
        let temp = TempDir::new().unwrap();
        let stale = temp.path().join("cam1");
        std::fs::create_dir(&stale).unwrap();
        std::fs::write(stale.join(PLAYLIST_FILE), PLAYLIST).unwrap();

        let dir = reconciler(&temp).prepare("cam1").await.unwrap();
        assert!(!dir.join(PLAYLIST_FILE).exists());
    }

    #[tokio::test]
    async fn test_prepare_rejects_escaping_ids() {
        let temp = TempDir::new().unwrap();
        let err = reconciler(&temp).prepare("../etc").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_verify_producing_sees_playlist() {
        let temp = TempDir::new().unwrap();
        let reconciler = reconciler(&temp);
        let dir = reconciler.prepare("cam1").await.unwrap();
        let since = SystemTime::now();

        let writer_dir = dir.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tokio::fs::write(writer_dir.join(PLAYLIST_FILE), PLAYLIST)
                .await
                .unwrap();
        });

        assert!(
            reconciler
                .verify_producing(&dir, since, Duration::from_secs(5))
                .await
        );
    }

    #[tokio::test]
    async fn test_verify_producing_times_out() {
        let temp = TempDir::new().unwrap();
        let reconciler = reconciler(&temp);
        let dir = reconciler.prepare("cam1").await.unwrap();

        let started = std::time::Instant::now();
        let produced = reconciler
            .verify_producing(&dir, SystemTime::now(), Duration::from_millis(200))
            .await;
        assert!(!produced);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_playlist_without_segments_is_not_ready() {
        let temp = TempDir::new().unwrap();
        let dir = reconciler(&temp).prepare("cam1").await.unwrap();
        std::fs::write(
            dir.join(PLAYLIST_FILE),
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:2\n",
        )
        .unwrap();

        assert!(!OutputReconciler::playlist_ready(&dir, SystemTime::now()).await);
    }

    #[tokio::test]
    async fn test_old_playlist_is_not_ready() {
        let temp = TempDir::new().unwrap();
        let dir = reconciler(&temp).prepare("cam1").await.unwrap();
        std::fs::write(dir.join(PLAYLIST_FILE), PLAYLIST).unwrap();

        let later = SystemTime::now() + Duration::from_secs(60);
        assert!(!OutputReconciler::playlist_ready(&dir, later).await);
        assert!(OutputReconciler::playlist_ready(&dir, SystemTime::now()).await);
    }

    #[tokio::test]
    async fn test_purge_removes_everything_and_tolerates_missing() {
        let temp = TempDir::new().unwrap();
        let reconciler = reconciler(&temp);
        let dir = reconciler.prepare("cam1").await.unwrap();
        std::fs::write(dir.join(PLAYLIST_FILE), PLAYLIST).unwrap();
        std::fs::write(dir.join("segment_000.ts"), b"ts").unwrap();

        reconciler.purge(&dir).await.unwrap();
        assert!(!dir.exists());

        reconciler.purge(&dir).await.unwrap();
    }

    #[test]
    fn test_playlist_locator() {
        assert_eq!(
            OutputReconciler::playlist_locator("cam1"),
            "/streams/cam1/playlist.m3u8"
        );
    }
}
