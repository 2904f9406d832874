//! Periodic cleanup of local segment files.
//!
//! Uploaded segments stay on disk for manual recovery; this task bounds how
//! long. The segment being recorded right now and the latest-final file are
//! never touched.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use log::{debug, error, info, warn};
use tokio::fs;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::recorder::SegmentRecorder;

#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub segment_dir: PathBuf,
    pub max_age: Duration,
    pub interval: Duration,
}

/// Delete regular files in `dir` last modified before `cutoff`, except those in `keep`.
/// Returns the number of files removed.
pub async fn purge_older_than(dir: &Path, cutoff: SystemTime, keep: &[&Path]) -> Result<usize> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if keep.contains(&path.as_path()) {
            continue;
        }
        let meta = entry.metadata().await?;
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified()?;
        if modified >= cutoff {
            continue;
        }
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Removed expired segment {}", path.display());
                removed += 1;
            }
            Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
        }
    }
    Ok(removed)
}

/// Run the retention loop until `cancel` is triggered.
pub async fn run(policy: RetentionPolicy, recorder: SegmentRecorder, cancel: CancellationToken) {
    info!(
        "Segment retention started: max age {}h, every {}s",
        policy.max_age.as_secs() / 3600,
        policy.interval.as_secs()
    );

    let mut interval = tokio::time::interval(policy.interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Segment retention stopping");
                break;
            }
            _ = interval.tick() => {
                let Some(cutoff) = SystemTime::now().checked_sub(policy.max_age) else {
                    continue;
                };
                let active = recorder.current_output_path().await;
                let mut keep = vec![recorder.latest_final_path()];
                keep.extend(active.as_deref());
                match purge_older_than(&policy.segment_dir, cutoff, &keep).await {
                    Ok(0) => debug!("Segment retention: nothing to purge"),
                    Ok(removed) => info!("Segment retention: purged {} file(s)", removed),
                    Err(e) => error!("Segment retention: cleanup failed: {}", e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn purges_old_files_but_keeps_active_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("temp_20250101_120000.mp4");
        let active = dir.path().join("temp_20250101_120015.mp4");
        std::fs::write(&old, b"a").unwrap();
        std::fs::write(&active, b"b").unwrap();
        std::fs::create_dir(dir.path().join("finalVideo")).unwrap();

        let cutoff = SystemTime::now() + Duration::from_secs(60);
        let removed = purge_older_than(dir.path(), cutoff, &[active.as_path()]).await.unwrap();

        assert_eq!(removed, 1);
        assert!(!old.exists());
        assert!(active.exists());
        assert!(dir.path().join("finalVideo").exists());
    }

    #[tokio::test]
    async fn recent_files_survive() {
        let dir = tempfile::tempdir().unwrap();
        let fresh = dir.path().join("temp_20250101_120000.mp4");
        std::fs::write(&fresh, b"a").unwrap();

        let cutoff = SystemTime::now() - Duration::from_secs(3600);
        assert_eq!(purge_older_than(dir.path(), cutoff, &[]).await.unwrap(), 0);
        assert!(fresh.exists());
    }

    #[tokio::test]
    async fn missing_directory_is_empty() {
        let removed = purge_older_than(Path::new("/nonexistent/segments"), SystemTime::now(), &[])
            .await
            .unwrap();
        assert_eq!(removed, 0);
    }
}
