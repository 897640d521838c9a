use crate::error::RecorderError;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{debug, info, warn};

/// Files smaller than this are garbage from interrupted writes
const TINY_FILE_BYTES: u64 = 100 * 1024;

/// Result of one retention sweep
#[derive(Debug, Clone, Default)]
pub struct SweepResult {
    pub files_deleted: usize,
    pub bytes_freed: u64,
    pub dirs_removed: usize,
}

/// Delete recordings whose modification time is older than the retention
/// window, then remove directories left empty, bottom-up. Only video files
/// are touched; anything still inside the window is left alone.
pub async fn sweep(root: &Path, retention_days: u32) -> Result<SweepResult, RecorderError> {
    let cutoff = SystemTime::now() - Duration::from_secs(retention_days as u64 * 86_400);
    let mut result = SweepResult::default();

    if !root.exists() {
        return Ok(result);
    }

    let (files, dirs) = walk(root).await?;

    for file in files {
        if file.extension().map(|e| e == "mp4").unwrap_or(false) {
            let metadata = match fs::metadata(&file).await {
                Ok(m) => m,
                Err(e) => {
                    debug!("Skipping unreadable file {}: {}", file.display(), e);
                    continue;
                }
            };
            let modified = match metadata.modified() {
                Ok(t) => t,
                Err(_) => continue,
            };

            if modified < cutoff {
                match fs::remove_file(&file).await {
                    Ok(()) => {
                        result.files_deleted += 1;
                        result.bytes_freed += metadata.len();
                        info!("Removed expired recording: {}", file.display());
                    }
                    Err(e) => warn!("Failed to remove {}: {}", file.display(), e),
                }
            }
        }
    }

    // Deepest directories first so emptied parents collapse too
    let mut dirs = dirs;
    dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
    for dir in dirs {
        if dir == root {
            continue;
        }
        if fs::remove_dir(&dir).await.is_ok() {
            result.dirs_removed += 1;
            debug!("Removed empty directory: {}", dir.display());
        }
    }

    Ok(result)
}

/// Remove leftover video files too small to be playable. Returns the
/// number of files removed.
pub async fn cleanup_tiny(root: &Path) -> Result<usize, RecorderError> {
    let mut removed = 0;

    if !root.exists() {
        return Ok(removed);
    }

    let (files, _) = walk(root).await?;
    for file in files {
        if !file.extension().map(|e| e == "mp4").unwrap_or(false) {
            continue;
        }
        let size = match fs::metadata(&file).await {
            Ok(m) => m.len(),
            Err(_) => continue,
        };
        if size < TINY_FILE_BYTES {
            match fs::remove_file(&file).await {
                Ok(()) => {
                    removed += 1;
                    info!(
                        "Cleaned up tiny video file: {} ({} bytes)",
                        file.display(),
                        size
                    );
                }
                Err(e) => warn!("Failed to remove tiny file {}: {}", file.display(), e),
            }
        }
    }

    Ok(removed)
}

/// Recursively collect all files and directories under `root`
async fn walk(root: &Path) -> Result<(Vec<PathBuf>, Vec<PathBuf>), RecorderError> {
    let mut files = Vec::new();
    let mut dirs = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = fs::read_dir(&dir).await.map_err(|e| RecorderError::Retention {
            details: format!("failed to read {}: {}", dir.display(), e),
        })?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| RecorderError::Retention {
                details: format!("failed to walk {}: {}", dir.display(), e),
            })?
        {
            let path = entry.path();
            if path.is_dir() {
                dirs.push(path.clone());
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }

    Ok((files, dirs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    /// Backdate a file's mtime by the given number of days
    fn age_file(path: &Path, days: u64) {
        let mtime = SystemTime::now() - Duration::from_secs(days * 86_400 + 3600);
        let times = std::fs::FileTimes::new().set_modified(mtime);
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_times(times)
            .unwrap();
    }

    fn write_mp4(dir: &Path, name: &str, bytes: usize) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, vec![0u8; bytes]).unwrap();
        path
    }

    #[tokio::test]
    async fn test_sweep_deletes_exactly_expired_files() {
        let tmp = tempfile::tempdir().unwrap();
        let hour_dir = tmp.path().join("2026_07").join("20260704").join("13");
        std::fs::create_dir_all(&hour_dir).unwrap();

        let old = write_mp4(&hour_dir, "partial_130000_00.mp4", 1000);
        let fresh = write_mp4(&hour_dir, "partial_133000_01.mp4", 1000);
        age_file(&old, 15);
        age_file(&fresh, 13);

        let result = sweep(tmp.path(), 14).await.unwrap();

        assert_eq!(result.files_deleted, 1);
        assert!(!old.exists());
        assert!(fresh.exists());
    }

    #[tokio::test]
    async fn test_sweep_removes_emptied_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let hour_dir = tmp.path().join("2025_01").join("20250101").join("03");
        std::fs::create_dir_all(&hour_dir).unwrap();
        let old = write_mp4(&hour_dir, "partial_030000_00.mp4", 1000);
        age_file(&old, 30);

        let result = sweep(tmp.path(), 14).await.unwrap();

        assert_eq!(result.files_deleted, 1);
        // The whole emptied date tree collapses
        assert!(result.dirs_removed >= 3);
        assert!(!tmp.path().join("2025_01").exists());
        // Root itself survives
        assert!(tmp.path().exists());
    }

    #[tokio::test]
    async fn test_sweep_ignores_non_video_files() {
        let tmp = tempfile::tempdir().unwrap();
        let note = tmp.path().join("README.txt");
        std::fs::write(&note, b"keep me").unwrap();
        age_file(&note, 100);

        let result = sweep(tmp.path(), 14).await.unwrap();
        assert_eq!(result.files_deleted, 0);
        assert!(note.exists());
    }

    #[tokio::test]
    async fn test_sweep_on_missing_root_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("nowhere");
        let result = sweep(&missing, 14).await.unwrap();
        assert_eq!(result.files_deleted, 0);
    }

    #[tokio::test]
    async fn test_cleanup_tiny_removes_only_small_videos() {
        let tmp = tempfile::tempdir().unwrap();
        let tiny = write_mp4(tmp.path(), "partial_000000_00.mp4", 512);
        let big = write_mp4(tmp.path(), "partial_000001_01.mp4", 200 * 1024);

        let removed = cleanup_tiny(tmp.path()).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!tiny.exists());
        assert!(big.exists());
    }

    #[tokio::test]
    async fn test_sweep_boundary_mix() {
        // Spec scenario S6 shape: half expired, half live
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("2026_06").join("20260620").join("10");
        std::fs::create_dir_all(&dir).unwrap();

        let mut old_files = Vec::new();
        let mut live_files = Vec::new();
        for i in 0..5 {
            let old = write_mp4(&dir, &format!("partial_1000{:02}_00.mp4", i), 1000);
            age_file(&old, 15);
            old_files.push(old);

            let live = write_mp4(&dir, &format!("partial_1030{:02}_01.mp4", i), 1000);
            age_file(&live, 13);
            live_files.push(live);
        }

        let result = sweep(tmp.path(), 14).await.unwrap();
        assert_eq!(result.files_deleted, 5);
        assert!(old_files.iter().all(|f| !f.exists()));
        assert!(live_files.iter().all(|f| f.exists()));
    }
}
