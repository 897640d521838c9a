use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{error, info, warn};

/// Directory layout for one recording hour:
/// `{root}/YYYY_MM/YYYYMMDD/HH/{complete_hours,partial_segments,merged_videos}/`
#[derive(Debug, Clone)]
pub struct HourLayout {
    pub hour_start: DateTime<Local>,
    pub hour_dir: PathBuf,
    pub complete_hours_dir: PathBuf,
    pub partial_segments_dir: PathBuf,
    pub merged_videos_dir: PathBuf,
    pub is_fallback: bool,
}

impl HourLayout {
    /// Seconds since this layout's hour began
    pub fn elapsed_secs(&self, now: DateTime<Local>) -> i64 {
        (now - self.hour_start).num_seconds()
    }
}

/// Create the directory tree for the hour containing `now`.
///
/// Falls back to `{root}/fallback/YYYYMMDD_HHMM` when the primary layout
/// cannot be created, and to the current working directory as a last
/// resort. Directory trouble never takes the recorder down.
pub async fn create_hour_layout(root: &Path, now: DateTime<Local>) -> HourLayout {
    let hour_start = now
        .date_naive()
        .and_hms_opt(chrono::Timelike::hour(&now), 0, 0)
        .and_then(|naive| naive.and_local_timezone(Local).single())
        .unwrap_or(now);

    let hour_dir = root
        .join(now.format("%Y_%m").to_string())
        .join(now.format("%Y%m%d").to_string())
        .join(now.format("%H").to_string());

    match build_layout(&hour_dir, hour_start, false).await {
        Ok(layout) => layout,
        Err(e) => {
            error!("Failed to create hour directory structure: {}", e);
            fallback_layout(root, now, hour_start).await
        }
    }
}

async fn fallback_layout(
    root: &Path,
    now: DateTime<Local>,
    hour_start: DateTime<Local>,
) -> HourLayout {
    let fallback_dir = root
        .join("fallback")
        .join(now.format("%Y%m%d_%H%M").to_string());

    match build_layout(&fallback_dir, hour_start, true).await {
        Ok(layout) => {
            warn!(
                "Using fallback directory structure: {}",
                fallback_dir.display()
            );
            layout
        }
        Err(e) => {
            error!("Fallback directory creation failed: {}", e);
            // Last resort: record into the working directory
            let cwd = PathBuf::from(".");
            HourLayout {
                hour_start,
                hour_dir: cwd.clone(),
                complete_hours_dir: cwd.clone(),
                partial_segments_dir: cwd.clone(),
                merged_videos_dir: cwd,
                is_fallback: true,
            }
        }
    }
}

async fn build_layout(
    hour_dir: &Path,
    hour_start: DateTime<Local>,
    is_fallback: bool,
) -> std::io::Result<HourLayout> {
    let complete_hours_dir = hour_dir.join("complete_hours");
    let partial_segments_dir = hour_dir.join("partial_segments");
    let merged_videos_dir = hour_dir.join("merged_videos");

    for dir in [
        hour_dir,
        &complete_hours_dir,
        &partial_segments_dir,
        &merged_videos_dir,
    ] {
        fs::create_dir_all(dir).await?;
    }

    info!("Recording hour directory ready: {}", hour_dir.display());

    Ok(HourLayout {
        hour_start,
        hour_dir: hour_dir.to_path_buf(),
        complete_hours_dir,
        partial_segments_dir,
        merged_videos_dir,
        is_fallback,
    })
}

/// File name for a partial or complete segment save
pub fn segment_file_name(
    is_complete: bool,
    start_time: &DateTime<Local>,
    segment_number: usize,
) -> String {
    let prefix = if is_complete { "complete" } else { "partial" };
    format!(
        "{}_{}_{:02}.mp4",
        prefix,
        start_time.format("%H%M%S"),
        segment_number
    )
}

/// File name for an in-hour merge output
pub fn merged_file_name(hour: u32, epoch_secs: u64) -> String {
    format!("merged_{:02}00_{}.mp4", hour, epoch_secs)
}

/// File name for a rewritten complete hour
pub fn complete_hour_file_name(date: &DateTime<Local>, hour: u32) -> String {
    format!(
        "complete_hour_{}_{:02}0000.mp4",
        date.format("%Y%m%d"),
        hour
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_layout_creates_all_subdirectories() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = create_hour_layout(tmp.path(), Local::now()).await;

        assert!(!layout.is_fallback);
        assert!(layout.complete_hours_dir.is_dir());
        assert!(layout.partial_segments_dir.is_dir());
        assert!(layout.merged_videos_dir.is_dir());
        assert!(layout.hour_dir.starts_with(tmp.path()));
    }

    #[tokio::test]
    async fn test_layout_path_shape() {
        let tmp = tempfile::tempdir().unwrap();
        let now = Local.with_ymd_and_hms(2026, 7, 4, 13, 30, 0).unwrap();
        let layout = create_hour_layout(tmp.path(), now).await;

        let expected = tmp.path().join("2026_07").join("20260704").join("13");
        assert_eq!(layout.hour_dir, expected);
        assert_eq!(layout.hour_start.format("%H%M%S").to_string(), "130000");
    }

    #[tokio::test]
    async fn test_fallback_when_primary_unwritable() {
        let tmp = tempfile::tempdir().unwrap();
        // A file where the layout wants a directory forces the fallback
        let root = tmp.path().join("root");
        tokio::fs::write(&root, b"not a directory").await.unwrap();

        let layout = create_hour_layout(&root, Local::now()).await;
        assert!(layout.is_fallback);
    }

    #[test]
    fn test_file_name_formats() {
        let at = Local.with_ymd_and_hms(2026, 7, 4, 13, 5, 9).unwrap();
        assert_eq!(segment_file_name(false, &at, 3), "partial_130509_03.mp4");
        assert_eq!(segment_file_name(true, &at, 0), "complete_130509_00.mp4");
        assert_eq!(merged_file_name(13, 1751629509), "merged_1300_1751629509.mp4");
        assert_eq!(
            complete_hour_file_name(&at, 13),
            "complete_hour_20260704_130000.mp4"
        );
    }

    #[test]
    fn test_elapsed_secs() {
        let start = Local.with_ymd_and_hms(2026, 7, 4, 13, 0, 0).unwrap();
        let layout = HourLayout {
            hour_start: start,
            hour_dir: PathBuf::new(),
            complete_hours_dir: PathBuf::new(),
            partial_segments_dir: PathBuf::new(),
            merged_videos_dir: PathBuf::new(),
            is_fallback: false,
        };
        let later = Local.with_ymd_and_hms(2026, 7, 4, 14, 0, 1).unwrap();
        assert_eq!(layout.elapsed_secs(later), 3601);
    }
}
