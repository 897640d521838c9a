use crate::config::RecordingConfig;
use chrono::{DateTime, Local};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

/// Per-segment error ceiling and cooldown
const MAX_SEGMENT_ERRORS: u32 = 5;
const ERROR_COOLDOWN: Duration = Duration::from_secs(60);

/// JPEG compression factor used for the size estimate
const ESTIMATED_COMPRESSION: f64 = 0.15;

/// One recorded frame held by a segment: JPEG bytes plus capture time
#[derive(Debug, Clone)]
pub struct SegmentFrame {
    pub jpeg: Arc<Vec<u8>>,
    pub at: SystemTime,
}

/// Validation thresholds derived from the recording configuration
#[derive(Debug, Clone, Copy)]
pub struct SegmentLimits {
    pub min_frames: usize,
    pub min_duration_secs: f64,
    pub min_frames_per_second: u32,
    pub target_duration_secs: f64,
    pub max_duration_secs: f64,
    pub absolute_min_size_bytes: u64,
}

impl From<&RecordingConfig> for SegmentLimits {
    fn from(config: &RecordingConfig) -> Self {
        Self {
            min_frames: config.min_frames_per_segment,
            min_duration_secs: config.min_segment_duration_secs,
            min_frames_per_second: config.min_frames_per_second,
            target_duration_secs: config.target_segment_duration_secs,
            max_duration_secs: config.max_segment_duration_secs,
            absolute_min_size_bytes: config.absolute_min_segment_size_bytes,
        }
    }
}

/// A growing run of recorded frames destined for one on-disk video file.
///
/// A segment persists normally only once it is valid: enough frames, enough
/// duration, a plausible frame rate, and no cleanup flag. Undersized
/// segments either merge with same-hour peers or are force-saved during
/// disconnect recovery.
#[derive(Debug)]
pub struct VideoSegment {
    pub start_time: DateTime<Local>,
    pub segment_number: usize,
    pub file_path: Option<PathBuf>,
    pub is_complete: bool,
    pub cleanup_required: bool,

    frames: Vec<SegmentFrame>,
    frame_width: u32,
    frame_height: u32,
    valid_for_save: bool,
    error_count: u32,
    last_error: Option<Instant>,
    created: Instant,
    limits: SegmentLimits,
}

impl VideoSegment {
    pub fn new(start_time: DateTime<Local>, segment_number: usize, limits: SegmentLimits) -> Self {
        Self {
            start_time,
            segment_number,
            file_path: None,
            is_complete: false,
            cleanup_required: false,
            frames: Vec::new(),
            frame_width: 0,
            frame_height: 0,
            valid_for_save: false,
            error_count: 0,
            last_error: None,
            created: Instant::now(),
            limits,
        }
    }

    /// Append a validated frame. The caller performs pixel-level
    /// validation; this only records dimensions and refreshes the
    /// validity flags.
    pub fn add_frame(&mut self, jpeg: Arc<Vec<u8>>, width: u32, height: u32, at: SystemTime) {
        if self.frame_width == 0 {
            self.frame_width = width;
            self.frame_height = height;
        }
        self.frames.push(SegmentFrame { jpeg, at });
        self.update_validation();
    }

    /// Drop the most recent frame (corruption recovery path)
    pub fn drop_last_frame(&mut self) {
        if self.frames.pop().is_some() {
            debug!(
                segment = self.segment_number,
                "dropped last frame during recovery"
            );
            self.update_validation();
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> &[SegmentFrame] {
        &self.frames
    }

    pub fn take_frames(&mut self) -> Vec<SegmentFrame> {
        self.valid_for_save = false;
        std::mem::take(&mut self.frames)
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.frame_width, self.frame_height)
    }

    /// Actual duration: wall-clock span between first and last frame
    pub fn duration(&self) -> Duration {
        match (self.frames.first(), self.frames.last()) {
            (Some(first), Some(last)) => last
                .at
                .duration_since(first.at)
                .unwrap_or(Duration::ZERO),
            _ => Duration::ZERO,
        }
    }

    /// Rough on-disk size estimate in KB
    pub fn estimated_size_kb(&self) -> f64 {
        if self.frames.is_empty() || self.frame_width == 0 {
            return 0.0;
        }
        self.frames.len() as f64
            * self.frame_width as f64
            * self.frame_height as f64
            * 3.0
            * ESTIMATED_COMPRESSION
            / 1024.0
    }

    /// All strict requirements for a normal save
    pub fn is_ready_for_save(&self) -> bool {
        !self.cleanup_required && self.valid_for_save
    }

    /// Whether the current segment should be closed and a new one opened
    pub fn should_roll_over(&self) -> bool {
        if !self.valid_for_save || self.cleanup_required {
            return false;
        }
        let duration = self.duration().as_secs_f64();
        duration >= self.limits.target_duration_secs || duration >= self.limits.max_duration_secs
    }

    /// Non-empty but not yet valid and not condemned: a merge candidate
    pub fn can_be_merged(&self) -> bool {
        !self.frames.is_empty() && !self.valid_for_save && !self.cleanup_required
    }

    /// Segments sharing an hour key may be concatenated
    pub fn hour_key(&self) -> String {
        self.start_time.format("%Y%m%d_%H").to_string()
    }

    /// Merge urgency grows with age (minutes since creation)
    pub fn merge_priority(&self) -> u64 {
        self.created.elapsed().as_secs() / 60
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Count one write error; five within the cooldown window condemn the
    /// segment to cleanup.
    pub fn record_error(&mut self, context: &str) {
        let now = Instant::now();
        match self.last_error {
            Some(at) if now.duration_since(at) < ERROR_COOLDOWN => {
                self.error_count += 1;
            }
            _ => {
                self.error_count = 1;
            }
        }
        self.last_error = Some(now);

        warn!(
            segment = self.segment_number,
            context,
            errors = self.error_count,
            "segment error recorded"
        );

        if self.error_count >= MAX_SEGMENT_ERRORS {
            warn!(
                segment = self.segment_number,
                "segment exceeded error limit, marking for cleanup"
            );
            self.cleanup_required = true;
            self.update_validation();
        }
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    fn update_validation(&mut self) {
        let frame_count = self.frames.len();
        let duration = self.duration().as_secs_f64();

        self.valid_for_save = frame_count >= self.limits.min_frames
            && duration >= self.limits.min_duration_secs
            && frame_count as f64 >= self.limits.min_frames_per_second as f64 * duration
            && !self.cleanup_required;
    }

    /// Release all held frames and reset flags
    pub fn cleanup(&mut self) {
        self.frames.clear();
        self.is_complete = false;
        self.valid_for_save = false;
        self.cleanup_required = false;
        self.error_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limits() -> SegmentLimits {
        SegmentLimits {
            min_frames: 10,
            min_duration_secs: 5.0,
            min_frames_per_second: 1,
            target_duration_secs: 20.0,
            max_duration_secs: 60.0,
            absolute_min_size_bytes: 512_000,
        }
    }

    fn segment() -> VideoSegment {
        VideoSegment::new(Local::now(), 0, limits())
    }

    fn jpeg() -> Arc<Vec<u8>> {
        Arc::new(vec![0xFF, 0xD8, 0xFF, 0xD9])
    }

    fn fill(segment: &mut VideoSegment, frames: usize, span: Duration) {
        let start = SystemTime::now() - span;
        for i in 0..frames {
            let at = start + span.mul_f64(i as f64 / frames.max(2) as f64);
            segment.add_frame(jpeg(), 640, 480, at);
        }
    }

    #[test]
    fn test_empty_segment_not_ready() {
        let s = segment();
        assert!(!s.is_ready_for_save());
        assert!(!s.can_be_merged());
        assert_eq!(s.duration(), Duration::ZERO);
        assert_eq!(s.estimated_size_kb(), 0.0);
    }

    #[test]
    fn test_short_segment_is_merge_candidate() {
        let mut s = segment();
        fill(&mut s, 3, Duration::from_secs(1));
        assert!(!s.is_ready_for_save());
        assert!(s.can_be_merged());
    }

    #[test]
    fn test_segment_becomes_valid_with_enough_material() {
        let mut s = segment();
        fill(&mut s, 20, Duration::from_secs(10));
        assert!(s.is_ready_for_save());
        assert!(!s.can_be_merged());
    }

    #[test]
    fn test_frame_rate_floor_blocks_validity() {
        // 12 frames spread over 100 s: passes count and duration but fails
        // the frames >= fps_floor * duration check (1 fps floor needs 100)
        let mut s = segment();
        fill(&mut s, 12, Duration::from_secs(100));
        assert!(!s.is_ready_for_save());
        assert!(s.can_be_merged());
    }

    #[test]
    fn test_roll_over_requires_validity_and_duration() {
        let mut s = segment();
        fill(&mut s, 20, Duration::from_secs(10));
        assert!(!s.should_roll_over()); // valid but short of target

        let mut s = segment();
        fill(&mut s, 40, Duration::from_secs(25));
        assert!(s.should_roll_over()); // valid and past target duration
    }

    #[test]
    fn test_estimated_size() {
        let mut s = segment();
        fill(&mut s, 10, Duration::from_secs(5));
        // 10 * 640 * 480 * 3 * 0.15 / 1024 = 1350 KB
        assert!((s.estimated_size_kb() - 1350.0).abs() < 1.0);
    }

    #[test]
    fn test_error_escalation_condemns_segment() {
        let mut s = segment();
        fill(&mut s, 3, Duration::from_secs(1));

        for _ in 0..4 {
            s.record_error("write");
            assert!(!s.cleanup_required);
        }
        s.record_error("write");
        assert!(s.cleanup_required);
        // Condemned segments neither save nor merge
        assert!(!s.is_ready_for_save());
        assert!(!s.can_be_merged());
    }

    #[test]
    fn test_hour_key_format() {
        let start = Local::now();
        let s = VideoSegment::new(start, 0, limits());
        assert_eq!(s.hour_key(), start.format("%Y%m%d_%H").to_string());
    }

    #[test]
    fn test_drop_last_frame() {
        let mut s = segment();
        fill(&mut s, 5, Duration::from_secs(2));
        s.drop_last_frame();
        assert_eq!(s.frame_count(), 4);
    }

    #[test]
    fn test_cleanup_releases_frames() {
        let mut s = segment();
        fill(&mut s, 20, Duration::from_secs(10));
        s.cleanup();
        assert!(s.is_empty());
        assert!(!s.is_ready_for_save());
        assert_eq!(s.error_count(), 0);
    }
}
