use crate::control::SystemState;
use crate::metrics::{sanitize, stdev};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Instant;

/// FPS history length: five minutes at the 1 Hz observation cadence
const FPS_HISTORY: usize = 300;
const STABILITY_WINDOW: usize = 30;
const ONE_MINUTE_WINDOW: usize = 60;

/// Statically typed performance record for the whole pipeline.
///
/// Written only by the processor worker and the ingest endpoint; read by
/// the streaming and status tasks under a short guarded section. The JSON
/// projection ([`StatsSnapshot`]) clamps every number to a finite value.
#[derive(Debug)]
pub struct PerformanceStats {
    pub fps: f64,
    pub min_fps_achieved: f64,
    pub max_fps_achieved: f64,
    pub avg_fps_1min: f64,
    pub fps_stability: f64,

    pub buffer_size: usize,
    pub buffer_utilization_pct: f64,

    /// Streaming-path processing latency, wall-clock milliseconds per frame
    pub latency_ms: f64,
    pub frame_processing_time_ms: f64,

    pub dropped_frames: u64,
    pub total_frames_dropped: u64,
    pub consecutive_drops: u32,
    pub total_frames_processed: u64,
    pub total_frames_sent: u64,
    pub avg_frame_quality: f64,

    pub quality_level: u8,
    pub compensation_factor: f64,
    pub system_state: SystemState,
    pub adaptation_confidence: f64,

    pub network_jitter: f64,
    pub packet_loss_rate: f64,
    pub predicted_latency: f64,
    pub congestion_level: f64,

    pub enhancement_mode: String,
    pub enhancement_time_ms: f64,
    pub quality_improvement: f64,

    pub stream_started: Instant,
    last_drop: Option<Instant>,
    fps_history: VecDeque<f64>,
}

impl PerformanceStats {
    pub fn new(initial_quality: u8) -> Self {
        Self {
            fps: 0.0,
            min_fps_achieved: f64::INFINITY,
            max_fps_achieved: 0.0,
            avg_fps_1min: 0.0,
            fps_stability: 1.0,
            buffer_size: 0,
            buffer_utilization_pct: 0.0,
            latency_ms: 0.0,
            frame_processing_time_ms: 0.0,
            dropped_frames: 0,
            total_frames_dropped: 0,
            consecutive_drops: 0,
            total_frames_processed: 0,
            total_frames_sent: 0,
            avg_frame_quality: 0.0,
            quality_level: initial_quality,
            compensation_factor: 1.0,
            system_state: SystemState::Optimal,
            adaptation_confidence: 1.0,
            network_jitter: 0.0,
            packet_loss_rate: 0.0,
            predicted_latency: 0.0,
            congestion_level: 0.0,
            enhancement_mode: "auto".to_string(),
            enhancement_time_ms: 0.0,
            quality_improvement: 0.0,
            stream_started: Instant::now(),
            last_drop: None,
            fps_history: VecDeque::with_capacity(FPS_HISTORY),
        }
    }

    /// Record one dropped frame; two drops within one second count as
    /// consecutive, otherwise the streak resets.
    pub fn record_drop(&mut self, now: Instant) {
        self.dropped_frames += 1;
        self.total_frames_dropped += 1;

        match self.last_drop {
            Some(previous) if now.duration_since(previous).as_secs_f64() < 1.0 => {
                self.consecutive_drops += 1;
            }
            _ => self.consecutive_drops = 0,
        }
        self.last_drop = Some(now);
    }

    /// Feed one FPS observation and refresh the derived FPS metrics.
    pub fn observe_fps(&mut self, fps: f64) {
        let fps = sanitize(fps, 0.0).max(0.0);
        self.fps = fps;

        if self.fps_history.len() >= FPS_HISTORY {
            self.fps_history.pop_front();
        }
        self.fps_history.push_back(fps);

        self.min_fps_achieved = self.min_fps_achieved.min(fps);
        self.max_fps_achieved = self.max_fps_achieved.max(fps);

        let recent: Vec<f64> = self
            .fps_history
            .iter()
            .rev()
            .take(STABILITY_WINDOW)
            .cloned()
            .collect();
        if recent.len() > 10 {
            let mean = recent.iter().sum::<f64>() / recent.len() as f64;
            self.fps_stability = if mean > 0.0 {
                (1.0 - stdev(&recent) / mean).clamp(0.0, 1.0)
            } else {
                0.0
            };
        }

        if self.fps_history.len() >= ONE_MINUTE_WINDOW {
            let minute: Vec<f64> = self
                .fps_history
                .iter()
                .rev()
                .take(ONE_MINUTE_WINDOW)
                .cloned()
                .collect();
            self.avg_fps_1min = minute.iter().sum::<f64>() / minute.len() as f64;
        }
    }

    /// Running mean of per-frame quality scores
    pub fn observe_frame_quality(&mut self, score: f64) {
        let n = self.total_frames_processed.max(1) as f64;
        self.avg_frame_quality = (self.avg_frame_quality * (n - 1.0) + score) / n;
    }

    pub fn frame_drop_rate_pct(&self) -> f64 {
        if self.total_frames_processed == 0 {
            return 0.0;
        }
        self.dropped_frames as f64 / self.total_frames_processed as f64 * 100.0
    }

    pub fn uptime_secs(&self) -> f64 {
        self.stream_started.elapsed().as_secs_f64()
    }

    /// Reset all counters; configuration-derived fields survive.
    pub fn reset(&mut self) {
        let quality = self.quality_level;
        *self = Self::new(quality);
    }

    /// Finite, serializable projection of the record
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            fps: round2(sanitize(self.fps, 0.0)),
            min_fps_achieved: round2(if self.min_fps_achieved.is_finite() {
                self.min_fps_achieved
            } else {
                0.0
            }),
            max_fps_achieved: round2(sanitize(self.max_fps_achieved, 0.0)),
            avg_fps_1min: round2(sanitize(self.avg_fps_1min, 0.0)),
            fps_stability: round3(sanitize(self.fps_stability, 0.0)),
            buffer_size: self.buffer_size,
            buffer_utilization_pct: round1(sanitize(self.buffer_utilization_pct, 0.0)),
            latency_ms: round2(sanitize(self.latency_ms, 0.0)),
            frame_processing_time_ms: round2(sanitize(self.frame_processing_time_ms, 0.0)),
            dropped_frames: self.dropped_frames,
            total_frames_dropped: self.total_frames_dropped,
            consecutive_drops: self.consecutive_drops,
            total_frames_processed: self.total_frames_processed,
            total_frames_sent: self.total_frames_sent,
            frame_drop_rate_pct: round2(sanitize(self.frame_drop_rate_pct(), 0.0)),
            avg_frame_quality: round2(sanitize(self.avg_frame_quality, 0.0)),
            quality_level: self.quality_level,
            compensation_factor: round3(sanitize(self.compensation_factor, 1.0)),
            system_state: self.system_state,
            adaptation_confidence: round3(sanitize(self.adaptation_confidence, 1.0)),
            network_jitter: round4(sanitize(self.network_jitter, 0.0)),
            packet_loss_rate: round3(sanitize(self.packet_loss_rate, 0.0)),
            predicted_latency: round4(sanitize(self.predicted_latency, 0.0)),
            congestion_level: round3(sanitize(self.congestion_level, 0.0)),
            enhancement_mode: self.enhancement_mode.clone(),
            enhancement_time_ms: round2(sanitize(self.enhancement_time_ms, 0.0)),
            quality_improvement: round3(sanitize(self.quality_improvement, 0.0)),
            stream_uptime_secs: round1(sanitize(self.uptime_secs(), 0.0)),
        }
    }
}

/// JSON projection of [`PerformanceStats`]; every float is finite.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub fps: f64,
    pub min_fps_achieved: f64,
    pub max_fps_achieved: f64,
    pub avg_fps_1min: f64,
    pub fps_stability: f64,
    pub buffer_size: usize,
    pub buffer_utilization_pct: f64,
    pub latency_ms: f64,
    pub frame_processing_time_ms: f64,
    pub dropped_frames: u64,
    pub total_frames_dropped: u64,
    pub consecutive_drops: u32,
    pub total_frames_processed: u64,
    pub total_frames_sent: u64,
    pub frame_drop_rate_pct: f64,
    pub avg_frame_quality: f64,
    pub quality_level: u8,
    pub compensation_factor: f64,
    pub system_state: SystemState,
    pub adaptation_confidence: f64,
    pub network_jitter: f64,
    pub packet_loss_rate: f64,
    pub predicted_latency: f64,
    pub congestion_level: f64,
    pub enhancement_mode: String,
    pub enhancement_time_ms: f64,
    pub quality_improvement: f64,
    pub stream_uptime_secs: f64,
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}
fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}
fn round4(v: f64) -> f64 {
    (v * 10000.0).round() / 10000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_drop_streak_tracking() {
        let mut stats = PerformanceStats::new(80);
        let t0 = Instant::now();

        stats.record_drop(t0);
        assert_eq!(stats.consecutive_drops, 0);

        // Second drop within a second extends the streak
        stats.record_drop(t0 + Duration::from_millis(300));
        assert_eq!(stats.consecutive_drops, 1);
        stats.record_drop(t0 + Duration::from_millis(600));
        assert_eq!(stats.consecutive_drops, 2);

        // A quiet gap resets it
        stats.record_drop(t0 + Duration::from_secs(5));
        assert_eq!(stats.consecutive_drops, 0);
        assert_eq!(stats.total_frames_dropped, 4);
    }

    #[test]
    fn test_fps_observation_tracks_extremes() {
        let mut stats = PerformanceStats::new(80);
        for fps in [28.0, 31.0, 25.0, 30.0] {
            stats.observe_fps(fps);
        }
        assert_eq!(stats.min_fps_achieved, 25.0);
        assert_eq!(stats.max_fps_achieved, 31.0);
        assert_eq!(stats.fps, 30.0);
    }

    #[test]
    fn test_stability_for_steady_and_erratic_fps() {
        let mut steady = PerformanceStats::new(80);
        for _ in 0..60 {
            steady.observe_fps(30.0);
        }
        assert!(steady.fps_stability > 0.95);

        let mut erratic = PerformanceStats::new(80);
        for i in 0..60 {
            erratic.observe_fps(if i % 2 == 0 { 5.0 } else { 30.0 });
        }
        assert!(erratic.fps_stability < 0.6);
    }

    #[test]
    fn test_snapshot_is_always_finite() {
        let mut stats = PerformanceStats::new(80);
        stats.network_jitter = f64::NAN;
        stats.predicted_latency = f64::INFINITY;
        stats.compensation_factor = f64::NEG_INFINITY;

        let snap = stats.snapshot();
        assert!(snap.network_jitter.is_finite());
        assert!(snap.predicted_latency.is_finite());
        assert!(snap.compensation_factor.is_finite());
        // min FPS before any observation projects as zero, not infinity
        assert_eq!(snap.min_fps_achieved, 0.0);

        // The projection must serialize cleanly
        let json = serde_json::to_string(&snap).unwrap();
        assert!(!json.contains("null"));
        assert!(!json.contains("NaN"));
    }

    #[test]
    fn test_running_quality_average() {
        let mut stats = PerformanceStats::new(80);
        stats.total_frames_processed = 1;
        stats.observe_frame_quality(40.0);
        stats.total_frames_processed = 2;
        stats.observe_frame_quality(60.0);
        assert!((stats.avg_frame_quality - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_reset_clears_counters() {
        let mut stats = PerformanceStats::new(80);
        stats.total_frames_processed = 100;
        stats.record_drop(Instant::now());
        stats.observe_fps(30.0);

        stats.reset();
        assert_eq!(stats.total_frames_processed, 0);
        assert_eq!(stats.dropped_frames, 0);
        assert_eq!(stats.fps, 0.0);
        assert_eq!(stats.quality_level, 80);
    }
}
