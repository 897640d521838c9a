use crate::enhance::{EnhanceReport, FrameEnhancer};
use crate::frame::FrameEnvelope;
use crate::metrics::NetworkMetrics;
use crate::quality;
use crate::recorder::{RecorderFrame, RecorderHandle};
use crate::state::SharedPipeline;
use crate::control::AdaptiveController;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Timestamps kept for FPS measurement (ten seconds at full rate)
const TIMESTAMP_WINDOW: usize = 300;

/// Cadence of FPS history/stability updates
const FPS_UPDATE_INTERVAL: Duration = Duration::from_millis(500);

/// The single pipeline worker between the priority queue and the delivery
/// side. Pops the highest-priority frame, enhances and rescores it,
/// publishes it to the buffer, the latest-frame slot and the recorder, and
/// ticks the adaptive controller.
pub struct Processor {
    shared: SharedPipeline,
    recorder: RecorderHandle,
    enhancer: Arc<dyn FrameEnhancer>,
    controller: AdaptiveController,
    metrics: NetworkMetrics,
    cancel: CancellationToken,

    frame_timestamps: VecDeque<Instant>,
    previous_frame: Option<Instant>,
    last_fps_update: Instant,
}

impl Processor {
    pub fn new(
        shared: SharedPipeline,
        recorder: RecorderHandle,
        enhancer: Arc<dyn FrameEnhancer>,
        cancel: CancellationToken,
    ) -> Self {
        let stream = &shared.config.stream;
        let quality_cfg = &shared.config.quality;
        let controller = AdaptiveController::new(
            stream.target_fps,
            quality_cfg.min_quality,
            quality_cfg.max_quality,
        );
        let metrics = NetworkMetrics::new(stream.target_fps);

        Self {
            shared,
            recorder,
            enhancer,
            controller,
            metrics,
            cancel,
            frame_timestamps: VecDeque::with_capacity(TIMESTAMP_WINDOW),
            previous_frame: None,
            last_fps_update: Instant::now(),
        }
    }

    pub fn spawn(
        shared: SharedPipeline,
        recorder: RecorderHandle,
        enhancer: Arc<dyn FrameEnhancer>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let processor = Self::new(shared, recorder, enhancer, cancel);
        tokio::spawn(processor.run())
    }

    async fn run(mut self) {
        info!("Frame processor started");

        loop {
            let envelope = tokio::select! {
                _ = self.cancel.cancelled() => break,
                envelope = self.shared.queue.pop_highest() => envelope,
            };

            self.process_envelope(envelope).await;

            // Drain faster when the buffer is under pressure
            let sleep = if self.shared.buffer.utilization() > 0.8 {
                Duration::from_micros(500)
            } else {
                Duration::from_millis(1)
            };
            tokio::time::sleep(sleep).await;
        }

        info!("Frame processor stopped");
    }

    async fn process_envelope(&mut self, envelope: FrameEnvelope) {
        let processing_start = Instant::now();

        let (enhanced_pixels, report, score, jpeg) = self.enhance_and_encode(&envelope).await;
        let enhanced = envelope.with_enhanced(enhanced_pixels, jpeg, score);

        // Publication order matters: latest first, then buffer, then the
        // recorder copy. The recorder path must never block this task.
        *self.shared.latest_frame.write() = Some(enhanced.clone());
        self.shared.buffer.add(enhanced.clone());
        self.recorder.offer_frame(RecorderFrame {
            pixels: Arc::clone(&enhanced.pixels),
            jpeg: Arc::clone(&enhanced.jpeg),
            at: enhanced.timestamp,
        });

        let now = Instant::now();
        let interval = self
            .previous_frame
            .map(|prev| now.duration_since(prev).as_secs_f64())
            .unwrap_or(0.0);
        self.previous_frame = Some(now);

        if interval > 0.0 {
            self.metrics.update(
                envelope.network_delay.as_secs_f64(),
                interval,
                envelope.byte_size,
            );
            self.shared.frame_rate.lock().record_interval(interval);
        }

        if self.frame_timestamps.len() >= TIMESTAMP_WINDOW {
            self.frame_timestamps.pop_front();
        }
        self.frame_timestamps.push_back(now);

        let fps = self.measured_fps(now);
        if now.duration_since(self.last_fps_update) >= FPS_UPDATE_INTERVAL {
            self.last_fps_update = now;
            self.shared.stats.write().observe_fps(fps);
            self.shared.frame_rate.lock().update_fps(fps);
        }

        let utilization = self.shared.buffer.utilization();
        let outputs = self.controller.adapt(fps, utilization, &self.metrics);
        self.shared
            .frame_rate
            .lock()
            .set_compensation(outputs.compensation);

        {
            let mut stats = self.shared.stats.write();
            stats.fps = fps;
            stats.total_frames_processed += 1;
            stats.observe_frame_quality(score);
            stats.buffer_size = self.shared.buffer.len();
            stats.buffer_utilization_pct = utilization * 100.0;
            stats.quality_level = outputs.quality;
            stats.compensation_factor = outputs.compensation;
            stats.system_state = outputs.state;
            stats.adaptation_confidence = outputs.confidence;
            stats.network_jitter = self.metrics.jitter;
            stats.packet_loss_rate = self.metrics.packet_loss_rate;
            stats.predicted_latency = self.metrics.predicted_latency;
            stats.congestion_level = self.metrics.congestion_level;
            stats.enhancement_mode = report.mode.as_str().to_string();
            stats.enhancement_time_ms = report.processing_time.as_secs_f64() * 1000.0;
            stats.quality_improvement = report.quality_improvement;
            stats.frame_processing_time_ms = processing_start.elapsed().as_secs_f64() * 1000.0;
        }

        debug!(
            sequence = enhanced.sequence,
            quality = outputs.quality,
            state = %outputs.state,
            "frame processed"
        );
    }

    /// Run the enhancer and the JPEG re-encode on the blocking pool.
    /// Failures fall back to the original pixels and payload.
    async fn enhance_and_encode(
        &self,
        envelope: &FrameEnvelope,
    ) -> (RgbImage, EnhanceReport, f64, Vec<u8>) {
        let settings = self.shared.enhancer_settings.read().clone();
        let fallback_mode = settings.mode;
        let enhancer = Arc::clone(&self.enhancer);
        let pixels = Arc::clone(&envelope.pixels);
        let encode_quality = self.shared.stats.read().quality_level;
        let original_score = envelope.quality_score;

        let worked = tokio::task::spawn_blocking(move || {
            let (enhanced, report) = if settings.enabled {
                enhancer.enhance(&pixels, settings.mode)
            } else {
                let passthrough = EnhanceReport {
                    mode: settings.mode,
                    processing_time: Duration::ZERO,
                    quality_improvement: 0.0,
                    budget_exhausted: false,
                };
                ((*pixels).clone(), passthrough)
            };

            let score = quality::score_frame(&enhanced);

            let mut jpeg = Vec::new();
            let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, encode_quality);
            let encoded = encoder.encode(
                enhanced.as_raw(),
                enhanced.width(),
                enhanced.height(),
                image::ColorType::Rgb8,
            );

            (enhanced, report, score, jpeg, encoded.is_ok())
        })
        .await;

        match worked {
            Ok((enhanced, report, score, jpeg, true)) => (enhanced, report, score, jpeg),
            Ok((_, report, _, _, false)) => {
                warn!("JPEG re-encode failed, passing original frame through");
                (
                    (*envelope.pixels).clone(),
                    report,
                    original_score,
                    (*envelope.jpeg).clone(),
                )
            }
            Err(e) => {
                warn!("enhancement task failed: {}, passing original through", e);
                let passthrough = EnhanceReport {
                    mode: fallback_mode,
                    processing_time: Duration::ZERO,
                    quality_improvement: 0.0,
                    budget_exhausted: false,
                };
                (
                    (*envelope.pixels).clone(),
                    passthrough,
                    original_score,
                    (*envelope.jpeg).clone(),
                )
            }
        }
    }

    fn measured_fps(&self, now: Instant) -> f64 {
        if self.frame_timestamps.len() < 2 {
            return 0.0;
        }
        let window = now
            .duration_since(*self.frame_timestamps.front().unwrap())
            .as_secs_f64();
        if window < 0.001 {
            return 0.0;
        }
        self.frame_timestamps.len() as f64 / window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CamgateConfig;
    use crate::enhance::AdaptiveEnhancer;
    use crate::recorder::RecorderService;
    use crate::state::PipelineShared;
    use image::Rgb;

    fn test_envelope(sequence: u64) -> FrameEnvelope {
        let pixels = RgbImage::from_fn(160, 120, |x, y| {
            let v = ((x * 2 + y * 3) % 255) as u8;
            Rgb([v, v / 2, v / 3])
        });
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, 85)
            .encode(pixels.as_raw(), 160, 120, image::ColorType::Rgb8)
            .unwrap();
        FrameEnvelope::new(pixels, jpeg, sequence, Duration::from_millis(5), 55.0, None)
    }

    fn test_processor(tmp: &std::path::Path) -> Processor {
        let mut config = CamgateConfig::default();
        config.recording.path = tmp.display().to_string();
        let shared = PipelineShared::new(config.clone());
        let cancel = CancellationToken::new();
        let (recorder, _join) = RecorderService::spawn(config.recording, cancel.child_token());
        let enhancer = Arc::new(AdaptiveEnhancer::new(Duration::from_millis(50)));
        Processor::new(shared, recorder, enhancer, cancel)
    }

    #[tokio::test]
    async fn test_processing_publishes_everywhere() {
        let tmp = tempfile::tempdir().unwrap();
        let p = test_processor(tmp.path());
        let mut p = p;

        p.process_envelope(test_envelope(0)).await;

        assert!(p.shared.latest_frame.read().is_some());
        assert_eq!(p.shared.buffer.len(), 1);
        let stats = p.shared.stats.read();
        assert_eq!(stats.total_frames_processed, 1);
        assert!(stats.quality_level >= 60 && stats.quality_level <= 90);
        assert!(stats.compensation_factor >= 0.3 && stats.compensation_factor <= 4.0);
    }

    #[tokio::test]
    async fn test_processing_preserves_sequence() {
        let tmp = tempfile::tempdir().unwrap();
        let mut p = test_processor(tmp.path());

        for seq in 0..3 {
            p.process_envelope(test_envelope(seq)).await;
        }

        let latest = p.shared.latest_frame.read().clone().unwrap();
        assert_eq!(latest.sequence, 2);
        assert_eq!(p.shared.buffer.len(), 3);
    }

    #[tokio::test]
    async fn test_disabled_enhancer_passes_frames_through() {
        let tmp = tempfile::tempdir().unwrap();
        let mut p = test_processor(tmp.path());
        p.shared.enhancer_settings.write().enabled = false;

        let envelope = test_envelope(0);
        let original = Arc::clone(&envelope.pixels);
        p.process_envelope(envelope).await;

        let latest = p.shared.latest_frame.read().clone().unwrap();
        assert_eq!(latest.pixels.as_raw(), original.as_raw());
    }

    #[tokio::test]
    async fn test_stats_stay_finite_after_processing() {
        let tmp = tempfile::tempdir().unwrap();
        let mut p = test_processor(tmp.path());

        for seq in 0..10 {
            p.process_envelope(test_envelope(seq)).await;
        }

        let snap = p.shared.stats.read().snapshot();
        assert!(snap.fps.is_finite());
        assert!(snap.network_jitter.is_finite());
        assert!(snap.compensation_factor.is_finite());
    }
}
