use crate::buffer::FrameBuffer;
use crate::config::CamgateConfig;
use crate::control::FrameRateController;
use crate::enhance::{EnhanceMode, EnhancerSettings};
use crate::frame::FrameEnvelope;
use crate::logfilter::LogGate;
use crate::queue::FramePriorityQueue;
use crate::stats::PerformanceStats;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shared handles wired at the composition root.
///
/// The processor worker is the only writer to `latest_frame`, the buffer
/// and the stats record; the streaming and status tasks read them under
/// short guarded sections. There are no other globals in the system.
pub struct PipelineShared {
    pub config: CamgateConfig,
    pub stats: RwLock<PerformanceStats>,
    pub latest_frame: RwLock<Option<FrameEnvelope>>,
    pub queue: FramePriorityQueue,
    pub buffer: FrameBuffer,
    pub frame_rate: Mutex<FrameRateController>,
    pub enhancer_settings: RwLock<EnhancerSettings>,
    pub log_gate: LogGate,
    pub sequence: AtomicU64,
    pub producers: AtomicUsize,
    pub viewers: AtomicUsize,
}

pub type SharedPipeline = Arc<PipelineShared>;

impl PipelineShared {
    pub fn new(config: CamgateConfig) -> SharedPipeline {
        let stream = &config.stream;
        let buffer = FrameBuffer::new(
            stream.buffer_capacity,
            stream.min_buffered_frames,
            Duration::from_secs_f64(stream.buffering_delay_secs),
            Duration::from_secs_f64(stream.max_buffering_time_secs),
        );
        let queue = FramePriorityQueue::new(stream.queue_capacity);
        let frame_rate = FrameRateController::new(stream.target_fps, stream.min_fps);

        let enhancer_settings = EnhancerSettings {
            mode: EnhanceMode::parse(&config.enhancer.mode).unwrap_or(EnhanceMode::Auto),
            enabled: config.enhancer.enabled,
            budget: Duration::from_millis(config.enhancer.budget_ms),
        };

        let initial_quality =
            ((config.quality.min_quality as u16 + config.quality.max_quality as u16) / 2 + 5)
                .min(config.quality.max_quality as u16) as u8;

        Arc::new(Self {
            stats: RwLock::new(PerformanceStats::new(initial_quality)),
            latest_frame: RwLock::new(None),
            queue,
            buffer,
            frame_rate: Mutex::new(frame_rate),
            enhancer_settings: RwLock::new(enhancer_settings),
            log_gate: LogGate::new(),
            sequence: AtomicU64::new(0),
            producers: AtomicUsize::new(0),
            viewers: AtomicUsize::new(0),
            config,
        })
    }

    /// Next ingest sequence number (strictly increasing)
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.load(Ordering::Relaxed)
    }

    pub fn producer_count(&self) -> usize {
        self.producers.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_state_construction() {
        let shared = PipelineShared::new(CamgateConfig::default());
        assert_eq!(shared.buffer.capacity(), 150);
        assert_eq!(shared.queue.capacity(), 100);
        assert_eq!(shared.viewer_count(), 0);
        assert!(shared.latest_frame.read().is_none());

        let settings = shared.enhancer_settings.read();
        assert_eq!(settings.mode, EnhanceMode::Auto);
        assert!(settings.enabled);
    }

    #[test]
    fn test_sequence_is_strictly_increasing() {
        let shared = PipelineShared::new(CamgateConfig::default());
        let a = shared.next_sequence();
        let b = shared.next_sequence();
        let c = shared.next_sequence();
        assert_eq!(b, a + 1);
        assert_eq!(c, b + 1);
    }

    #[test]
    fn test_initial_quality_between_bounds() {
        let shared = PipelineShared::new(CamgateConfig::default());
        let stats = shared.stats.read();
        assert!(stats.quality_level >= 60 && stats.quality_level <= 90);
    }
}
