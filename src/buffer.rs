use crate::frame::FrameEnvelope;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::trace;

/// Buffering-gate status snapshot for the status API
#[derive(Debug, Clone)]
pub struct BufferingStatus {
    pub buffering_active: bool,
    pub buffered_frames: usize,
    pub min_required: usize,
    pub buffering_delay: Duration,
    pub time_since_last_stream: Duration,
    pub ready_to_stream: bool,
}

struct BufferInner {
    frames: Vec<FrameEnvelope>,
    buffering_active: bool,
    last_stream_time: Option<Instant>,
}

/// Fixed-capacity holding area of processed frames awaiting delivery.
///
/// Arrival order is monotone in producer timestamp; eviction under pressure
/// removes the lowest-priority frame first. The buffering gate holds back
/// viewers until enough material has accumulated to pace through short
/// underruns after the producer comes online.
pub struct FrameBuffer {
    inner: Mutex<BufferInner>,
    capacity: usize,
    min_buffered_frames: usize,
    buffering_delay: Duration,
    max_buffering_time: Duration,
}

impl FrameBuffer {
    pub fn new(
        capacity: usize,
        min_buffered_frames: usize,
        buffering_delay: Duration,
        max_buffering_time: Duration,
    ) -> Self {
        assert!(capacity > 0, "buffer capacity must be greater than 0");
        Self {
            inner: Mutex::new(BufferInner {
                frames: Vec::with_capacity(capacity),
                buffering_active: false,
                last_stream_time: None,
            }),
            capacity,
            min_buffered_frames,
            buffering_delay,
            max_buffering_time,
        }
    }

    /// Insert a processed frame, evicting the minimum-priority frame first
    /// when occupancy reaches 95% of capacity.
    pub fn add(&self, envelope: FrameEnvelope) {
        let mut inner = self.inner.lock();

        let pressure_threshold = (self.capacity as f64 * 0.95).ceil() as usize;
        if inner.frames.len() >= pressure_threshold {
            Self::evict_lowest_priority(&mut inner.frames);
        }
        // Hard invariant regardless of the pressure threshold
        while inner.frames.len() >= self.capacity {
            Self::evict_lowest_priority(&mut inner.frames);
        }

        let received = envelope.received;
        inner.frames.push(envelope);

        if inner.frames.len() >= self.min_buffered_frames && !inner.buffering_active {
            inner.buffering_active = true;
            inner.last_stream_time = Some(received);
            trace!(
                buffered = inner.frames.len(),
                "buffering gate armed"
            );
        }
    }

    /// Whether a viewer may begin (or resume) receiving frames.
    pub fn should_start_streaming(&self, now: Instant) -> bool {
        let inner = self.inner.lock();
        if !inner.buffering_active {
            return false;
        }

        let since_last = match inner.last_stream_time {
            Some(at) => now.saturating_duration_since(at),
            None => return false,
        };

        if inner.frames.len() >= self.min_buffered_frames && since_last >= self.buffering_delay {
            return true;
        }

        since_last >= self.max_buffering_time
    }

    /// Remove and return the best currently buffered frame.
    ///
    /// Best is the maximum of `0.5·priority + 0.3·quality + 0.2·age_factor`
    /// with `age_factor = 1 / (1 + 2·age_secs)`. This composite is distinct
    /// from the admission-priority formula by design.
    pub fn take_best(&self) -> Option<FrameEnvelope> {
        let mut inner = self.inner.lock();
        if inner.frames.is_empty() {
            return None;
        }

        let mut best_index = 0;
        let mut best_score = f64::MIN;
        for (i, frame) in inner.frames.iter().enumerate() {
            let age_factor = 1.0 / (1.0 + 2.0 * frame.age_secs());
            let score = frame.priority * 0.5 + frame.quality_score * 0.3 + age_factor * 0.2;
            if score > best_score {
                best_score = score;
                best_index = i;
            }
        }

        Some(inner.frames.remove(best_index))
    }

    /// Called after a frame has been delivered to a viewer.
    pub fn reset_buffering(&self) {
        let mut inner = self.inner.lock();
        inner.buffering_active = false;
        inner.last_stream_time = Some(Instant::now());
    }

    /// Occupancy as a fraction in [0, 1]
    pub fn utilization(&self) -> f64 {
        self.inner.lock().frames.len() as f64 / self.capacity as f64
    }

    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.frames.clear();
        inner.buffering_active = false;
        inner.last_stream_time = Some(Instant::now());
    }

    pub fn buffering_status(&self) -> BufferingStatus {
        let now = Instant::now();
        let ready = self.should_start_streaming(now);
        let inner = self.inner.lock();
        BufferingStatus {
            buffering_active: inner.buffering_active,
            buffered_frames: inner.frames.len(),
            min_required: self.min_buffered_frames,
            buffering_delay: self.buffering_delay,
            time_since_last_stream: inner
                .last_stream_time
                .map(|at| now.saturating_duration_since(at))
                .unwrap_or_default(),
            ready_to_stream: ready,
        }
    }

    fn evict_lowest_priority(frames: &mut Vec<FrameEnvelope>) {
        if frames.is_empty() {
            return;
        }
        let mut min_index = 0;
        let mut min_priority = f64::MAX;
        for (i, frame) in frames.iter().enumerate() {
            if frame.priority < min_priority {
                min_priority = frame.priority;
                min_index = i;
            }
        }
        let evicted = frames.remove(min_index);
        trace!(
            sequence = evicted.sequence,
            priority = evicted.priority,
            "evicted lowest-priority buffered frame"
        );
    }
}
