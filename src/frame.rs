use image::RgbImage;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// One decoded camera frame plus pipeline metadata.
///
/// Envelopes are immutable after creation; the pixel matrix and JPEG bytes
/// are shared behind `Arc` so the buffer and the recorder can each hold an
/// independent copy without duplicating image data.
#[derive(Debug, Clone)]
pub struct FrameEnvelope {
    /// Decoded RGB8 pixel matrix
    pub pixels: Arc<RgbImage>,
    /// JPEG bytes matching `pixels`
    pub jpeg: Arc<Vec<u8>>,
    /// Producer wall-clock timestamp (receive time)
    pub timestamp: SystemTime,
    /// Monotonic receive instant, used for age and interval math
    pub received: Instant,
    /// Monotonic sequence number stamped at ingest
    pub sequence: u64,
    /// Time between receive-start and decode-complete
    pub network_delay: Duration,
    /// Quality score in [0, 100]
    pub quality_score: f64,
    /// Admission priority in [0, 1]; never recomputed after admission
    pub priority: f64,
    /// Encoded payload size in bytes
    pub byte_size: usize,
    /// Optional producer identity
    pub producer_id: Option<String>,
}

impl FrameEnvelope {
    /// Build an envelope at admission time.
    ///
    /// Priority is fixed here; later age dominance comes from buffer
    /// eviction and best-frame scoring, not from recomputing this value.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pixels: RgbImage,
        jpeg: Vec<u8>,
        sequence: u64,
        network_delay: Duration,
        quality_score: f64,
        producer_id: Option<String>,
    ) -> Self {
        let byte_size = jpeg.len();
        let priority = admission_priority(
            0.0,
            quality_score,
            network_delay.as_secs_f64(),
            pixel_bytes(&pixels),
        );

        Self {
            pixels: Arc::new(pixels),
            jpeg: Arc::new(jpeg),
            timestamp: SystemTime::now(),
            received: Instant::now(),
            sequence,
            network_delay,
            quality_score,
            priority,
            byte_size,
            producer_id,
        }
    }

    /// Derive a post-enhancement envelope: new pixels, new JPEG bytes, new
    /// quality score, everything else (sequence, timestamps, admission
    /// priority) carried over unchanged.
    pub fn with_enhanced(&self, pixels: RgbImage, jpeg: Vec<u8>, quality_score: f64) -> Self {
        let byte_size = jpeg.len();
        Self {
            pixels: Arc::new(pixels),
            jpeg: Arc::new(jpeg),
            timestamp: self.timestamp,
            received: self.received,
            sequence: self.sequence,
            network_delay: self.network_delay,
            quality_score,
            priority: self.priority,
            byte_size,
            producer_id: self.producer_id.clone(),
        }
    }

    /// Monotonic age of this frame
    pub fn age(&self) -> Duration {
        self.received.elapsed()
    }

    /// Monotonic age in fractional seconds
    pub fn age_secs(&self) -> f64 {
        self.received.elapsed().as_secs_f64()
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}

/// Raw pixel footprint of a decoded frame in bytes
fn pixel_bytes(pixels: &RgbImage) -> usize {
    pixels.as_raw().len()
}

/// Admission priority: weighted sum of exponentially decayed age,
/// normalized quality, inverse network delay, and inverse decoded size
/// (normalized to 1 MiB).
pub fn admission_priority(
    age_secs: f64,
    quality_score: f64,
    delay_secs: f64,
    decoded_size: usize,
) -> f64 {
    let age_factor = (-age_secs * 2.0).exp();
    let quality_factor = (quality_score / 100.0).clamp(0.0, 1.0);
    let delay_factor = (1.0 - delay_secs * 5.0).max(0.0);
    let size_factor = (1.0 - decoded_size as f64 / (1024.0 * 1024.0)).max(0.0);

    age_factor * 0.35 + quality_factor * 0.25 + delay_factor * 0.25 + size_factor * 0.15
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_envelope(sequence: u64, quality: f64) -> FrameEnvelope {
        let pixels = RgbImage::from_pixel(32, 32, image::Rgb([128, 128, 128]));
        FrameEnvelope::new(
            pixels,
            vec![0xFF, 0xD8, 0xFF, 0xD9],
            sequence,
            Duration::from_millis(5),
            quality,
            None,
        )
    }

    #[test]
    fn test_admission_priority_bounds() {
        // Fresh, perfect, instant, tiny frame scores near the weight sum
        let top = admission_priority(0.0, 100.0, 0.0, 0);
        assert!((top - 1.0).abs() < 1e-9);

        // Stale, poor, slow, huge frame collapses toward zero
        let bottom = admission_priority(30.0, 0.0, 1.0, 2 * 1024 * 1024);
        assert!(bottom < 0.01);

        // Priority is always within [0, 1]
        for &(age, q, d, s) in &[
            (0.0, 50.0, 0.1, 640 * 480 * 3),
            (5.0, 80.0, 0.0, 100_000),
            (0.5, 10.0, 0.5, 1_500_000),
        ] {
            let p = admission_priority(age, q, d, s);
            assert!((0.0..=1.0).contains(&p), "priority {} out of range", p);
        }
    }

    #[test]
    fn test_admission_priority_monotonic_in_quality() {
        let low = admission_priority(0.0, 20.0, 0.05, 500_000);
        let high = admission_priority(0.0, 90.0, 0.05, 500_000);
        assert!(high > low);
    }

    #[test]
    fn test_envelope_construction() {
        let env = test_envelope(7, 62.0);
        assert_eq!(env.sequence, 7);
        assert_eq!(env.quality_score, 62.0);
        assert_eq!(env.byte_size, 4);
        assert_eq!(env.width(), 32);
        assert_eq!(env.height(), 32);
        assert!(env.priority > 0.0 && env.priority <= 1.0);
    }

    #[test]
    fn test_enhanced_envelope_preserves_admission_metadata() {
        let env = test_envelope(3, 40.0);
        let enhanced_pixels = RgbImage::from_pixel(32, 32, image::Rgb([200, 200, 200]));
        let enhanced = env.with_enhanced(enhanced_pixels, vec![0xFF, 0xD8, 0x00, 0xFF, 0xD9], 75.0);

        assert_eq!(enhanced.sequence, env.sequence);
        assert_eq!(enhanced.timestamp, env.timestamp);
        // Admission priority is sticky; only quality changes
        assert_eq!(enhanced.priority, env.priority);
        assert_eq!(enhanced.quality_score, 75.0);
        assert_eq!(enhanced.byte_size, 5);
    }
}
